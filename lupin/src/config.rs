use crate::lupin_common::*;
use crate::registry::{self, DatasetDescriptor};

use candle_util::candle_cvae::{CvaeConfig, OutputActivation};
use candle_util::candle_loss_functions::LossKind;
use std::path::PathBuf;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Parser, Debug, Clone)]
#[command(
    version,
    about = "LUPIN",
    long_about = "Iterative surgery of a conditional VAE on single-cell batches\n\
		  (1) Train a conditional VAE on the source batches of a dataset\n\
		  (2) Extend the model by one condition for each remaining batch\n\
		  (3) Plot UMAP embeddings of the latent space after every step.\n"
)]
pub struct RunArgs {
    #[arg(
        long,
        short,
        required = true,
        help = "Dataset key",
        long_help = "Dataset key in the registry: pancreas, toy, pbmc.\n\
		     Data are read from {data-dir}/{name}/{name}_normalized.h5ad"
    )]
    pub data: Box<str>,

    #[arg(
        long = "freeze_level",
        alias = "freeze-level",
        short,
        required = true,
        allow_negative_numbers = true,
        help = "Freeze level (0, 1, 2)",
        long_help = "Which parameters stay fixed during surgery.\n\
		     0: train everything\n\
		     1: train the first layers and the new condition\n\
		     2: train the new condition only"
    )]
    pub freeze_level: i64,

    #[arg(
        long,
        short,
        default_value_t = 0,
        help = "Count data",
        long_help = "If positive, model raw counts with a negative binomial\n\
		     likelihood; otherwise use squared error."
    )]
    pub count: i64,

    #[arg(long, default_value = "./data", help = "Data directory")]
    pub data_dir: Box<str>,

    #[arg(long, default_value = "./results", help = "Results directory")]
    pub results_dir: Box<str>,

    #[arg(long, default_value = "./models", help = "Model checkpoint directory")]
    pub models_dir: Box<str>,

    #[arg(
        long,
        default_value_t = 0,
        help = "Random seed",
        long_help = "Random seed for train/validation splits, minibatches and UMAP."
    )]
    pub seed: u64,

    #[arg(
        long,
        default_value_t = 0.2,
        help = "Validation fraction",
        long_help = "Fraction of cells held out for validation in every fit."
    )]
    pub valid_frac: f32,

    #[arg(
        long,
        default_value_t = 10000,
        help = "Maximum number of epochs",
        long_help = "Upper bound on epochs for each fit; early stopping usually ends sooner."
    )]
    pub max_epochs: usize,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    pub device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or meta, we may want to choose a different device."
    )]
    pub device_no: usize,

    #[arg(
        long,
        short,
        help = "Verbosity",
        long_help = "Enable verbose output.\n\
		     Prints additional information during execution."
    )]
    pub verbose: bool,
}

/// Which parameters surgery keeps fixed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreezePolicy {
    pub freeze: bool,
    pub freeze_expression: bool,
}

pub fn resolve_freeze(level: i64) -> Result<FreezePolicy, LupinError> {
    let (freeze, freeze_expression) = match level {
        0 => (false, false),
        1 => (true, false),
        2 => (true, true),
        _ => return Err(LupinError::InvalidFreezeLevel(level)),
    };
    Ok(FreezePolicy {
        freeze,
        freeze_expression,
    })
}

/// Loss and gradient clipping bound
pub fn resolve_loss(count: i64) -> (LossKind, f64) {
    if count > 0 {
        (LossKind::Nb, 3.0)
    } else {
        (LossKind::Mse, 1e6)
    }
}

/// Fixed model and optimization settings
#[derive(Clone, Debug)]
pub struct TrainHyperParams {
    pub hidden_layers: Vec<usize>,
    pub z_dim: usize,
    pub learning_rate: f32,
    pub alpha: f64,
    pub eta: f64,
    pub dropout_rate: f32,
    pub output_activation: OutputActivation,
    pub use_batchnorm: bool,
    pub batch_size: usize,
    pub initial_early_stop: usize,
    pub initial_lr_reducer: usize,
    pub surgery_early_stop: usize,
    pub surgery_lr_reducer: usize,
    pub surgery_warmup: usize,
}

impl Default for TrainHyperParams {
    fn default() -> Self {
        Self {
            hidden_layers: vec![128],
            z_dim: 15,
            learning_rate: 1e-3,
            alpha: 1e-5,
            eta: 1.0,
            dropout_rate: 0.1,
            output_activation: OutputActivation::Relu,
            use_batchnorm: true,
            batch_size: 128,
            initial_early_stop: 100,
            initial_lr_reducer: 80,
            surgery_early_stop: 50,
            surgery_lr_reducer: 40,
            surgery_warmup: 300,
        }
    }
}

/// Everything a run needs, resolved before touching any file
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dataset: &'static DatasetDescriptor,
    pub loss: LossKind,
    pub clip_value: f64,
    pub freeze_level: i64,
    pub freeze: FreezePolicy,
    pub data_file: PathBuf,
    pub results_dir: PathBuf,
    pub model_root: PathBuf,
    pub seed: u64,
    pub valid_frac: f32,
    pub max_epochs: usize,
    pub hyper: TrainHyperParams,
}

pub fn resolve_run(args: &RunArgs) -> anyhow::Result<RunConfig> {
    let dataset = registry::lookup(&args.data).inspect_err(|_| {
        warn!("known datasets: {}", registry::keys().join(", "));
    })?;
    let freeze = resolve_freeze(args.freeze_level)?;
    let (loss, clip_value) = resolve_loss(args.count);

    if !(args.valid_frac > 0. && args.valid_frac < 1.) {
        anyhow::bail!("validation fraction must be in (0, 1): {}", args.valid_frac);
    }
    if args.max_epochs == 0 {
        anyhow::bail!("need at least one epoch");
    }

    let data_file = PathBuf::from(&*args.data_dir)
        .join(dataset.name)
        .join(format!("{}_normalized.h5ad", dataset.name));

    let results_dir = PathBuf::from(&*args.results_dir)
        .join("iterative_surgery")
        .join(format!(
            "{}-{}-freeze_level={}",
            dataset.name, loss, args.freeze_level
        ));

    let model_root = PathBuf::from(&*args.models_dir)
        .join("CVAE")
        .join("iterative_surgery");

    Ok(RunConfig {
        dataset,
        loss,
        clip_value,
        freeze_level: args.freeze_level,
        freeze,
        data_file,
        results_dir,
        model_root,
        seed: args.seed,
        valid_frac: args.valid_frac,
        max_epochs: args.max_epochs,
        hyper: TrainHyperParams::default(),
    })
}

impl RunConfig {
    /// Architecture of the first model
    pub fn cvae_config(&self, n_features: usize, n_conditions: usize) -> CvaeConfig {
        CvaeConfig {
            n_features,
            n_conditions,
            hidden_layers: self.hyper.hidden_layers.clone(),
            z_dim: self.hyper.z_dim,
            dropout_rate: self.hyper.dropout_rate,
            use_batchnorm: self.hyper.use_batchnorm,
            output_activation: self.hyper.output_activation,
            loss: self.loss,
            clip_value: self.clip_value,
            alpha: self.hyper.alpha,
            eta: self.hyper.eta,
            freeze_stats: false,
        }
    }

    /// `before-{name}-{loss}-{architecture}-{z_dim}`
    pub fn initial_model_dir(&self) -> PathBuf {
        let architecture = self.cvae_config(0, 0).architecture_name();
        self.model_root.join(format!(
            "before-{}-{}-{}-{}",
            self.dataset.name, self.loss, architecture, self.hyper.z_dim
        ))
    }

    /// `after-({idx}:{batch})-{name}-{loss}-{freeze}`
    pub fn surgery_model_dir(&self, idx: usize, batch: &str) -> PathBuf {
        let freeze = if self.freeze.freeze { "True" } else { "False" };
        self.model_root.join(format!(
            "after-({}:{})-{}-{}-{}",
            idx, batch, self.dataset.name, self.loss, freeze
        ))
    }
}

impl RunArgs {
    pub fn compute_device(&self) -> anyhow::Result<candle_core::Device> {
        Ok(match self.device {
            ComputeDevice::Metal => candle_core::Device::new_metal(self.device_no)?,
            ComputeDevice::Cuda => candle_core::Device::new_cuda(self.device_no)?,
            _ => candle_core::Device::Cpu,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn args(data: &str, freeze_level: i64, count: i64) -> RunArgs {
        RunArgs::parse_from([
            "lupin",
            "--data",
            data,
            "--freeze_level",
            &freeze_level.to_string(),
            "--count",
            &count.to_string(),
        ])
    }

    #[test]
    fn freeze_levels_map_to_flags() {
        assert_eq!(
            resolve_freeze(0).unwrap(),
            FreezePolicy {
                freeze: false,
                freeze_expression: false
            }
        );
        assert_eq!(
            resolve_freeze(1).unwrap(),
            FreezePolicy {
                freeze: true,
                freeze_expression: false
            }
        );
        assert_eq!(
            resolve_freeze(2).unwrap(),
            FreezePolicy {
                freeze: true,
                freeze_expression: true
            }
        );
        for level in [-1, 3, 100] {
            assert!(matches!(
                resolve_freeze(level),
                Err(LupinError::InvalidFreezeLevel(l)) if l == level
            ));
        }
    }

    #[test]
    fn count_selects_loss_and_clip() {
        assert_eq!(resolve_loss(0), (LossKind::Mse, 1e6));
        assert_eq!(resolve_loss(-3), (LossKind::Mse, 1e6));
        assert_eq!(resolve_loss(1), (LossKind::Nb, 3.0));
        assert_eq!(resolve_loss(7), (LossKind::Nb, 3.0));
    }

    #[test]
    fn run_paths_follow_the_layout() -> anyhow::Result<()> {
        let config = resolve_run(&args("pbmc", 1, 1))?;
        assert_eq!(
            config.data_file,
            PathBuf::from("./data/pbmc_subset/pbmc_subset_normalized.h5ad")
        );
        assert_eq!(
            config.results_dir,
            PathBuf::from("./results/iterative_surgery/pbmc_subset-nb-freeze_level=1")
        );
        assert_eq!(
            config.initial_model_dir(),
            PathBuf::from("./models/CVAE/iterative_surgery/before-pbmc_subset-nb-[128]-15")
        );
        assert_eq!(
            config.surgery_model_dir(0, "10x"),
            PathBuf::from("./models/CVAE/iterative_surgery/after-(0:10x)-pbmc_subset-nb-True")
        );
        assert_eq!(config.clip_value, 3.0);
        Ok(())
    }

    #[test]
    fn resolve_run_rejects_bad_inputs() {
        let err = resolve_run(&args("pbmc", 3, 0)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LupinError>(),
            Some(LupinError::InvalidFreezeLevel(3))
        ));

        let err = resolve_run(&args("unknown", 0, 0)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LupinError>(),
            Some(LupinError::DatasetNotFound(_))
        ));
    }

    #[test]
    fn fixed_hyperparameters() {
        let hyper = TrainHyperParams::default();
        assert_eq!(hyper.hidden_layers, vec![128]);
        assert_eq!(hyper.z_dim, 15);
        assert_eq!(hyper.batch_size, 128);
        assert_eq!(
            (hyper.initial_early_stop, hyper.initial_lr_reducer),
            (100, 80)
        );
        assert_eq!(
            (
                hyper.surgery_early_stop,
                hyper.surgery_lr_reducer,
                hyper.surgery_warmup
            ),
            (50, 40, 300)
        );
    }
}
