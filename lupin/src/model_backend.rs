use crate::cell_data::CellData;
use crate::condition_encoder::ConditionEncoder;
use crate::config::FreezePolicy;
use crate::lupin_common::*;

use candle_core::Device;
use candle_util::candle_checkpoint::*;
use candle_util::candle_cvae::{CvaeConfig, CvaeModel};
use candle_util::candle_data_loader::{InMemoryData, RowsToTensor, TensorToMatrix};
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_surgery::{extend_conditions, SurgeryArgs};
use candle_util::candle_vae_inference::{train_cvae, TrainTrace};
use matrix_util::traits::IoOps;
use std::path::{Path, PathBuf};

pub const TRACE_FILE: &str = "training_trace.parquet";

/// How one fit runs and where its checkpoint goes
#[derive(Clone, Debug)]
pub struct FitOptions {
    pub model_path: PathBuf,
    /// `false`: reuse a matching checkpoint at `model_path` instead of training
    pub retrain: bool,
    pub save: bool,
    pub early_stop: usize,
    pub lr_reducer: usize,
    pub warmup_epochs: usize,
    pub max_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub seed: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct ExtendOptions {
    pub new_conditions: usize,
    pub freeze: FreezePolicy,
    pub remove_dropout: bool,
}

/// A conditional generative model the surgery loop can drive
pub trait ConditionalModel: Sized {
    /// whatever is shared by all models of a run, e.g., a device
    type Context;

    fn construct(ctx: &Self::Context, config: CvaeConfig) -> anyhow::Result<Self>;

    fn n_conditions(&self) -> usize;

    fn fit(
        &mut self,
        train: &CellData,
        valid: &CellData,
        encoder: &ConditionEncoder,
        options: &FitOptions,
    ) -> anyhow::Result<()>;

    /// Consume the model and return one with more conditions
    fn extend(self, options: &ExtendOptions) -> anyhow::Result<Self>;

    /// Latent means (cells x latent)
    fn project_to_latent(&self, x: &Mat, conditions: &[u32]) -> anyhow::Result<Mat>;
}

/// Model and encoder must agree on the number of conditions
pub fn ensure_conditions<M: ConditionalModel>(
    model: &M,
    encoder: &ConditionEncoder,
) -> Result<(), LupinError> {
    if model.n_conditions() != encoder.len() {
        return Err(LupinError::ConditionCountMismatch {
            model: model.n_conditions(),
            encoder: encoder.len(),
        });
    }
    Ok(())
}

pub struct CvaeContext {
    pub device: Device,
    pub verbose: bool,
}

/// `ConditionalModel` backed by `candle_util::CvaeModel`
pub struct CvaeBackend {
    model: CvaeModel,
    verbose: bool,
    last_trace: Option<TrainTrace>,
}

impl CvaeBackend {
    #[cfg(test)]
    pub fn model(&self) -> &CvaeModel {
        &self.model
    }

    #[cfg(test)]
    pub fn last_trace(&self) -> Option<&TrainTrace> {
        self.last_trace.as_ref()
    }

    /// Reuse the checkpoint in `dir` if it was trained with the same
    /// architecture and the same label-to-condition assignment
    fn try_restore(&mut self, dir: &Path, encoder: &ConditionEncoder) -> anyhow::Result<bool> {
        if !has_checkpoint(dir) {
            return Ok(false);
        }
        if read_cvae_config(dir)? != *self.model.config() {
            warn!(
                "checkpoint at {} has a different architecture; training from scratch",
                dir.display()
            );
            return Ok(false);
        }
        match ConditionEncoder::load(dir) {
            Ok(saved) if saved.labels() == encoder.labels() => {}
            Ok(saved) => {
                warn!(
                    "checkpoint at {} was trained on conditions [{}]; training from scratch",
                    dir.display(),
                    saved.labels().join(", ")
                );
                return Ok(false);
            }
            Err(err) => {
                warn!(
                    "no usable condition encoder at {} ({}); training from scratch",
                    dir.display(),
                    err
                );
                return Ok(false);
            }
        }
        self.model = load_cvae(dir, self.model.device())?;
        Ok(true)
    }

    fn save(&self, dir: &Path, encoder: &ConditionEncoder) -> anyhow::Result<()> {
        save_cvae(&self.model, dir)?;
        encoder.save(dir)?;

        if let Some(trace) = self.last_trace.as_ref() {
            let nepochs = trace.num_epochs();
            let mut mat = Mat::zeros(nepochs, 3);
            for e in 0..nepochs {
                mat[(e, 0)] = trace.train_loss[e];
                mat[(e, 1)] = trace.valid_loss[e];
                mat[(e, 2)] = trace.learning_rate[e];
            }
            let epochs: Vec<Box<str>> = (1..=nepochs).map(|e| e.to_string().into()).collect();
            let names: Vec<Box<str>> = vec!["train_loss".into(), "valid_loss".into(), "lr".into()];
            let file = dir.join(TRACE_FILE);
            mat.to_parquet_with_names(
                matrix_util::common_io::path_str(&file)?,
                (Some(epochs.as_slice()), Some("epoch")),
                Some(names.as_slice()),
            )?;
        }
        Ok(())
    }
}

fn check_labels(conditions: &[u32], n_conditions: usize) -> Result<(), LupinError> {
    match conditions.iter().find(|&&c| c as usize >= n_conditions) {
        Some(c) => Err(LupinError::UnknownCondition(format!(
            "index {} (model has {} conditions)",
            c, n_conditions
        ))),
        None => Ok(()),
    }
}

impl ConditionalModel for CvaeBackend {
    type Context = CvaeContext;

    fn construct(ctx: &CvaeContext, config: CvaeConfig) -> anyhow::Result<Self> {
        info!(
            "CVAE: {} features, {} conditions, hidden {}, latent {}, loss {}",
            config.n_features,
            config.n_conditions,
            config.architecture_name(),
            config.z_dim,
            config.loss
        );
        Ok(Self {
            model: CvaeModel::new(config, &ctx.device)?,
            verbose: ctx.verbose,
            last_trace: None,
        })
    }

    fn n_conditions(&self) -> usize {
        self.model.num_conditions()
    }

    fn fit(
        &mut self,
        train: &CellData,
        valid: &CellData,
        encoder: &ConditionEncoder,
        options: &FitOptions,
    ) -> anyhow::Result<()> {
        ensure_conditions(self, encoder)?;

        if !options.retrain && self.try_restore(&options.model_path, encoder)? {
            info!(
                "restored trained model from {}; skipping training",
                options.model_path.display()
            );
            return Ok(());
        }

        let train_c = encoder.encode(&train.batches)?;
        let valid_c = encoder.encode(&valid.batches)?;

        let mut train_data = InMemoryData::new(&train.x, &train_c, options.seed)?;
        let mut valid_data = InMemoryData::new(&valid.x, &valid_c, options.seed.wrapping_add(1))?;

        let train_config = TrainConfig {
            learning_rate: options.learning_rate,
            batch_size: options.batch_size,
            num_epochs: options.max_epochs,
            num_warmup_epochs: options.warmup_epochs,
            early_stop_limit: Some(options.early_stop),
            lr_reducer: Some(options.lr_reducer),
            device: self.model.device().clone(),
            verbose: self.verbose,
            seed: options.seed,
            ..Default::default()
        };

        info!(
            "fitting on {} cells, validating on {} cells",
            train.num_cells(),
            valid.num_cells()
        );

        let trace = train_cvae(
            &self.model,
            &mut train_data,
            Some(&mut valid_data),
            &train_config,
        )?;

        info!(
            "{} epochs, best validation loss {:.4}",
            trace.num_epochs(),
            trace.best_valid_loss().unwrap_or(f32::NAN)
        );
        self.last_trace = Some(trace);

        if options.save {
            self.save(&options.model_path, encoder)?;
        }
        Ok(())
    }

    fn extend(self, options: &ExtendOptions) -> anyhow::Result<Self> {
        let args = SurgeryArgs {
            new_conditions: options.new_conditions,
            freeze: options.freeze.freeze,
            freeze_expression: options.freeze.freeze_expression,
            remove_dropout: options.remove_dropout,
        };
        let model = extend_conditions(self.model, &args)?;
        info!(
            "extended model to {} conditions, {} trainable variables",
            model.num_conditions(),
            model.trainable_names().len()
        );
        Ok(Self {
            model,
            verbose: self.verbose,
            last_trace: None,
        })
    }

    fn project_to_latent(&self, x: &Mat, conditions: &[u32]) -> anyhow::Result<Mat> {
        check_labels(conditions, self.n_conditions())?;
        if conditions.len() != x.nrows() {
            anyhow::bail!("{} labels for {} cells", conditions.len(), x.nrows());
        }

        let device = self.model.device();
        let x_nd = x.rows_to_tensor(device)?;
        let c_n = candle_core::Tensor::from_slice(conditions, conditions.len(), device)?;
        Ok(self.model.latent_mean(&x_nd, &c_n)?.to_dmatrix()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell_data::tests::toy_cells;
    use crate::config::{resolve_freeze, resolve_run, tests::args};

    fn context() -> CvaeContext {
        CvaeContext {
            device: Device::Cpu,
            verbose: false,
        }
    }

    fn small_fit(dir: &Path, retrain: bool) -> FitOptions {
        FitOptions {
            model_path: dir.to_path_buf(),
            retrain,
            save: true,
            early_stop: 5,
            lr_reducer: 3,
            warmup_epochs: 0,
            max_epochs: 4,
            batch_size: 8,
            learning_rate: 1e-2,
            seed: 1,
        }
    }

    #[test]
    fn fit_saves_and_restores_checkpoint() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = resolve_run(&args("toy", 0, 0))?;
        let cells = toy_cells(&[("Batch1", 12), ("Batch2", 12)], 6);
        let encoder = ConditionEncoder::from_labels(&cells.batches);
        let (train, valid) = cells.train_valid_split(0.25, 0)?;

        let mut model = CvaeBackend::construct(&context(), run.cvae_config(6, 2))?;
        model.fit(&train, &valid, &encoder, &small_fit(dir.path(), true))?;
        assert!(model.last_trace().is_some());
        assert!(dir.path().join(TRACE_FILE).is_file());
        assert!(dir.path().join(crate::condition_encoder::ENCODER_FILE).is_file());

        let c = encoder.encode(&cells.batches)?;
        let z = model.project_to_latent(&cells.x, &c)?;
        assert_eq!(z.shape(), (24, 15));

        // an untrained model of the same architecture picks up the saved weights
        let mut fresh = CvaeBackend::construct(&context(), run.cvae_config(6, 2))?;
        fresh.fit(&train, &valid, &encoder, &small_fit(dir.path(), false))?;
        assert!(fresh.last_trace().is_none());
        let z2 = fresh.project_to_latent(&cells.x, &c)?;
        let max_diff = z.iter().zip(z2.iter()).map(|(a, b)| (a - b).abs()).fold(0f32, f32::max);
        approx::assert_abs_diff_eq!(max_diff, 0., epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn checkpoint_of_other_condition_order_is_retrained() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = resolve_run(&args("toy", 0, 0))?;
        let cells = toy_cells(&[("Batch1", 12), ("Batch2", 12)], 6);
        let encoder = ConditionEncoder::from_labels(&cells.batches);
        let (train, valid) = cells.train_valid_split(0.25, 0)?;

        let mut model = CvaeBackend::construct(&context(), run.cvae_config(6, 2))?;
        model.fit(&train, &valid, &encoder, &small_fit(dir.path(), true))?;

        let swapped = ConditionEncoder::from_labels(&[Box::from("Batch2"), Box::from("Batch1")]);
        let mut fresh = CvaeBackend::construct(&context(), run.cvae_config(6, 2))?;
        fresh.fit(&train, &valid, &swapped, &small_fit(dir.path(), false))?;
        assert!(fresh.last_trace().is_some());

        // the new checkpoint carries the new order
        let saved = ConditionEncoder::load(dir.path())?;
        assert_eq!(saved.labels(), swapped.labels());
        Ok(())
    }

    #[test]
    fn checkpoint_without_encoder_is_retrained() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = resolve_run(&args("toy", 0, 0))?;
        let cells = toy_cells(&[("Batch1", 12), ("Batch2", 12)], 6);
        let encoder = ConditionEncoder::from_labels(&cells.batches);
        let (train, valid) = cells.train_valid_split(0.25, 0)?;

        let mut model = CvaeBackend::construct(&context(), run.cvae_config(6, 2))?;
        model.fit(&train, &valid, &encoder, &small_fit(dir.path(), true))?;
        std::fs::remove_file(dir.path().join(crate::condition_encoder::ENCODER_FILE))?;

        let mut fresh = CvaeBackend::construct(&context(), run.cvae_config(6, 2))?;
        fresh.fit(&train, &valid, &encoder, &small_fit(dir.path(), false))?;
        assert!(fresh.last_trace().is_some());
        Ok(())
    }

    #[test]
    fn condition_counts_must_agree() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = resolve_run(&args("toy", 0, 0))?;
        let cells = toy_cells(&[("Batch1", 6), ("Batch2", 6)], 4);
        let encoder = ConditionEncoder::from_labels(&cells.batches);
        let (train, valid) = cells.train_valid_split(0.25, 0)?;

        let mut model = CvaeBackend::construct(&context(), run.cvae_config(4, 3))?;
        let err = model
            .fit(&train, &valid, &encoder, &small_fit(dir.path(), true))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LupinError>(),
            Some(LupinError::ConditionCountMismatch {
                model: 3,
                encoder: 2
            })
        ));
        Ok(())
    }

    #[test]
    fn extend_adds_one_condition() -> anyhow::Result<()> {
        let run = resolve_run(&args("toy", 1, 1))?;
        let cells = toy_cells(&[("Batch1", 5), ("Batch8", 5)], 4);
        let model = CvaeBackend::construct(&context(), run.cvae_config(4, 1))?;
        let extended = model.extend(&ExtendOptions {
            new_conditions: 1,
            freeze: resolve_freeze(1)?,
            remove_dropout: true,
        })?;
        assert_eq!(extended.n_conditions(), 2);
        assert_eq!(extended.model().config().dropout_rate, 0.);

        let mut encoder = ConditionEncoder::from_labels(&[Box::from("Batch1")]);
        encoder.add("Batch8")?;
        ensure_conditions(&extended, &encoder)?;

        let z = extended.project_to_latent(&cells.x, &encoder.encode(&cells.batches)?)?;
        assert_eq!(z.nrows(), 10);

        assert!(extended.project_to_latent(&cells.x, &[2; 10]).is_err());
        Ok(())
    }
}
