use crate::candle_cvae::CvaeModel;
use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;

use candle_core::backprop::GradStore;
use candle_core::{Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

/// Per-epoch record of a fit
#[derive(Debug, Default, Clone)]
pub struct TrainTrace {
    pub train_loss: Vec<f32>,
    pub valid_loss: Vec<f32>,
    pub learning_rate: Vec<f32>,
    pub stopped_early: bool,
}

impl TrainTrace {
    pub fn num_epochs(&self) -> usize {
        self.train_loss.len()
    }

    pub fn best_valid_loss(&self) -> Option<f32> {
        self.valid_loss
            .iter()
            .cloned()
            .filter(|x| x.is_finite())
            .reduce(f32::min)
    }
}

/// Early stopping and learning-rate reduction on a monitored loss
struct PlateauMonitor {
    best: f32,
    wait: usize,
    lr_wait: usize,
}

enum PlateauAction {
    Continue,
    ReduceLearningRate,
    Stop,
}

impl PlateauMonitor {
    fn new() -> Self {
        Self {
            best: f32::INFINITY,
            wait: 0,
            lr_wait: 0,
        }
    }

    fn update(&mut self, loss: f32, config: &TrainConfig) -> PlateauAction {
        if loss < self.best {
            self.best = loss;
            self.wait = 0;
            self.lr_wait = 0;
            return PlateauAction::Continue;
        }

        self.wait += 1;
        self.lr_wait += 1;

        if matches!(config.early_stop_limit, Some(limit) if self.wait >= limit) {
            return PlateauAction::Stop;
        }

        if matches!(config.lr_reducer, Some(patience) if self.lr_wait >= patience) {
            self.lr_wait = 0;
            return PlateauAction::ReduceLearningRate;
        }

        PlateauAction::Continue
    }
}

/// Clamp each gradient element into `[-clip, clip]`
pub fn clip_gradients(grads: &mut GradStore, vars: &[Var], clip: f64) -> Result<()> {
    for var in vars {
        let clipped = match grads.get(var.as_tensor()) {
            Some(g) => g.clamp(-clip, clip)?,
            None => continue,
        };
        grads.insert(var.as_tensor(), clipped);
    }
    Ok(())
}

/// Mean loss over all samples in eval mode
pub fn evaluate_loss<DataL>(
    model: &CvaeModel,
    data: &mut DataL,
    config: &TrainConfig,
) -> anyhow::Result<f32>
where
    DataL: DataLoader,
{
    data.shuffle_minibatch(config.batch_size)?;
    let mut loss_tot = 0f32;
    let mut ntot = 0usize;
    for b in 0..data.num_minibatch() {
        let mb = data.minibatch_data(b, &config.device)?;
        let n = mb.input.dims()[0];
        let (loss, _) = model.loss(&mb.input, &mb.condition, false)?;
        loss_tot += loss.to_scalar::<f32>()? * n as f32;
        ntot += n;
    }
    Ok(loss_tot / ntot.max(1) as f32)
}

/// Fit the trainable variables of a conditional VAE
///
/// * `train` - training data loader
/// * `valid` - validation data loader; if `None` the training loss is monitored
/// * `config` - training configuration
///
/// Each epoch visits every training sample once. Gradients are
/// clamped element-wise by the model's clip value before the AdamW
/// update. During warmup the learning rate grows linearly and the
/// plateau monitor is not updated.
pub fn train_cvae<DataL>(
    model: &CvaeModel,
    train: &mut DataL,
    mut valid: Option<&mut DataL>,
    config: &TrainConfig,
) -> anyhow::Result<TrainTrace>
where
    DataL: DataLoader,
{
    let vars: Vec<Var> = model
        .trainable_vars()?
        .into_iter()
        .map(|(_, v)| v)
        .collect();

    if vars.is_empty() {
        return Err(anyhow::anyhow!("no trainable variables"));
    }

    let base_lr = config.learning_rate as f64;
    let mut adam = AdamW::new(
        vars.clone(),
        ParamsAdamW {
            lr: base_lr,
            weight_decay: 0.,
            ..Default::default()
        },
    )?;

    let clip = model.config().clip_value;

    let pb = ProgressBar::new(config.num_epochs as u64);
    if !config.show_progress || config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut trace = TrainTrace::default();
    let mut monitor = PlateauMonitor::new();
    let mut lr = base_lr;

    for epoch in 0..config.num_epochs {
        if epoch < config.num_warmup_epochs {
            lr = base_lr * (epoch + 1) as f64 / config.num_warmup_epochs as f64;
            adam.set_learning_rate(lr);
        } else if epoch == config.num_warmup_epochs && epoch > 0 {
            lr = base_lr;
            adam.set_learning_rate(lr);
        }

        train.shuffle_minibatch(config.batch_size)?;

        let mut loss_tot = 0f32;
        let mut ntot = 0usize;
        for b in 0..train.num_minibatch() {
            let mb = train.minibatch_data(b, &config.device)?;
            let n = mb.input.dims()[0];
            let (loss, _) = model.loss(&mb.input, &mb.condition, true)?;
            let mut grads = loss.backward()?;
            clip_gradients(&mut grads, &vars, clip)?;
            adam.step(&grads)?;
            loss_tot += loss.to_scalar::<f32>()? * n as f32;
            ntot += n;
        }
        let train_loss = loss_tot / ntot.max(1) as f32;

        let valid_loss = match valid.as_deref_mut() {
            Some(valid) => evaluate_loss(model, valid, config)?,
            None => train_loss,
        };

        trace.train_loss.push(train_loss);
        trace.valid_loss.push(valid_loss);
        trace.learning_rate.push(lr as f32);
        pb.inc(1);

        if config.verbose {
            info!(
                "[{}] train loss: {:.4}, valid loss: {:.4}, lr: {:.2e}",
                epoch + 1,
                train_loss,
                valid_loss,
                lr
            );
        }

        if !valid_loss.is_finite() {
            log::warn!("non-finite validation loss at epoch {}", epoch + 1);
        }

        if epoch < config.num_warmup_epochs {
            continue;
        }

        match monitor.update(valid_loss, config) {
            PlateauAction::Stop => {
                info!(
                    "early stopping at epoch {}, best validation loss {:.4}",
                    epoch + 1,
                    monitor.best
                );
                trace.stopped_early = true;
                break;
            }
            PlateauAction::ReduceLearningRate => {
                lr *= config.lr_reduce_factor;
                adam.set_learning_rate(lr);
                info!("reducing learning rate to {:.2e} at epoch {}", lr, epoch + 1);
            }
            PlateauAction::Continue => {}
        }
    } // each epoch

    pb.finish_and_clear();
    Ok(trace)
}
