//! Recording stand-ins for the model and the visualizer

use crate::cell_data::CellData;
use crate::condition_encoder::ConditionEncoder;
use crate::config::FreezePolicy;
use crate::lupin_common::*;
use crate::model_backend::{ensure_conditions, ConditionalModel, ExtendOptions, FitOptions};
use crate::visualize::LatentVisualizer;

use candle_util::candle_cvae::CvaeConfig;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Construct {
        n_features: usize,
        n_conditions: usize,
    },
    Fit {
        retrain: bool,
        n_cells: usize,
        n_conditions: usize,
        warmup_epochs: usize,
        early_stop: usize,
        lr_reducer: usize,
        model_path: PathBuf,
    },
    Extend {
        n_conditions: usize,
        freeze: FreezePolicy,
        remove_dropout: bool,
    },
    Visualize {
        suffix: String,
        n_cells: usize,
        batches: Vec<Box<str>>,
    },
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

pub struct MockModel {
    n_conditions: usize,
    log: EventLog,
}

impl ConditionalModel for MockModel {
    type Context = EventLog;

    fn construct(log: &EventLog, config: CvaeConfig) -> anyhow::Result<Self> {
        log.borrow_mut().push(Event::Construct {
            n_features: config.n_features,
            n_conditions: config.n_conditions,
        });
        Ok(Self {
            n_conditions: config.n_conditions,
            log: log.clone(),
        })
    }

    fn n_conditions(&self) -> usize {
        self.n_conditions
    }

    fn fit(
        &mut self,
        train: &CellData,
        valid: &CellData,
        encoder: &ConditionEncoder,
        options: &FitOptions,
    ) -> anyhow::Result<()> {
        ensure_conditions(self, encoder)?;
        encoder.encode(&train.batches)?;
        encoder.encode(&valid.batches)?;
        self.log.borrow_mut().push(Event::Fit {
            retrain: options.retrain,
            n_cells: train.num_cells() + valid.num_cells(),
            n_conditions: self.n_conditions,
            warmup_epochs: options.warmup_epochs,
            early_stop: options.early_stop,
            lr_reducer: options.lr_reducer,
            model_path: options.model_path.clone(),
        });
        Ok(())
    }

    fn extend(self, options: &ExtendOptions) -> anyhow::Result<Self> {
        let n_conditions = self.n_conditions + options.new_conditions;
        self.log.borrow_mut().push(Event::Extend {
            n_conditions,
            freeze: options.freeze,
            remove_dropout: options.remove_dropout,
        });
        Ok(Self {
            n_conditions,
            log: self.log,
        })
    }

    fn project_to_latent(&self, x: &Mat, conditions: &[u32]) -> anyhow::Result<Mat> {
        if let Some(c) = conditions.iter().find(|&&c| c as usize >= self.n_conditions) {
            return Err(LupinError::UnknownCondition(c.to_string()).into());
        }
        Ok(x.columns(0, x.ncols().min(2)).into_owned())
    }
}

/// Projects the cells and records what it was asked to show
pub struct RecordingVisualizer {
    pub log: EventLog,
}

impl LatentVisualizer for RecordingVisualizer {
    fn visualize<M: ConditionalModel>(
        &mut self,
        model: &M,
        cells: &CellData,
        conditions: &[u32],
        suffix: &str,
    ) -> anyhow::Result<()> {
        let latent = model.project_to_latent(&cells.x, conditions)?;
        assert_eq!(latent.nrows(), cells.num_cells());
        self.log.borrow_mut().push(Event::Visualize {
            suffix: suffix.to_string(),
            n_cells: cells.num_cells(),
            batches: cells.distinct_batches(),
        });
        Ok(())
    }
}
