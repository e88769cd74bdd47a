use crate::cell_data::CellData;
use crate::condition_encoder::ConditionEncoder;
use crate::config::RunConfig;
use crate::lupin_common::*;
use crate::model_backend::{ensure_conditions, ConditionalModel, FitOptions};

/// A model fitted on the source batches
pub struct InitialFit<M> {
    pub model: M,
    pub encoder: ConditionEncoder,
    /// cells of the source batches
    pub source: CellData,
}

/// Build and fit the first model on the source batches of `data`
///
/// A checkpoint already present under `RunConfig::initial_model_dir`
/// with the same architecture is reused instead of training again.
pub fn train_initial<M: ConditionalModel>(
    ctx: &M::Context,
    run: &RunConfig,
    data: &CellData,
) -> anyhow::Result<InitialFit<M>> {
    let source = data.filter_batches(|b| run.dataset.is_source(b));
    if source.num_cells() == 0 {
        anyhow::bail!(
            "no cells of the source batches {:?} in column `{}`",
            run.dataset.source,
            run.dataset.batch_key
        );
    }

    let (train, valid) = source.train_valid_split(run.valid_frac, run.seed)?;

    let encoder = ConditionEncoder::from_labels(&source.batches);
    info!(
        "source batches ({}): {}",
        encoder.len(),
        encoder
            .labels()
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut model = M::construct(ctx, run.cvae_config(source.num_genes(), encoder.len()))?;
    ensure_conditions(&model, &encoder)?;

    let hyper = &run.hyper;
    let options = FitOptions {
        model_path: run.initial_model_dir(),
        retrain: false,
        save: true,
        early_stop: hyper.initial_early_stop,
        lr_reducer: hyper.initial_lr_reducer,
        warmup_epochs: 0,
        max_epochs: run.max_epochs,
        batch_size: hyper.batch_size,
        learning_rate: hyper.learning_rate,
        seed: run.seed,
    };
    model.fit(&train, &valid, &encoder, &options)?;

    Ok(InitialFit {
        model,
        encoder,
        source,
    })
}
