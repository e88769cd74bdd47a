use crate::cell_data::{distinct_in_order, CellData};
use crate::condition_encoder::ConditionEncoder;
use crate::config::RunConfig;
use crate::lupin_common::*;
use crate::model_backend::{ensure_conditions, ConditionalModel, ExtendOptions, FitOptions};
use crate::trainer::InitialFit;
use crate::visualize::LatentVisualizer;

/// Non-source batch labels in order of first appearance
pub fn target_batches(data: &CellData, run: &RunConfig) -> Vec<Box<str>> {
    distinct_in_order(&data.batches)
        .into_iter()
        .filter(|b| !run.dataset.is_source(b))
        .collect()
}

/// Where the loop ends up
pub struct SurgeryOutcome<M> {
    pub model: M,
    pub encoder: ConditionEncoder,
    pub visited: CellData,
    pub steps: usize,
}

/// Add the target batches of `data` to the model one at a time
///
/// Each step extends the model by one condition, fits it on the new
/// batch alone, and plots the latent space of every cell seen so far,
/// with and without the new batch.
pub fn run_surgery<M, V>(
    run: &RunConfig,
    data: &CellData,
    initial: InitialFit<M>,
    visualizer: &mut V,
) -> anyhow::Result<SurgeryOutcome<M>>
where
    M: ConditionalModel,
    V: LatentVisualizer,
{
    let InitialFit {
        mut model,
        mut encoder,
        source: mut visited,
    } = initial;

    let targets = target_batches(data, run);
    info!("{} target batches", targets.len());

    let hyper = &run.hyper;
    let freeze = run.freeze;

    for (idx, batch) in targets.iter().enumerate() {
        info!("[{}/{}] surgery with batch {}", idx + 1, targets.len(), batch);

        let incoming = data.filter_batches(|b| b == &**batch);
        let step_seed = run.seed.wrapping_add(idx as u64 + 1);
        let (train, valid) = incoming.train_valid_split(run.valid_frac, step_seed)?;

        model = model.extend(&ExtendOptions {
            new_conditions: 1,
            freeze,
            remove_dropout: true,
        })?;
        encoder.add(batch)?;
        ensure_conditions(&model, &encoder)?;

        let options = FitOptions {
            model_path: run.surgery_model_dir(idx, batch),
            retrain: true,
            save: true,
            early_stop: hyper.surgery_early_stop,
            lr_reducer: hyper.surgery_lr_reducer,
            warmup_epochs: if freeze.freeze { 0 } else { hyper.surgery_warmup },
            max_epochs: run.max_epochs,
            batch_size: hyper.batch_size,
            learning_rate: hyper.learning_rate,
            seed: step_seed,
        };
        model.fit(&train, &valid, &encoder, &options)?;

        visited = visited.concat(&incoming)?;
        info!(
            "visited {} cells in {} batches",
            visited.num_cells(),
            encoder.len()
        );

        let conditions = encoder.encode(&visited.batches)?;
        visualizer.visualize(
            &model,
            &visited,
            &conditions,
            &format!("_latent_({}:{})", idx, batch),
        )?;

        let old = visited.filter_batches(|b| b != &**batch);
        let conditions = encoder.encode(&old.batches)?;
        visualizer.visualize(&model, &old, &conditions, &format!("_latent_old_{}", idx))?;
    }

    Ok(SurgeryOutcome {
        model,
        encoder,
        visited,
        steps: targets.len(),
    })
}
