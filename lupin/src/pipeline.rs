use crate::cell_data::CellData;
use crate::config::{resolve_run, RunArgs, RunConfig};
use crate::h5ad_io::read_h5ad;
use crate::lupin_common::*;
use crate::model_backend::{ConditionalModel, CvaeBackend, CvaeContext};
use crate::surgery_loop::{run_surgery, SurgeryOutcome};
use crate::trainer::train_initial;
use crate::visualize::{LatentVisualizer, UmapVisualizer};

/// Initial fit, first plot, then one surgery step per target batch
pub fn run_on_cells<M, V>(
    run: &RunConfig,
    ctx: &M::Context,
    data: &CellData,
    visualizer: &mut V,
) -> anyhow::Result<SurgeryOutcome<M>>
where
    M: ConditionalModel,
    V: LatentVisualizer,
{
    let initial = train_initial::<M>(ctx, run, data)?;

    let conditions = initial.encoder.encode(&initial.source.batches)?;
    visualizer.visualize(&initial.model, &initial.source, &conditions, "_latent_first")?;

    run_surgery(run, data, initial, visualizer)
}

/// Everything behind the command line
pub fn run_lupin(args: &RunArgs) -> anyhow::Result<()> {
    // resolve before touching any file
    let run = resolve_run(args)?;
    info!(
        "dataset {} ({}), loss {} (clip {}), freeze {:?}",
        run.dataset.name,
        run.data_file.display(),
        run.loss,
        run.clip_value,
        run.freeze
    );

    let device = args.compute_device()?;
    if !device.is_cpu() {
        device.set_seed(args.seed)?;
    }

    let data = read_h5ad(
        &run.data_file,
        run.dataset.batch_key,
        run.dataset.cell_type_key,
    )?;

    std::fs::create_dir_all(&run.results_dir)?;

    let ctx = CvaeContext {
        device,
        verbose: args.verbose,
    };
    let mut visualizer = UmapVisualizer::new(run.results_dir.clone(), run.seed);

    let outcome = run_on_cells::<CvaeBackend, _>(&run, &ctx, &data, &mut visualizer)?;

    info!(
        "{} surgery steps; {} cells in {} batches; results in {}",
        outcome.steps,
        outcome.visited.num_cells(),
        outcome.encoder.len(),
        run.results_dir.display()
    );
    Ok(())
}
