mod cell_data;
mod condition_encoder;
mod config;
mod error;
mod h5ad_io;
mod lupin_common;
mod model_backend;
mod pipeline;
mod registry;
mod scatter_plot;
mod surgery_loop;
mod trainer;
mod umap_layout;
mod visualize;

#[cfg(test)]
mod mock_model;

use config::RunArgs;
use lupin_common::*;

fn main() -> anyhow::Result<()> {
    let args = RunArgs::parse();

    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    if let Err(e) = pipeline::run_lupin(&args) {
        log::error!("lupin failed: {:#}", e);
        return Err(e);
    }

    info!("Done");
    Ok(())
}
