use crate::cell_data::CellData;
use crate::lupin_common::*;
use crate::model_backend::ConditionalModel;
use crate::scatter_plot::*;
use crate::umap_layout::Umap;

use matrix_util::common_io::path_str;
use matrix_util::knn_graph::{KnnGraph, KnnGraphArgs};
use matrix_util::traits::IoOps;
use std::path::PathBuf;

/// Turns a model's latent space into something to look at
pub trait LatentVisualizer {
    /// * `conditions` - encoded batch label of each cell
    /// * `suffix` - distinguishes the outputs of each call
    fn visualize<M: ConditionalModel>(
        &mut self,
        model: &M,
        cells: &CellData,
        conditions: &[u32],
        suffix: &str,
    ) -> anyhow::Result<()>;
}

/// neighbours besides the cell itself, i.e. 15 including it
pub const KNN: usize = 14;
pub const MIN_DIST: f32 = 0.5;

/// kNN graph, UMAP, scatter plots by batch and cell type
///
/// Writes `umap{suffix}.pdf`, `umap{suffix}.svg` and `umap{suffix}.parquet`
/// to `out_dir`.
pub struct UmapVisualizer {
    pub out_dir: PathBuf,
    pub seed: u64,
}

impl UmapVisualizer {
    pub fn new(out_dir: PathBuf, seed: u64) -> Self {
        Self { out_dir, seed }
    }

    /// 2D coordinates of the rows of `latent`
    pub fn embed(&self, latent: &Mat) -> anyhow::Result<Mat> {
        let n = latent.nrows();
        let knn = KNN.min(n.saturating_sub(1));
        let graph = KnnGraph::from_rows(
            latent,
            KnnGraphArgs {
                knn,
                ..Default::default()
            },
        )?;
        let weights = graph.fuzzy_kernel_weights();
        info!(
            "kNN graph: {} nodes, {} edges (k = {})",
            graph.num_nodes(),
            graph.num_edges(),
            knn
        );
        Umap::default()
            .min_dist(MIN_DIST)
            .seed(self.seed)
            .fit(&graph, &weights)
    }
}

impl LatentVisualizer for UmapVisualizer {
    fn visualize<M: ConditionalModel>(
        &mut self,
        model: &M,
        cells: &CellData,
        conditions: &[u32],
        suffix: &str,
    ) -> anyhow::Result<()> {
        let latent = model.project_to_latent(&cells.x, conditions)?;
        let coords = self.embed(&latent)?;

        std::fs::create_dir_all(&self.out_dir)?;

        let coord_file = self.out_dir.join(format!("umap{}.parquet", suffix));
        let coord_names: Vec<Box<str>> = vec!["umap1".into(), "umap2".into()];
        coords.to_parquet_with_names(
            path_str(&coord_file)?,
            (Some(cells.cell_names.as_slice()), Some("cell")),
            Some(coord_names.as_slice()),
        )?;

        let name = format!("umap{}", suffix);
        let plot_file = plot_labelled_scatter(
            &coords,
            &[
                ScatterPanel {
                    title: "batch",
                    labels: &cells.batches,
                },
                ScatterPanel {
                    title: "cell type",
                    labels: &cells.cell_types,
                },
            ],
            &name,
            &self.out_dir,
            &name,
        )?;

        info!("wrote {}", plot_file.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell_data::tests::toy_cells;
    use crate::condition_encoder::ConditionEncoder;
    use crate::config::{resolve_run, tests::args};
    use crate::model_backend::{CvaeBackend, CvaeContext};
    use candle_core::Device;
    use matrix_util::dmatrix_io::DMatrix;

    #[test]
    fn writes_plot_and_coordinates() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = resolve_run(&args("toy", 0, 0))?;
        let cells = toy_cells(&[("Batch1", 20), ("Batch2", 20)], 6);
        let encoder = ConditionEncoder::from_labels(&cells.batches);
        let ctx = CvaeContext {
            device: Device::Cpu,
            verbose: false,
        };
        let model = CvaeBackend::construct(&ctx, run.cvae_config(6, 2))?;

        let mut vis = UmapVisualizer::new(dir.path().to_path_buf(), 0);
        vis.visualize(
            &model,
            &cells,
            &encoder.encode(&cells.batches)?,
            "_latent_first",
        )?;

        let coords = dir.path().join("umap_latent_first.parquet");
        assert!(dir.path().join("umap_latent_first.pdf").is_file());
        assert!(dir.path().join("umap_latent_first.svg").is_file());

        let back = DMatrix::<f32>::from_parquet(path_str(&coords)?)?;
        assert_eq!(back.rows, cells.cell_names);
        assert_eq!(back.cols, vec![Box::<str>::from("umap1"), "umap2".into()]);
        assert_eq!(back.mat.shape(), (40, 2));
        Ok(())
    }

    #[test]
    fn tiny_sets_use_fewer_neighbours() -> anyhow::Result<()> {
        let vis = UmapVisualizer::new(PathBuf::from("unused"), 0);
        let latent = Mat::from_row_slice(4, 2, &[0., 0., 0., 1., 5., 5., 5., 6.]);
        let coords = vis.embed(&latent)?;
        assert_eq!(coords.shape(), (4, 2));
        Ok(())
    }
}
