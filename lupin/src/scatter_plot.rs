use crate::cell_data::distinct_in_order;
use crate::lupin_common::*;

use plotters::prelude::*;
use std::path::{Path, PathBuf};
use svg2pdf::usvg;

const WIDTH: u32 = 1400;
const HEIGHT: u32 = 600;
const POINT_SIZE: i32 = 2;

/// One colouring of the points
pub struct ScatterPanel<'a> {
    pub title: &'a str,
    pub labels: &'a [Box<str>],
}

/// Side-by-side scatter plots of the same 2D coordinates, one panel
/// per labelling, each with its own legend
///
/// Writes `{name}.pdf` and `{name}.svg` under `out_dir`; returns the
/// PDF path.
pub fn plot_labelled_scatter(
    coords: &Mat,
    panels: &[ScatterPanel],
    title: &str,
    out_dir: &Path,
    name: &str,
) -> anyhow::Result<PathBuf> {
    let svg = render_svg(coords, panels, title)?;
    let pdf = svg_to_pdf(&svg)?;

    std::fs::create_dir_all(out_dir)?;
    std::fs::write(out_dir.join(format!("{}.svg", name)), &svg)?;
    let pdf_file = out_dir.join(format!("{}.pdf", name));
    std::fs::write(&pdf_file, pdf)?;
    Ok(pdf_file)
}

fn svg_to_pdf(svg: &str) -> anyhow::Result<Vec<u8>> {
    let mut options = usvg::Options::default();
    options.fontdb_mut().load_system_fonts();
    let tree = usvg::Tree::from_str(svg, &options)?;
    svg2pdf::to_pdf(
        &tree,
        svg2pdf::ConversionOptions::default(),
        svg2pdf::PageOptions::default(),
    )
    .map_err(|e| anyhow::anyhow!("failed to convert the plot to PDF: {:?}", e))
}

fn render_svg(coords: &Mat, panels: &[ScatterPanel], title: &str) -> anyhow::Result<String> {
    if coords.ncols() != 2 {
        anyhow::bail!("need 2D coordinates, got {} columns", coords.ncols());
    }
    if panels.iter().any(|p| p.labels.len() != coords.nrows()) {
        anyhow::bail!("each panel needs one label per point");
    }
    if panels.is_empty() {
        anyhow::bail!("nothing to plot");
    }

    let (xr, yr) = padded_range(coords);

    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, (WIDTH, HEIGHT)).into_drawing_area();
        root.fill(&WHITE)?;
        let root = root.titled(title, ("sans-serif", 20))?;
        let areas = root.split_evenly((1, panels.len()));

        for (panel, area) in panels.iter().zip(areas.iter()) {
            let mut chart = ChartBuilder::on(area)
                .caption(panel.title, ("sans-serif", 16))
                .margin(10)
                .x_label_area_size(30)
                .y_label_area_size(40)
                .build_cartesian_2d(xr.clone(), yr.clone())?;

            chart
                .configure_mesh()
                .disable_mesh()
                .x_desc("UMAP1")
                .y_desc("UMAP2")
                .draw()?;

            for (k, label) in distinct_in_order(panel.labels).iter().enumerate() {
                let color = Palette99::pick(k).to_rgba();
                let points: Vec<(f32, f32)> = panel
                    .labels
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| *l == label)
                    .map(|(i, _)| (coords[(i, 0)], coords[(i, 1)]))
                    .collect();

                chart
                    .draw_series(
                        points
                            .into_iter()
                            .map(|xy| Circle::new(xy, POINT_SIZE, color.filled())),
                    )?
                    .label(label.to_string())
                    .legend(move |(x, y)| Circle::new((x + 5, y), 4, color.filled()));
            }

            chart
                .configure_series_labels()
                .position(SeriesLabelPosition::UpperRight)
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()?;
        }

        root.present()?;
    }
    Ok(svg)
}

fn padded_range(coords: &Mat) -> (std::ops::Range<f32>, std::ops::Range<f32>) {
    let range = |j: usize| {
        let col = coords.column(j);
        let (lo, hi) = (col.min(), col.max());
        let pad = ((hi - lo) * 0.05).max(1e-3);
        (lo - pad)..(hi + pad)
    };
    (range(0), range(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_two_panels_with_legends() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let coords = Mat::from_row_slice(4, 2, &[0., 0., 1., 1., 5., 5., 6., 5.]);
        let batches: Vec<Box<str>> = vec!["b1".into(), "b1".into(), "b2".into(), "b2".into()];
        let types: Vec<Box<str>> = vec!["alpha".into(), "beta".into(), "alpha".into(), "beta".into()];

        let pdf_file = plot_labelled_scatter(
            &coords,
            &[
                ScatterPanel {
                    title: "batch",
                    labels: &batches,
                },
                ScatterPanel {
                    title: "cell type",
                    labels: &types,
                },
            ],
            "latent",
            dir.path(),
            "umap_latent_(1:Batch2.v1)",
        )?;

        let svg = std::fs::read_to_string(dir.path().join("umap_latent_(1:Batch2.v1).svg"))?;
        assert!(svg.contains("<svg"));
        for text in ["b1", "b2", "alpha", "beta"] {
            assert!(svg.contains(text), "missing legend entry {}", text);
        }

        assert_eq!(pdf_file, dir.path().join("umap_latent_(1:Batch2.v1).pdf"));
        let pdf = std::fs::read(&pdf_file)?;
        assert!(pdf.starts_with(b"%PDF-"));
        Ok(())
    }

    #[test]
    fn rejects_mismatched_labels() {
        let dir = tempfile::tempdir().unwrap();
        let coords = Mat::zeros(3, 2);
        let labels: Vec<Box<str>> = vec!["a".into()];
        let panels = [ScatterPanel {
            title: "batch",
            labels: &labels,
        }];
        assert!(plot_labelled_scatter(&coords, &panels, "t", dir.path(), "x").is_err());
        assert!(!dir.path().join("x.pdf").exists());
    }
}
