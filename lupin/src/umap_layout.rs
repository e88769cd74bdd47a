use crate::lupin_common::*;

use matrix_util::knn_graph::KnnGraph;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};

/// UMAP layout of a fuzzy neighbour graph by stochastic gradient descent
pub struct Umap {
    min_dist: f32,
    spread: f32,
    n_epochs: Option<usize>,
    learning_rate: f32,
    negative_sample_rate: usize,
    repulsion_strength: f32,
    seed: u64,
}

impl Default for Umap {
    fn default() -> Self {
        Self {
            min_dist: 0.5,
            spread: 1.0,
            n_epochs: None,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            repulsion_strength: 1.0,
            seed: 0,
        }
    }
}

const GRAD_CLIP: f32 = 4.0;
const INIT_RANGE: f32 = 10.0;

impl Umap {
    pub fn min_dist(mut self, d: f32) -> Self {
        self.min_dist = d;
        self
    }

    #[cfg(test)]
    pub fn n_epochs(mut self, n: usize) -> Self {
        self.n_epochs = Some(n);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// 500 epochs up to 10000 points, 200 beyond
    pub fn epochs_for(&self, n: usize) -> usize {
        self.n_epochs
            .unwrap_or(if n <= 10_000 { 500 } else { 200 })
    }

    /// Embed the nodes of `graph` in 2D
    ///
    /// * `weights` - membership strength of each edge in `graph.edges`
    ///
    /// Returns an n x 2 matrix.
    pub fn fit(&self, graph: &KnnGraph, weights: &[f32]) -> anyhow::Result<Mat> {
        let n = graph.num_nodes();
        if weights.len() != graph.num_edges() {
            anyhow::bail!(
                "{} weights for {} edges",
                weights.len(),
                graph.num_edges()
            );
        }

        let n_epochs = self.epochs_for(n);
        let (a, b) = find_ab_params(self.spread, self.min_dist);

        let mut rng = StdRng::seed_from_u64(self.seed);
        let init = Uniform::new(-INIT_RANGE, INIT_RANGE)?;
        let mut coords: Vec<[f32; 2]> = (0..n)
            .map(|_| [init.sample(&mut rng), init.sample(&mut rng)])
            .collect();

        if n_epochs == 0 || weights.is_empty() {
            return Ok(to_mat(&coords));
        }

        // both directions of each undirected edge
        let max_w = weights.iter().cloned().fold(0f32, f32::max);
        let mut heads = vec![];
        let mut tails = vec![];
        let mut epochs_per_sample = vec![];
        for (&(i, j), &w) in graph.edges.iter().zip(weights) {
            if w <= 0. || w < max_w / n_epochs as f32 {
                continue;
            }
            for (h, t) in [(i, j), (j, i)] {
                heads.push(h);
                tails.push(t);
                epochs_per_sample.push(max_w / w);
            }
        }

        let neg_rate = self.negative_sample_rate as f32;
        let epochs_per_negative: Vec<f32> = epochs_per_sample.iter().map(|e| e / neg_rate).collect();
        let mut next_sample = epochs_per_sample.clone();
        let mut next_negative = epochs_per_negative.clone();

        info!(
            "UMAP: {} points, {} directed edges, {} epochs (a={:.3}, b={:.3})",
            n,
            heads.len(),
            n_epochs,
            a,
            b
        );

        for epoch in 0..n_epochs {
            let t = epoch as f32;
            let alpha = self.learning_rate * (1. - t / n_epochs as f32);

            for e in 0..heads.len() {
                if next_sample[e] > t {
                    continue;
                }
                let (h, k) = (heads[e], tails[e]);

                let d2 = dist_sq(&coords[h], &coords[k]);
                let attract = if d2 > 0. {
                    -2. * a * b * d2.powf(b - 1.) / (a * d2.powf(b) + 1.)
                } else {
                    0.
                };
                for d in 0..2 {
                    let g = clip(attract * (coords[h][d] - coords[k][d]));
                    coords[h][d] += g * alpha;
                    coords[k][d] -= g * alpha;
                }
                next_sample[e] += epochs_per_sample[e];

                let n_neg = ((t - next_negative[e]) / epochs_per_negative[e]).max(0.) as usize;
                for _ in 0..n_neg {
                    let other = rng.random_range(0..n);
                    if other == h {
                        continue;
                    }
                    let d2 = dist_sq(&coords[h], &coords[other]);
                    let repel = if d2 > 0. {
                        2. * self.repulsion_strength * b / ((1e-3 + d2) * (a * d2.powf(b) + 1.))
                    } else {
                        0.
                    };
                    for d in 0..2 {
                        let g = if repel > 0. {
                            clip(repel * (coords[h][d] - coords[other][d]))
                        } else {
                            GRAD_CLIP
                        };
                        coords[h][d] += g * alpha;
                    }
                }
                next_negative[e] += n_neg as f32 * epochs_per_negative[e];
            }
        }

        Ok(to_mat(&coords))
    }
}

fn dist_sq(x: &[f32; 2], y: &[f32; 2]) -> f32 {
    (x[0] - y[0]).powi(2) + (x[1] - y[1]).powi(2)
}

fn clip(g: f32) -> f32 {
    g.clamp(-GRAD_CLIP, GRAD_CLIP)
}

fn to_mat(coords: &[[f32; 2]]) -> Mat {
    Mat::from_fn(coords.len(), 2, |i, d| coords[i][d])
}

/// Fit `1 / (1 + a x^(2b))` to the target membership curve
///
/// The target is 1 below `min_dist` and `exp(-(x - min_dist) / spread)`
/// above, sampled on 300 points in `[0, 3 * spread]`. Solved by
/// Levenberg-Marquardt from `a = b = 1`.
pub fn find_ab_params(spread: f32, min_dist: f32) -> (f32, f32) {
    let (spread, min_dist) = (spread as f64, min_dist as f64);
    let npts = 300;
    let xv: Vec<f64> = (0..npts)
        .map(|i| 3. * spread * i as f64 / (npts - 1) as f64)
        .collect();
    let yv: Vec<f64> = xv
        .iter()
        .map(|&x| {
            if x < min_dist {
                1.
            } else {
                (-(x - min_dist) / spread).exp()
            }
        })
        .collect();

    let sse = |a: f64, b: f64| -> f64 {
        xv.iter()
            .zip(yv.iter())
            .map(|(&x, &y)| (y - 1. / (1. + a * x.powf(2. * b))).powi(2))
            .sum()
    };

    let (mut a, mut b) = (1f64, 1f64);
    let mut lambda = 1e-3;
    let mut err = sse(a, b);

    for _ in 0..500 {
        // normal equations of the linearized residuals
        let (mut jaa, mut jab, mut jbb, mut ga, mut gb) = (0., 0., 0., 0., 0.);
        for (&x, &y) in xv.iter().zip(yv.iter()) {
            if x <= 0. {
                continue;
            }
            let p = x.powf(2. * b);
            let denom = (1. + a * p).powi(2);
            let da = -p / denom;
            let db = -a * p * 2. * x.ln() / denom;
            let r = y - 1. / (1. + a * p);
            jaa += da * da;
            jab += da * db;
            jbb += db * db;
            ga += da * r;
            gb += db * r;
        }

        let (maa, mbb) = (jaa * (1. + lambda), jbb * (1. + lambda));
        let det = maa * mbb - jab * jab;
        if det.abs() < 1e-300 {
            break;
        }
        let step_a = (mbb * ga - jab * gb) / det;
        let step_b = (maa * gb - jab * ga) / det;
        let (a_new, b_new) = (a + step_a, b + step_b);

        if a_new > 0. && b_new > 0. && sse(a_new, b_new) < err {
            let improvement = err - sse(a_new, b_new);
            a = a_new;
            b = b_new;
            err = sse(a, b);
            lambda = (lambda / 10.).max(1e-12);
            if improvement < 1e-14 {
                break;
            }
        } else {
            lambda *= 10.;
            if lambda > 1e12 {
                break;
            }
        }
    }

    (a as f32, b as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use matrix_util::knn_graph::KnnGraphArgs;

    #[test]
    fn ab_params_match_reference_values() {
        let (a, b) = find_ab_params(1.0, 0.1);
        assert_abs_diff_eq!(a, 1.577, epsilon = 0.02);
        assert_abs_diff_eq!(b, 0.895, epsilon = 0.01);

        let (a, b) = find_ab_params(1.0, 0.5);
        assert_abs_diff_eq!(a, 0.583, epsilon = 0.02);
        assert_abs_diff_eq!(b, 1.334, epsilon = 0.01);
    }

    #[test]
    fn epochs_depend_on_size() {
        let umap = Umap::default();
        assert_eq!(umap.epochs_for(10_000), 500);
        assert_eq!(umap.epochs_for(10_001), 200);
        assert_eq!(Umap::default().n_epochs(7).epochs_for(10), 7);
    }

    fn two_blobs(n_each: usize) -> Mat {
        let mut rng = StdRng::seed_from_u64(3);
        let noise = Uniform::new(-0.5f32, 0.5).unwrap();
        Mat::from_fn(2 * n_each, 5, |i, _| {
            let center = if i < n_each { 0. } else { 20. };
            center + noise.sample(&mut rng)
        })
    }

    fn centroid(coords: &Mat, rows: std::ops::Range<usize>) -> (f32, f32) {
        let n = rows.len() as f32;
        let (mut x, mut y) = (0., 0.);
        for i in rows {
            x += coords[(i, 0)];
            y += coords[(i, 1)];
        }
        (x / n, y / n)
    }

    fn spread(coords: &Mat, rows: std::ops::Range<usize>) -> f32 {
        let (cx, cy) = centroid(coords, rows.clone());
        let n = rows.len() as f32;
        rows.map(|i| ((coords[(i, 0)] - cx).powi(2) + (coords[(i, 1)] - cy).powi(2)).sqrt())
            .sum::<f32>()
            / n
    }

    #[test]
    fn separated_clusters_stay_apart() -> anyhow::Result<()> {
        let n_each = 40;
        let data = two_blobs(n_each);
        let graph = KnnGraph::from_rows(
            &data,
            KnnGraphArgs {
                knn: 10,
                ..Default::default()
            },
        )?;
        let weights = graph.fuzzy_kernel_weights();
        let coords = Umap::default().seed(1).fit(&graph, &weights)?;
        assert_eq!(coords.shape(), (2 * n_each, 2));
        assert!(coords.iter().all(|x| x.is_finite()));

        let (ax, ay) = centroid(&coords, 0..n_each);
        let (bx, by) = centroid(&coords, n_each..2 * n_each);
        let between = ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt();
        let within = spread(&coords, 0..n_each).max(spread(&coords, n_each..2 * n_each));
        assert!(between > within, "between {} within {}", between, within);
        Ok(())
    }

    #[test]
    fn same_seed_same_layout() -> anyhow::Result<()> {
        let data = two_blobs(15);
        let graph = KnnGraph::from_rows(&data, KnnGraphArgs::default())?;
        let weights = graph.fuzzy_kernel_weights();
        let umap = Umap::default().n_epochs(50).seed(9);
        assert_eq!(umap.fit(&graph, &weights)?, umap.fit(&graph, &weights)?);
        Ok(())
    }
}
