//! Symmetric k-nearest-neighbour graph with UMAP fuzzy memberships

use crate::knn_match::ColumnDict;

use dashmap::DashMap;
use indicatif::ParallelProgressIterator;
use log::info;
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rayon::prelude::*;
use std::collections::HashMap;
use std::ops::Range;

const DEFAULT_BLOCK_SIZE: usize = 1000;
const SIGMA_SEARCH_STEPS: usize = 64;
const SIGMA_TOLERANCE: f32 = 1e-5;
const MIN_SCALE_FRACTION: f32 = 1e-3;

pub struct KnnGraph {
    /// symmetric adjacency (n x n) holding edge distances
    pub adjacency: CscMatrix<f32>,
    /// undirected edges `(i, j)` with `i < j`, sorted
    pub edges: Vec<(usize, usize)>,
    /// k nearest others of each node `(j, d_ij)`, nearest first
    pub directed: Vec<Vec<(usize, f32)>>,
}

pub struct KnnGraphArgs {
    /// neighbours per node, self excluded; capped at `n - 1`
    pub knn: usize,
    /// nodes searched per parallel job
    pub block_size: usize,
}

impl Default for KnnGraphArgs {
    fn default() -> Self {
        Self {
            knn: 15,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Per-node distance calibration of the fuzzy simplicial set
#[derive(Clone, Copy, Debug)]
struct LocalScale {
    /// distance to the nearest neighbour
    rho: f32,
    sigma: f32,
}

impl LocalScale {
    fn of(nbrs: &[(usize, f32)]) -> Self {
        if nbrs.is_empty() {
            return Self { rho: 0., sigma: 1. };
        }
        let dists: Vec<f32> = nbrs.iter().map(|&(_, d)| d).collect();
        let rho = dists.iter().copied().fold(f32::INFINITY, f32::min);
        Self {
            rho,
            sigma: calibrate_sigma(&dists, rho),
        }
    }

    fn membership(&self, d: f32) -> f32 {
        membership(d, self.rho, self.sigma)
    }
}

impl KnnGraph {
    /// Graph over the columns of `points` (d x n)
    pub fn from_columns(points: &DMatrix<f32>, args: KnnGraphArgs) -> anyhow::Result<KnnGraph> {
        let nn = points.ncols();
        if nn < 2 {
            return Err(anyhow::anyhow!("need at least two points, got {}", nn));
        }
        let dict = ColumnDict::from_dvector_views(points.column_iter().collect());
        Self::build(&dict, nn, &args)
    }

    /// Graph over the rows of `data` (n x d), e.g., cells by latent dimensions
    pub fn from_rows(data: &DMatrix<f32>, args: KnnGraphArgs) -> anyhow::Result<KnnGraph> {
        Self::from_columns(&data.transpose(), args)
    }

    fn build(dict: &ColumnDict, nn: usize, args: &KnnGraphArgs) -> anyhow::Result<KnnGraph> {
        let knn = args.knn.clamp(1, nn - 1);
        let directed = search_blocks(dict, nn, knn, args.block_size)?;

        // union of i -> j and j -> i, keeping the shorter distance
        let union: DashMap<(usize, usize), f32> = DashMap::new();
        directed.par_iter().enumerate().for_each(|(i, nbrs)| {
            for &(j, d) in nbrs.iter().filter(|&&(j, _)| j != i) {
                union
                    .entry((i.min(j), i.max(j)))
                    .and_modify(|v| *v = v.min(d))
                    .or_insert(d);
            }
        });

        let mut weighted: Vec<((usize, usize), f32)> = union.into_iter().collect();
        if weighted.is_empty() {
            return Err(anyhow::anyhow!("no edges among {} points", nn));
        }
        weighted.par_sort_unstable_by_key(|&(ij, _)| ij);
        info!("{} undirected edges among {} points (k = {})", weighted.len(), nn, knn);

        let mut coo = CooMatrix::new(nn, nn);
        for &((i, j), d) in weighted.iter() {
            coo.push(i, j, d);
            coo.push(j, i, d);
        }

        Ok(KnnGraph {
            adjacency: CscMatrix::from(&coo),
            edges: weighted.into_iter().map(|(ij, _)| ij).collect(),
            directed,
        })
    }

    pub fn neighbors(&self, node: usize) -> &[usize] {
        let offsets = self.adjacency.col_offsets();
        &self.adjacency.row_indices()[offsets[node]..offsets[node + 1]]
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.directed.len()
    }

    /// UMAP fuzzy simplicial set weights, parallel to `self.edges`
    ///
    /// Each node gets `rho` (nearest distance) and `sigma` such that
    /// `sum_j exp(-(d_ij - rho) / sigma) = log2(k)`. Directed memberships
    /// are combined by fuzzy union `a + b - a * b`, so every weight lies
    /// in `[0, 1]`.
    pub fn fuzzy_kernel_weights(&self) -> Vec<f32> {
        let scales: Vec<LocalScale> = self
            .directed
            .par_iter()
            .map(|nbrs| LocalScale::of(nbrs))
            .collect();

        let directed: HashMap<(usize, usize), f32> = self
            .directed
            .iter()
            .enumerate()
            .flat_map(|(i, nbrs)| {
                let scale = scales[i];
                nbrs.iter().map(move |&(j, d)| ((i, j), scale.membership(d)))
            })
            .collect();

        self.edges
            .par_iter()
            .map(|&(i, j)| {
                let a = directed.get(&(i, j)).copied().unwrap_or(0.);
                let b = directed.get(&(j, i)).copied().unwrap_or(0.);
                a + b - a * b
            })
            .collect()
    }
}

fn search_blocks(
    dict: &ColumnDict,
    nn: usize,
    knn: usize,
    block_size: usize,
) -> anyhow::Result<Vec<Vec<(usize, f32)>>> {
    let block_size = if block_size == 0 {
        DEFAULT_BLOCK_SIZE
    } else {
        block_size
    };
    let blocks: Vec<Range<usize>> = (0..nn)
        .step_by(block_size)
        .map(|lb| lb..(lb + block_size).min(nn))
        .collect();
    let nblocks = blocks.len() as u64;

    let found = blocks
        .into_par_iter()
        .progress_count(nblocks)
        .map(|block| {
            block
                .map(|i| -> anyhow::Result<Vec<(usize, f32)>> {
                    let (names, dists) = dict.search_others(i, knn)?;
                    Ok(names.into_iter().zip(dists).collect())
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .collect::<anyhow::Result<Vec<Vec<_>>>>()?;

    Ok(found.into_iter().flatten().collect())
}

/// Bisection on `sigma` for `sum_j membership(d_j) = log2(k)`
fn calibrate_sigma(dists: &[f32], rho: f32) -> f32 {
    let target = (dists.len() as f32).log2();
    let (mut lo, mut hi, mut sigma) = (0f32, f32::INFINITY, 1f32);

    for _ in 0..SIGMA_SEARCH_STEPS {
        let psum: f32 = dists.iter().map(|&d| membership(d, rho, sigma)).sum();
        if (psum - target).abs() < SIGMA_TOLERANCE {
            break;
        }
        if psum > target {
            hi = sigma;
            sigma = 0.5 * (lo + hi);
        } else {
            lo = sigma;
            sigma = if hi.is_finite() {
                0.5 * (lo + hi)
            } else {
                2. * sigma
            };
        }
    }

    let mean = dists.iter().sum::<f32>() / dists.len() as f32;
    sigma.max(MIN_SCALE_FRACTION * mean)
}

fn membership(d: f32, rho: f32, sigma: f32) -> f32 {
    let gap = d - rho;
    if gap <= 0. {
        1.
    } else if sigma > 0. {
        (-gap / sigma).exp()
    } else {
        0.
    }
}
