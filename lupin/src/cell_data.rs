use crate::lupin_common::*;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;

/// Cells by genes with per-cell annotations
#[derive(Clone, Debug)]
pub struct CellData {
    /// expression (cells x genes)
    pub x: Mat,
    pub cell_names: Vec<Box<str>>,
    pub gene_names: Vec<Box<str>>,
    /// batch label of each cell
    pub batches: Vec<Box<str>>,
    /// cell type label of each cell
    pub cell_types: Vec<Box<str>>,
}

impl CellData {
    pub fn num_cells(&self) -> usize {
        self.x.nrows()
    }

    pub fn num_genes(&self) -> usize {
        self.x.ncols()
    }

    /// Rows at `indices`, in that order
    pub fn select_rows(&self, indices: &[usize]) -> CellData {
        let pick = |v: &[Box<str>]| indices.iter().map(|&i| v[i].clone()).collect::<Vec<_>>();
        CellData {
            x: self.x.select_rows(indices),
            cell_names: pick(&self.cell_names),
            gene_names: self.gene_names.clone(),
            batches: pick(&self.batches),
            cell_types: pick(&self.cell_types),
        }
    }

    /// Cells whose batch label satisfies `keep`
    pub fn filter_batches<F>(&self, keep: F) -> CellData
    where
        F: Fn(&str) -> bool,
    {
        let indices: Vec<usize> = self
            .batches
            .iter()
            .enumerate()
            .filter(|(_, b)| keep(b))
            .map(|(i, _)| i)
            .collect();
        self.select_rows(&indices)
    }

    /// Stack `self` on top of `other`; gene sets must agree
    pub fn concat(&self, other: &CellData) -> anyhow::Result<CellData> {
        if self.gene_names != other.gene_names {
            return Err(anyhow::anyhow!(
                "cannot stack cells over different genes ({} vs {})",
                self.num_genes(),
                other.num_genes()
            ));
        }

        let (n1, n2) = (self.num_cells(), other.num_cells());
        let mut x = Mat::zeros(n1 + n2, self.num_genes());
        x.view_mut((0, 0), (n1, self.num_genes())).copy_from(&self.x);
        x.view_mut((n1, 0), (n2, self.num_genes()))
            .copy_from(&other.x);

        let join = |a: &[Box<str>], b: &[Box<str>]| -> Vec<Box<str>> {
            a.iter().chain(b.iter()).cloned().collect()
        };

        Ok(CellData {
            x,
            cell_names: join(&self.cell_names, &other.cell_names),
            gene_names: self.gene_names.clone(),
            batches: join(&self.batches, &other.batches),
            cell_types: join(&self.cell_types, &other.cell_types),
        })
    }

    /// Batch labels in order of first appearance
    pub fn distinct_batches(&self) -> Vec<Box<str>> {
        distinct_in_order(&self.batches)
    }

    /// Random split into training and validation cells
    ///
    /// The validation part takes `round(n * valid_frac)` cells, at least
    /// one and at most `n - MIN_TRAIN_CELLS`. Batch normalization in
    /// training mode needs two training cells.
    pub fn train_valid_split(
        &self,
        valid_frac: f32,
        seed: u64,
    ) -> Result<(CellData, CellData), LupinError> {
        let n = self.num_cells();
        if n < MIN_TRAIN_CELLS + 1 {
            let batch = self
                .distinct_batches()
                .into_iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>()
                .join(",");
            return Err(LupinError::BatchTooSmall { batch, n_cells: n });
        }

        let n_valid = ((n as f32 * valid_frac).round() as usize).clamp(1, n - MIN_TRAIN_CELLS);

        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
        let (valid, train) = indices.split_at(n_valid);

        Ok((self.select_rows(train), self.select_rows(valid)))
    }
}

pub const MIN_TRAIN_CELLS: usize = 2;

/// Unique values in order of first appearance
pub fn distinct_in_order(values: &[Box<str>]) -> Vec<Box<str>> {
    let mut seen: HashSet<String> = HashSet::new();
    values
        .iter()
        .filter(|v| seen.insert(v.to_string()))
        .cloned()
        .collect()
}
