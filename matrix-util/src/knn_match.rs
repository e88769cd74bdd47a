use instant_distance::{Builder, HnswMap, Search};
use rayon::prelude::*;

/// HNSW index over the columns of a matrix; column `j` is named `j`
pub struct ColumnDict {
    dict: HnswMap<VecPoint, usize>,
    points: Vec<VecPoint>,
}

impl ColumnDict {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn from_dvector_views(columns: Vec<nalgebra::DVectorView<f32>>) -> Self {
        let points: Vec<VecPoint> = columns
            .par_iter()
            .map(|x| VecPoint {
                data: x.iter().copied().collect(),
            })
            .collect();
        let names: Vec<usize> = (0..points.len()).collect();
        let dict = Builder::default().build(points.clone(), names);
        ColumnDict { dict, points }
    }

    /// `knn` nearest other columns of column `query`
    ///
    /// # Returns `(indices, distances)`, nearest first
    pub fn search_others(&self, query: usize, knn: usize) -> anyhow::Result<(Vec<usize>, Vec<f32>)> {
        let point = self
            .points
            .get(query)
            .ok_or_else(|| anyhow::anyhow!("column {} out of {}", query, self.len()))?;

        let mut search = Search::default();
        Ok(self
            .dict
            .search(point, &mut search)
            .filter(|item| *item.value != query)
            .take(knn)
            .map(|item| (*item.value, item.distance))
            .unzip())
    }
}

/// Euclidean point for the HNSW index
#[derive(Clone, Debug)]
pub struct VecPoint {
    pub data: Vec<f32>,
}

impl instant_distance::Point for VecPoint {
    fn distance(&self, other: &Self) -> f32 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}
