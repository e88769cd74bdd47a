use candle_core::{DType, Device, Tensor};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub struct MinibatchData {
    /// expression (n x d)
    pub input: Tensor,
    /// condition index of each sample (n), u32
    pub condition: Tensor,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn num_samples(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for an in-memory 2d matrix with a condition
/// label for each row. Each row will be considered as a feature
/// vector. The number of samples is the number of rows.
///
pub struct InMemoryData {
    input_data: Tensor,
    condition_data: Tensor,
    minibatches: Minibatches,
    rng: StdRng,
}

impl InMemoryData {
    ///
    /// Create a data loader with the main data `data` and condition
    /// indexes `conditions` (one per row)
    ///
    pub fn new<D>(data: &D, conditions: &[u32], seed: u64) -> anyhow::Result<Self>
    where
        D: RowsToTensor,
    {
        let input_data = data.rows_to_tensor(&Device::Cpu)?;
        let nrows = input_data.dims()[0];

        if conditions.len() != nrows {
            return Err(anyhow::anyhow!(
                "{} condition labels for {} rows",
                conditions.len(),
                nrows
            ));
        }

        let condition_data = Tensor::from_slice(conditions, nrows, &Device::Cpu)?;

        Ok(InMemoryData {
            input_data,
            condition_data,
            minibatches: Minibatches {
                samples: (0..nrows).collect(),
                chunks: vec![],
            },
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Split into contiguous chunks in the original row order
    pub fn sequential_minibatch(&mut self, batch_size: usize) {
        self.minibatches.sequential_minibatch(batch_size);
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let samples = self.minibatches.chunks.get(batch_idx).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.num_minibatch()
            )
        })?;

        let rows: Vec<u32> = samples.iter().map(|&i| i as u32).collect();
        let rows = Tensor::from_vec(rows, samples.len(), &Device::Cpu)?;

        Ok(MinibatchData {
            input: self
                .input_data
                .index_select(&rows, 0)?
                .to_device(target_device)?,
            condition: self
                .condition_data
                .index_select(&rows, 0)?
                .to_device(target_device)?,
        })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_samples(&self) -> usize {
        self.minibatches.size()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size, &mut self.rng);
        Ok(())
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
/// A trailing chunk with a single sample is merged into the previous
/// one; batch normalization needs at least two samples.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) {
        self.samples.shuffle(rng);
        self.chunks = partition(&self.samples, batch_size);
    }

    pub fn sequential_minibatch(&mut self, batch_size: usize) {
        self.samples.sort();
        self.chunks = partition(&self.samples, batch_size);
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

fn partition(samples: &[usize], batch_size: usize) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    let mut chunks: Vec<Vec<usize>> = samples.chunks(batch_size).map(|c| c.to_vec()).collect();

    if chunks.len() > 1 && chunks.last().map(|c| c.len()) == Some(1) {
        if let Some(last) = chunks.pop() {
            if let Some(prev) = chunks.last_mut() {
                prev.extend(last);
            }
        }
    }
    chunks
}

///
/// Convert rows of a matrix to a 2d `Tensor` (rows x columns)
///
pub trait RowsToTensor {
    fn rows_to_tensor(&self, device: &Device) -> candle_core::Result<Tensor>;
}

impl RowsToTensor for DMatrix<f32> {
    fn rows_to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        // column-major storage: transpose to lay out rows contiguously
        let (nrows, ncols) = self.shape();
        let row_major = self.transpose();
        Tensor::from_slice(row_major.as_slice(), (nrows, ncols), device)
    }
}

impl RowsToTensor for Tensor {
    fn rows_to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        self.to_dtype(DType::F32)?.to_device(device)
    }
}

///
/// Convert a 2d `Tensor` back to a host matrix
///
pub trait TensorToMatrix {
    fn to_dmatrix(&self) -> candle_core::Result<DMatrix<f32>>;
}

impl TensorToMatrix for Tensor {
    fn to_dmatrix(&self) -> candle_core::Result<DMatrix<f32>> {
        let (nrows, ncols) = self.dims2()?;
        let values: Vec<f32> = self
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1()?;
        Ok(DMatrix::from_row_slice(nrows, ncols, &values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_tensor_conversion_keeps_rows() -> anyhow::Result<()> {
        let mat = DMatrix::<f32>::from_row_slice(2, 3, &[1., 2., 3., 4., 5., 6.]);
        let t = mat.rows_to_tensor(&Device::Cpu)?;
        let rows: Vec<Vec<f32>> = t.to_vec2()?;
        assert_eq!(rows, vec![vec![1., 2., 3.], vec![4., 5., 6.]]);
        assert_eq!(t.to_dmatrix()?, mat);
        Ok(())
    }

    #[test]
    fn minibatches_cover_every_sample_once() -> anyhow::Result<()> {
        let mat = DMatrix::<f32>::from_fn(11, 2, |i, j| (i * 2 + j) as f32);
        let labels: Vec<u32> = (0..11).map(|i| (i % 3) as u32).collect();
        let mut data = InMemoryData::new(&mat, &labels, 7)?;
        data.shuffle_minibatch(5)?;

        // 5 + 5 + 1 -> 5 + 6
        assert_eq!(data.num_minibatch(), 2);

        let mut seen = vec![];
        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_data(b, &Device::Cpu)?;
            let x: Vec<Vec<f32>> = mb.input.to_vec2()?;
            let c: Vec<u32> = mb.condition.to_vec1()?;
            for (row, cond) in x.iter().zip(c.iter()) {
                let i = (row[0] / 2.) as usize;
                assert_eq!(*cond, (i % 3) as u32);
                seen.push(i);
            }
        }
        seen.sort();
        assert_eq!(seen, (0..11).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn label_count_must_match_rows() {
        let mat = DMatrix::<f32>::zeros(3, 2);
        assert!(InMemoryData::new(&mat, &[0, 1], 0).is_err());
    }

    #[test]
    fn sequential_minibatch_keeps_order() -> anyhow::Result<()> {
        let mat = DMatrix::<f32>::from_fn(4, 1, |i, _| i as f32);
        let mut data = InMemoryData::new(&mat, &[0, 0, 1, 1], 0)?;
        data.shuffle_minibatch(2)?;
        data.sequential_minibatch(3);
        let first: Vec<Vec<f32>> = data.minibatch_data(0, &Device::Cpu)?.input.to_vec2()?;
        assert_eq!(first, vec![vec![0.], vec![1.], vec![2.], vec![3.]]);
        Ok(())
    }
}
