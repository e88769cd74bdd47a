use crate::cell_data::CellData;
use crate::lupin_common::*;

use hdf5::types::{FixedAscii, FixedUnicode, TypeDescriptor, VarLenAscii, VarLenUnicode};
use std::path::Path;

/// Read expression and annotations from an AnnData `.h5ad` file
///
/// * `batch_key` - `obs` column with batch labels
/// * `cell_type_key` - `obs` column with cell type labels
///
/// `X` may be a dense 2d dataset or a CSR/CSC group.
pub fn read_h5ad(file: &Path, batch_key: &str, cell_type_key: &str) -> anyhow::Result<CellData> {
    let file_name = file.display().to_string();
    let h5 = hdf5::File::open(file)
        .map_err(|e| anyhow::anyhow!("unable to open {}: {}", file_name, e))?;
    info!("Opened data file: {}", file_name);

    let obs = h5.group("obs")?;
    let var = h5.group("var")?;

    let cell_names = read_frame_index(&obs)?;
    let gene_names = read_frame_index(&var)?;
    let batches = read_obs_column(&obs, batch_key, &file_name)?;
    let cell_types = read_obs_column(&obs, cell_type_key, &file_name)?;

    let x = read_expression(&h5, cell_names.len(), gene_names.len())?;
    info!(
        "Read {} cells x {} genes from {}",
        x.nrows(),
        x.ncols(),
        file_name
    );

    Ok(CellData {
        x,
        cell_names,
        gene_names,
        batches,
        cell_types,
    })
}

fn read_expression(h5: &hdf5::File, nrows: usize, ncols: usize) -> anyhow::Result<Mat> {
    if let Ok(dense) = h5.dataset("X") {
        let shape = dense.shape();
        if shape != [nrows, ncols] {
            return Err(anyhow::anyhow!(
                "X is {:?} but obs/var give {} x {}",
                shape,
                nrows,
                ncols
            ));
        }
        let values = dense.read_raw::<f32>()?;
        return Ok(Mat::from_row_slice(nrows, ncols, &values));
    }

    let group = h5
        .group("X")
        .map_err(|_| anyhow::anyhow!("missing expression matrix `X`"))?;

    let by_row = match sparse_encoding(&group)?.as_str() {
        "csr_matrix" | "csr" => true,
        "csc_matrix" | "csc" => false,
        other => return Err(anyhow::anyhow!("unsupported sparse encoding: {}", other)),
    };

    let values = group.dataset("data")?.read_raw::<f32>()?;
    let indices = group.dataset("indices")?.read_raw::<u64>()?;
    let indptr = group.dataset("indptr")?.read_raw::<u64>()?;

    let (n_outer, n_inner) = if by_row { (nrows, ncols) } else { (ncols, nrows) };
    if indptr.len() != n_outer + 1 || indices.len() != values.len() {
        return Err(anyhow::anyhow!("inconsistent sparse matrix in `X`"));
    }

    let mut x = Mat::zeros(nrows, ncols);
    for outer in 0..n_outer {
        let (start, end) = (indptr[outer] as usize, indptr[outer + 1] as usize);
        if start > end || end > values.len() {
            return Err(anyhow::anyhow!("bad index pointer at {}", outer));
        }
        for k in start..end {
            let inner = indices[k] as usize;
            if inner >= n_inner {
                return Err(anyhow::anyhow!("index {} out of range", inner));
            }
            if by_row {
                x[(outer, inner)] = values[k];
            } else {
                x[(inner, outer)] = values[k];
            }
        }
    }
    Ok(x)
}

fn sparse_encoding(group: &hdf5::Group) -> anyhow::Result<String> {
    for key in ["encoding-type", "h5sparse_format"] {
        if let Ok(attr) = group.attr(key) {
            return read_string_attr(&attr);
        }
    }
    Err(anyhow::anyhow!("sparse `X` without an encoding attribute"))
}

fn read_string_attr(attr: &hdf5::Attribute) -> anyhow::Result<String> {
    if let Ok(s) = attr.read_scalar::<VarLenUnicode>() {
        return Ok(s.as_str().to_string());
    }
    Ok(attr.read_scalar::<VarLenAscii>()?.as_str().to_string())
}

/// Row names of a data frame group (`obs` or `var`)
fn read_frame_index(frame: &hdf5::Group) -> anyhow::Result<Vec<Box<str>>> {
    let key = match frame.attr("_index") {
        Ok(attr) => read_string_attr(&attr)?,
        Err(_) => "_index".to_string(),
    };
    read_hdf5_strings(&frame.dataset(&key)?)
}

/// A categorical or string column of `obs`
fn read_obs_column(obs: &hdf5::Group, column: &str, file: &str) -> anyhow::Result<Vec<Box<str>>> {
    if !obs.link_exists(column) {
        return Err(LupinError::MissingColumn {
            column: column.to_string(),
            file: file.to_string(),
        }
        .into());
    }

    if let Ok(categorical) = obs.group(column) {
        let categories = read_hdf5_strings(&categorical.dataset("categories")?)?;
        let codes = categorical.dataset("codes")?.read_raw::<i64>()?;
        return decode_categories(&categories, &codes);
    }

    let data = obs.dataset(column)?;
    match data.dtype()?.to_descriptor()? {
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => {
            // older layout keeps categories under `__categories`
            let categories = read_hdf5_strings(&obs.dataset(&format!("__categories/{}", column))?)?;
            decode_categories(&categories, &data.read_raw::<i64>()?)
        }
        _ => read_hdf5_strings(&data),
    }
}

fn decode_categories(categories: &[Box<str>], codes: &[i64]) -> anyhow::Result<Vec<Box<str>>> {
    codes
        .iter()
        .map(|&c| {
            if c < 0 {
                Ok("nan".into())
            } else {
                categories
                    .get(c as usize)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("category code {} out of range", c))
            }
        })
        .collect()
}

/// Read strings from `HDF5` dataset
fn read_hdf5_strings(data: &hdf5::Dataset) -> anyhow::Result<Vec<Box<str>>> {
    let desc = data.dtype()?.to_descriptor()?;

    fn boxed<T: ToString>(xx: Vec<T>) -> Vec<Box<str>> {
        xx.iter().map(|x| x.to_string().into_boxed_str()).collect()
    }

    let ret = match desc {
        TypeDescriptor::VarLenUnicode => boxed(data.read_raw::<VarLenUnicode>()?),
        TypeDescriptor::VarLenAscii => boxed(data.read_raw::<VarLenAscii>()?),
        TypeDescriptor::FixedAscii(n) => {
            if n < 24 {
                boxed(data.read_raw::<FixedAscii<24>>()?)
            } else if n < 128 {
                boxed(data.read_raw::<FixedAscii<128>>()?)
            } else {
                boxed(data.read_raw::<FixedAscii<1024>>()?)
            }
        }
        TypeDescriptor::FixedUnicode(n) => {
            if n < 24 {
                boxed(data.read_raw::<FixedUnicode<24>>()?)
            } else if n < 128 {
                boxed(data.read_raw::<FixedUnicode<128>>()?)
            } else {
                boxed(data.read_raw::<FixedUnicode<1024>>()?)
            }
        }
        _ => return Err(anyhow::anyhow!("unsupported string")),
    };
    Ok(ret)
}
