use matrix_util::common_io::*;
use matrix_util::traits::IoOps;
use nalgebra::DMatrix;

#[test]
fn dmatrix_parquet_test() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("model").join("trace.parquet");

    let xx = DMatrix::<f32>::from_fn(20, 3, |i, j| (i * 3 + j) as f32 * 0.5);
    let epochs: Vec<Box<str>> = (1..=20).map(|e| e.to_string().into_boxed_str()).collect();
    let names: Vec<Box<str>> = vec!["train_loss".into(), "valid_loss".into(), "lr".into()];

    xx.to_parquet_with_names(
        path_str(&file)?,
        (Some(epochs.as_slice()), Some("epoch")),
        Some(names.as_slice()),
    )?;

    let yy = DMatrix::<f32>::from_parquet(path_str(&file)?)?;
    approx::assert_abs_diff_eq!(xx, yy.mat);
    assert_eq!(yy.rows, epochs);
    assert_eq!(yy.cols, names);

    let only_lr = DMatrix::<f32>::from_parquet_with_names(path_str(&file)?, None, Some(&names[2..]))?;
    assert_eq!(only_lr.mat.ncols(), 1);
    approx::assert_abs_diff_eq!(only_lr.mat.column(0), xx.column(2));

    Ok(())
}
