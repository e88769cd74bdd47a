use crate::common_io::mkdir_parent;
use crate::parquet::*;
use crate::traits::*;
pub use nalgebra::{DMatrix, DVector};

fn numbered(n: usize) -> Vec<Box<str>> {
    (0..n).map(|i| i.to_string().into_boxed_str()).collect()
}

impl<T> IoOps for DMatrix<T>
where
    T: ParquetNumeric + nalgebra::Scalar,
{
    type Scalar = T;
    type Mat = Self;

    fn to_parquet_with_names(
        &self,
        file_path: &str,
        row_names: (Option<&[Box<str>]>, Option<&str>),
        column_names: Option<&[Box<str>]>,
    ) -> anyhow::Result<()> {
        let (rows, row_column) = row_names;
        let rows = rows.map_or_else(|| numbered(self.nrows()), |r| r.to_vec());
        let cols = column_names.map_or_else(|| numbered(self.ncols()), |c| c.to_vec());

        let columns: Vec<Vec<T>> = self
            .column_iter()
            .map(|c| c.iter().cloned().collect())
            .collect();

        mkdir_parent(file_path)?;
        write_named_table(file_path, row_column.unwrap_or("row"), &rows, &cols, &columns)
    }

    fn from_parquet_with_names(
        file_path: &str,
        row_name_index: Option<usize>,
        column_names: Option<&[Box<str>]>,
    ) -> anyhow::Result<MatWithNames<Self>> {
        let table = read_named_table(file_path, row_name_index, column_names)?;
        let (nrows, ncols) = (table.row_names.len(), table.column_names.len());

        Ok(MatWithNames {
            mat: DMatrix::from_row_iterator(nrows, ncols, table.values.into_iter().map(T::from_f64)),
            rows: table.row_names,
            cols: table.column_names,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parquet_keeps_names_and_values() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("coords.parquet");
        let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;

        let mat = DMatrix::<f32>::from_row_slice(3, 2, &[0.5, 1.0, -2.0, 3.5, 4.0, 0.0]);
        let rows: Vec<Box<str>> = vec!["c1".into(), "c2".into(), "c3".into()];
        let cols: Vec<Box<str>> = vec!["umap1".into(), "umap2".into()];

        mat.to_parquet_with_names(
            file,
            (Some(rows.as_slice()), Some("cell")),
            Some(cols.as_slice()),
        )?;

        let fields = peek_parquet_field_names(file)?;
        let fields: Vec<&str> = fields.iter().map(|f| &**f).collect();
        assert_eq!(fields, ["cell", "umap1", "umap2"]);

        let back = DMatrix::<f32>::from_parquet(file)?;
        assert_eq!(back.rows, rows);
        assert_eq!(back.cols, cols);
        assert_eq!(back.mat, mat);
        Ok(())
    }

    #[test]
    fn integer_columns_and_default_names() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("counts.parquet");
        let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;

        let mat = DMatrix::<i64>::from_row_slice(2, 3, &[1, 0, 7, 2, 5, 0]);
        mat.to_parquet_with_names(file, (None, None), None)?;

        let back = DMatrix::<i64>::from_parquet(file)?;
        assert_eq!(back.mat, mat);
        let rows: Vec<&str> = back.rows.iter().map(|r| &**r).collect();
        assert_eq!(rows, ["0", "1"]);
        Ok(())
    }

    #[test]
    fn parquet_rejects_wrong_row_names() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("bad.parquet");
        let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;

        let mat = DMatrix::<f64>::zeros(3, 1);
        let rows: Vec<Box<str>> = vec!["only_one".into()];
        assert!(mat
            .to_parquet_with_names(file, (Some(rows.as_slice()), None), None)
            .is_err());
        Ok(())
    }
}
