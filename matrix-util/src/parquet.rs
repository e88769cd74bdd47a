//! Parquet tables: one string column of row names followed by
//! numeric columns of a single physical type

use parquet::basic::{Compression, ConvertedType, Repetition, Type as PhysicalType, ZstdLevel};
use parquet::data_type::{
    ByteArray, ByteArrayType, DataType, DoubleType, FloatType, Int32Type, Int64Type,
};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::writer::{SerializedFileWriter, SerializedRowGroupWriter};
use parquet::record::{Field, RowAccessor};
use parquet::schema::types::Type;
use std::fs::File;
use std::sync::Arc;

const ZSTD_LEVEL: i32 = 5;

/// Numeric scalars stored as one parquet column each
pub trait ParquetNumeric: Copy + Send + Sync + 'static {
    const PHYSICAL: PhysicalType;
    type Column: DataType<T = Self>;
    fn from_f64(x: f64) -> Self;
}

impl ParquetNumeric for f32 {
    const PHYSICAL: PhysicalType = PhysicalType::FLOAT;
    type Column = FloatType;
    fn from_f64(x: f64) -> Self {
        x as f32
    }
}

impl ParquetNumeric for f64 {
    const PHYSICAL: PhysicalType = PhysicalType::DOUBLE;
    type Column = DoubleType;
    fn from_f64(x: f64) -> Self {
        x
    }
}

impl ParquetNumeric for i32 {
    const PHYSICAL: PhysicalType = PhysicalType::INT32;
    type Column = Int32Type;
    fn from_f64(x: f64) -> Self {
        x.round() as i32
    }
}

impl ParquetNumeric for i64 {
    const PHYSICAL: PhysicalType = PhysicalType::INT64;
    type Column = Int64Type;
    fn from_f64(x: f64) -> Self {
        x.round() as i64
    }
}

/// What `read_named_table` found
pub struct NamedTable {
    pub row_names: Vec<Box<str>>,
    pub column_names: Vec<Box<str>>,
    /// numeric columns, row-major
    pub values: Vec<f64>,
}

/// Field names of the file schema, in order
pub fn peek_parquet_field_names(file_path: &str) -> anyhow::Result<Vec<Box<str>>> {
    let reader = SerializedFileReader::new(File::open(file_path)?)?;
    Ok(reader
        .metadata()
        .file_metadata()
        .schema()
        .get_fields()
        .iter()
        .map(|f| f.name().into())
        .collect())
}

/// Read the numeric columns of a table
///
/// * `row_name_index` - string column holding the row names (default 0)
/// * `select_columns` - keep only these numeric columns (default all)
pub fn read_named_table(
    file_path: &str,
    row_name_index: Option<usize>,
    select_columns: Option<&[Box<str>]>,
) -> anyhow::Result<NamedTable> {
    let row_idx = row_name_index.unwrap_or(0);
    let reader = SerializedFileReader::new(File::open(file_path)?)?;
    let meta = reader.metadata().file_metadata();
    let nrows = meta.num_rows() as usize;
    let fields = meta.schema().get_fields();

    let wanted = |name: &str| select_columns.is_none_or(|names| names.iter().any(|n| &**n == name));

    let selected: Vec<usize> = fields
        .iter()
        .enumerate()
        .filter(|&(j, f)| {
            j != row_idx
                && f.is_primitive()
                && is_numeric(f.get_physical_type())
                && wanted(f.name())
        })
        .map(|(j, _)| j)
        .collect();

    if selected.is_empty() {
        return Err(anyhow::anyhow!("no numeric columns to read in {}", file_path));
    }

    let column_names: Vec<Box<str>> = selected.iter().map(|&j| fields[j].name().into()).collect();

    let mut row_names: Vec<Box<str>> = Vec::with_capacity(nrows);
    let mut values: Vec<f64> = Vec::with_capacity(nrows * selected.len());

    for record in reader.get_row_iter(None)? {
        let row = record?;
        row_names.push(row.get_string(row_idx)?.as_str().into());

        let row_fields: Vec<&Field> = row.get_column_iter().map(|(_, f)| f).collect();
        for &j in selected.iter() {
            let x = as_f64(row_fields[j])
                .ok_or_else(|| anyhow::anyhow!("non-numeric value in column {}", fields[j].name()))?;
            values.push(x);
        }
    }

    Ok(NamedTable {
        row_names,
        column_names,
        values,
    })
}

/// Write `columns` next to a leading string column `row_column`
pub fn write_named_table<T: ParquetNumeric>(
    file_path: &str,
    row_column: &str,
    row_names: &[Box<str>],
    column_names: &[Box<str>],
    columns: &[Vec<T>],
) -> anyhow::Result<()> {
    if column_names.len() != columns.len() {
        return Err(anyhow::anyhow!(
            "{} column names for {} columns",
            column_names.len(),
            columns.len()
        ));
    }
    if columns.iter().any(|c| c.len() != row_names.len()) {
        return Err(anyhow::anyhow!(
            "row names don't match: {} names for columns of length {:?}",
            row_names.len(),
            columns.first().map(|c| c.len())
        ));
    }

    let properties = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(ZSTD_LEVEL)?))
        .build();

    let schema = table_schema(row_column, column_names, T::PHYSICAL)?;
    let mut writer = SerializedFileWriter::new(File::create(file_path)?, schema, Arc::new(properties))?;
    let mut group = writer.next_row_group()?;

    let names: Vec<ByteArray> = row_names.iter().map(|r| ByteArray::from(&**r)).collect();
    write_column::<ByteArrayType>(&mut group, &names)?;
    for column in columns {
        write_column::<T::Column>(&mut group, column)?;
    }

    group.close()?;
    writer.close()?;
    Ok(())
}

fn write_column<D: DataType>(
    group: &mut SerializedRowGroupWriter<'_, File>,
    values: &[D::T],
) -> anyhow::Result<()> {
    let mut column = group
        .next_column()?
        .ok_or(anyhow::anyhow!("more columns than the schema"))?;
    column.typed::<D>().write_batch(values, None, None)?;
    column.close()?;
    Ok(())
}

fn table_schema(
    row_column: &str,
    column_names: &[Box<str>],
    physical: PhysicalType,
) -> anyhow::Result<Arc<Type>> {
    let mut fields = vec![Arc::new(
        Type::primitive_type_builder(row_column, PhysicalType::BYTE_ARRAY)
            .with_repetition(Repetition::REQUIRED)
            .with_converted_type(ConvertedType::UTF8)
            .build()?,
    )];

    for name in column_names {
        fields.push(Arc::new(
            Type::primitive_type_builder(name, physical)
                .with_repetition(Repetition::REQUIRED)
                .build()?,
        ));
    }

    Ok(Arc::new(
        Type::group_type_builder("table").with_fields(fields).build()?,
    ))
}

fn is_numeric(physical: PhysicalType) -> bool {
    matches!(
        physical,
        PhysicalType::FLOAT | PhysicalType::DOUBLE | PhysicalType::INT32 | PhysicalType::INT64
    )
}

fn as_f64(field: &Field) -> Option<f64> {
    match field {
        Field::Float(x) => Some(*x as f64),
        Field::Double(x) => Some(*x),
        Field::Int(x) => Some(*x as f64),
        Field::Long(x) => Some(*x as f64),
        _ => None,
    }
}
