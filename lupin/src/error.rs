use thiserror::Error;

/// Errors raised by the surgery pipeline itself; library errors
/// (candle, hdf5, parquet) pass through `anyhow` untouched.
#[derive(Debug, Error)]
pub enum LupinError {
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("invalid freeze level: {0} (expected 0, 1 or 2)")]
    InvalidFreezeLevel(i64),

    #[error("missing column `{column}` in {file}")]
    MissingColumn { column: String, file: String },

    #[error("unknown condition: {0}")]
    UnknownCondition(String),

    #[error("condition already encoded: {0}")]
    DuplicateCondition(String),

    #[error("model has {model} conditions but the encoder has {encoder}")]
    ConditionCountMismatch { model: usize, encoder: usize },

    #[error("batch `{batch}` has {n_cells} cell(s); at least 3 are needed for a train/validation split")]
    BatchTooSmall { batch: String, n_cells: usize },
}
