//! Error types for the merger crate.

use thiserror::Error;

/// Errors that can occur during merge operations.
#[derive(Error, Debug)]
pub enum MergerError {
    /// Error from Arrow operations.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Error from the Parquet reader or writer.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Filesystem failure while reading or writing a warehouse root.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the core ETL library (warehouse layout, schema registry).
    #[error("etl error: {0}")]
    Etl(#[from] fhir_etl::error::EtlError),

    /// Invalid flags or directories.
    #[error("configuration error: {0}")]
    Config(String),

    /// A record stream lacks a column the merge keys on.
    #[error("record stream for '{dir}' is missing the '{column}' column")]
    MissingColumn { dir: String, column: String },

    /// A record has a null id.
    #[error("record in '{dir}' has a null id")]
    NullId { dir: String },

    /// A record has no `meta.lastUpdated` to order by.
    #[error("record '{id}' has no meta.lastUpdated")]
    MissingLastUpdated { id: String },

    /// A view definition document could not be used.
    #[error("view definition '{path}': {reason}")]
    ViewDefinition { path: String, reason: String },
}

impl MergerError {
    /// Process exit code when this error reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            MergerError::Config(_) => 1,
            _ => 2,
        }
    }
}

/// Result type for merger operations.
pub type MergerResult<T> = Result<T, MergerError>;
