//! Shared configuration types for the batch pipeline and the merger.

mod batch;
mod db;
mod retry;
mod source;

pub use batch::BatchConfig;
pub use db::DbConfig;
pub use retry::RetryConfig;
pub use source::{FhirVersion, SinkFhirConfig, SourceFhirConfig};

use thiserror::Error;

/// Validation failure for a configuration value.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A field holds a value outside its allowed range or shape.
    #[error("invalid value for '{field}': {constraint}")]
    InvalidFieldValue { field: String, constraint: String },

    /// A field required by the selected mode is missing.
    #[error("missing required field '{field}': {reason}")]
    MissingField { field: String, reason: String },
}
