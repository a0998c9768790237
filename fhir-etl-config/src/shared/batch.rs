use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Batch processing configuration for the extraction pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Page size for FHIR search requests, and id-range width in database mode.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum number of ids joined into a single `_id=a,b,c` fetch.
    #[serde(default = "default_search_fetch_size")]
    pub search_fetch_size: usize,
    /// Number of parallel fetch workers; also the HTTP connection pool ceiling.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Approximate byte budget for a Parquet part file before rotation.
    #[serde(default = "default_row_group_size")]
    pub row_group_size: usize,
}

impl BatchConfig {
    /// Default page size for search requests.
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    /// Default id chunk size for `_id` fetches.
    pub const DEFAULT_SEARCH_FETCH_SIZE: usize = 100;

    /// Default number of parallel fetch workers.
    pub const DEFAULT_WORKER_COUNT: usize = 4;

    /// Default part-file byte budget (128 MiB, the Parquet row-group sweet spot).
    pub const DEFAULT_ROW_GROUP_SIZE: usize = 128 * 1024 * 1024;

    /// Validates batch configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.search_fetch_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "search_fetch_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.worker_count == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "worker_count".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.row_group_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "row_group_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            search_fetch_size: default_search_fetch_size(),
            worker_count: default_worker_count(),
            row_group_size: default_row_group_size(),
        }
    }
}

fn default_batch_size() -> usize {
    BatchConfig::DEFAULT_BATCH_SIZE
}

fn default_search_fetch_size() -> usize {
    BatchConfig::DEFAULT_SEARCH_FETCH_SIZE
}

fn default_worker_count() -> usize {
    BatchConfig::DEFAULT_WORKER_COUNT
}

fn default_row_group_size() -> usize {
    BatchConfig::DEFAULT_ROW_GROUP_SIZE
}
