use serde::Deserialize;

use crate::shared::ValidationError;

/// Connection settings for direct extraction from the record server's
/// relational store.
///
/// Not [`serde::Serialize`]: the password must not leak into serialized forms.
#[derive(Clone, Debug, Deserialize)]
pub struct DbConfig {
    /// Database URL, e.g. `postgres://host:5432/openmrs`.
    pub url: String,
    /// Database user.
    #[serde(default)]
    pub user: Option<String>,
    /// Database password.
    #[serde(default)]
    pub password: Option<String>,
    /// Path to the table-to-resource mapping JSON file.
    pub table_fhir_map_path: String,
    /// Minimum number of pooled connections kept open.
    ///
    /// Kept fixed rather than letting the pool shrink; some drivers behind
    /// the warehouse mishandle pool shrink under load.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl DbConfig {
    /// Default minimum pool size.
    pub const DEFAULT_MIN_CONNECTIONS: u32 = 4;

    /// Validates database connection settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.is_empty() {
            return Err(ValidationError::MissingField {
                field: "url".to_string(),
                reason: "a database URL is required in database mode".to_string(),
            });
        }

        if self.table_fhir_map_path.is_empty() {
            return Err(ValidationError::MissingField {
                field: "table_fhir_map_path".to_string(),
                reason: "database mode needs the table-to-resource mapping file".to_string(),
            });
        }

        Ok(())
    }
}

fn default_min_connections() -> u32 {
    DbConfig::DEFAULT_MIN_CONNECTIONS
}
