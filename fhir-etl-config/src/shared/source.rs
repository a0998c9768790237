use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// FHIR specification version spoken by the source server.
///
/// Both versions use the same search-paging protocol; the version selects
/// which set of structure definitions the schema registry loads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FhirVersion {
    Dstu3,
    R4,
}

impl Default for FhirVersion {
    fn default() -> Self {
        FhirVersion::R4
    }
}

impl fmt::Display for FhirVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FhirVersion::Dstu3 => write!(f, "DSTU3"),
            FhirVersion::R4 => write!(f, "R4"),
        }
    }
}

impl FromStr for FhirVersion {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "DSTU3" => Ok(FhirVersion::Dstu3),
            "R4" => Ok(FhirVersion::R4),
            other => Err(ValidationError::InvalidFieldValue {
                field: "fhir_version".to_string(),
                constraint: format!("unsupported FHIR version '{other}', expected DSTU3 or R4"),
            }),
        }
    }
}

/// Connection settings for the source FHIR server.
///
/// This intentionally does not implement [`Serialize`] to avoid accidentally
/// leaking credentials into serialized forms.
#[derive(Clone, Debug, Deserialize)]
pub struct SourceFhirConfig {
    /// Base URL of the FHIR endpoint, e.g. `http://fhir.example.org/fhir`.
    pub base_url: String,
    /// Username for HTTP basic auth.
    #[serde(default)]
    pub username: Option<String>,
    /// Password for HTTP basic auth.
    #[serde(default)]
    pub password: Option<String>,
    /// Bearer token; mutually exclusive with basic auth.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl SourceFhirConfig {
    /// Validates source connection settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.base_url.is_empty() {
            return Err(ValidationError::MissingField {
                field: "base_url".to_string(),
                reason: "a source FHIR endpoint is required".to_string(),
            });
        }

        if self.bearer_token.is_some() && self.username.is_some() {
            return Err(ValidationError::InvalidFieldValue {
                field: "bearer_token".to_string(),
                constraint: "bearer token and basic auth are mutually exclusive".to_string(),
            });
        }

        Ok(())
    }

    /// Returns the base URL without a trailing slash.
    pub fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

/// Connection settings for the optional mirror FHIR server.
#[derive(Clone, Debug, Deserialize)]
pub struct SinkFhirConfig {
    /// Base URL of the mirror FHIR endpoint.
    pub base_url: String,
    /// Username for HTTP basic auth.
    #[serde(default)]
    pub username: Option<String>,
    /// Password for HTTP basic auth.
    #[serde(default)]
    pub password: Option<String>,
}

impl SinkFhirConfig {
    /// Validates sink connection settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.base_url.is_empty() {
            return Err(ValidationError::MissingField {
                field: "base_url".to_string(),
                reason: "the sink FHIR endpoint cannot be empty when configured".to_string(),
            });
        }

        Ok(())
    }

    /// Returns the base URL without a trailing slash.
    pub fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}
