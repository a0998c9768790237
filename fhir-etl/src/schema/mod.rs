//! Per-resource-type Arrow schema resolution.
//!
//! Every resource type gets a fixed set of base columns (id, version,
//! last-updated instant, tags, and the verbatim resource JSON) plus typed
//! columns derived from the profile's structure definition when one was
//! loaded. Identical inputs always resolve to identical schemas; the merger
//! relies on this for file interchange between runs.

pub mod structure_definition;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef};
use fhir_etl_config::shared::FhirVersion;
use tracing::info;

use crate::error::{ErrorKind, EtlResult};
use crate::schema::structure_definition::{load_profile_dir, ProfileElement};
use crate::{bail, etl_error};

/// Column holding the resource id.
pub const ID_COLUMN: &str = "id";
/// Column holding `meta.versionId`.
pub const VERSION_ID_COLUMN: &str = "version_id";
/// Column holding `meta.lastUpdated` as an ISO-8601 string.
pub const LAST_UPDATED_COLUMN: &str = "last_updated";
/// Column holding `meta.tag` as a list of `{system, code}` structs.
pub const TAGS_COLUMN: &str = "tags";
/// Column holding the verbatim resource JSON.
pub const RESOURCE_COLUMN: &str = "resource";

/// Struct field for a tag's system.
pub const TAG_SYSTEM_FIELD: &str = "system";
/// Struct field for a tag's code.
pub const TAG_CODE_FIELD: &str = "code";

/// Fields of one `meta.tag` entry.
pub fn tag_struct_fields() -> Fields {
    Fields::from(vec![
        Field::new(TAG_SYSTEM_FIELD, DataType::Utf8, true),
        Field::new(TAG_CODE_FIELD, DataType::Utf8, true),
    ])
}

/// The `tags` list field shared by every resource schema.
pub fn tags_field() -> Field {
    Field::new(
        TAGS_COLUMN,
        DataType::List(Arc::new(Field::new(
            "item",
            DataType::Struct(tag_struct_fields()),
            true,
        ))),
        true,
    )
}

fn base_fields() -> Vec<Field> {
    vec![
        Field::new(ID_COLUMN, DataType::Utf8, false),
        Field::new(VERSION_ID_COLUMN, DataType::Utf8, true),
        Field::new(LAST_UPDATED_COLUMN, DataType::Utf8, true),
        tags_field(),
        Field::new(RESOURCE_COLUMN, DataType::Utf8, false),
    ]
}

/// Resolves and caches one Arrow schema per resource type.
///
/// Read-mostly after warm-up; `schema_for` takes the write lock only on the
/// first request for a type.
#[derive(Debug)]
pub struct SchemaRegistry {
    version: FhirVersion,
    profiles: Option<HashMap<String, Vec<ProfileElement>>>,
    cache: RwLock<HashMap<String, SchemaRef>>,
}

impl SchemaRegistry {
    /// Creates a registry, loading structure definitions when a directory is
    /// given. `recursive_depth` bounds how many path segments below the
    /// resource root are expanded into typed columns.
    pub fn new(
        version: FhirVersion,
        structure_definitions_dir: Option<&Path>,
        recursive_depth: usize,
    ) -> EtlResult<Self> {
        let profiles = match structure_definitions_dir {
            Some(dir) => {
                let profiles = load_profile_dir(dir, recursive_depth)?;
                info!(
                    fhir_version = %version,
                    profiles = profiles.len(),
                    dir = %dir.display(),
                    "loaded structure definitions"
                );
                Some(profiles)
            }
            None => None,
        };

        Ok(SchemaRegistry {
            version,
            profiles,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// The FHIR version this registry was built for.
    pub fn version(&self) -> FhirVersion {
        self.version
    }

    /// Returns the Arrow schema for a resource type.
    ///
    /// Idempotent and thread-safe. Fails with `UnknownResourceType` when
    /// structure definitions were loaded but none covers the type.
    pub fn schema_for(&self, resource_type: &str) -> EtlResult<SchemaRef> {
        if resource_type.is_empty() {
            bail!(ErrorKind::SchemaError, "resource type cannot be empty");
        }

        if let Some(schema) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(resource_type)
        {
            return Ok(schema.clone());
        }

        let mut fields = base_fields();
        if let Some(profiles) = &self.profiles {
            let elements = profiles.get(resource_type).ok_or_else(|| {
                etl_error!(
                    ErrorKind::UnknownResourceType,
                    "no structure definition for resource type",
                    resource_type
                )
            })?;

            for element in elements {
                // Base columns win on name collisions.
                if fields.iter().any(|f| f.name() == &element.column_name) {
                    continue;
                }
                fields.push(Field::new(
                    &element.column_name,
                    element.data_type.clone(),
                    true,
                ));
            }
        }

        let schema: SchemaRef = Arc::new(Schema::new(fields));
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(resource_type.to_string(), schema.clone());
        Ok(schema)
    }
}
