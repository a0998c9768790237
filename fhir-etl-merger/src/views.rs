//! Materialized view definitions.
//!
//! A view definition is a SQL-on-FHIR style projection document: a name, the
//! resource type it projects, and a flat column list. The merger derives the
//! view's Arrow schema from the column list rather than the resource schema.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::Deserialize;

use crate::error::{MergerError, MergerResult};

/// One projected column of a view.
#[derive(Clone, Debug, Deserialize)]
pub struct ViewColumn {
    pub name: String,
    /// FHIR-style type name; anything non-numeric lands as a string column.
    #[serde(rename = "type", default = "default_column_type")]
    pub column_type: String,
}

fn default_column_type() -> String {
    "string".to_string()
}

/// A view definition document.
#[derive(Clone, Debug, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    #[serde(default)]
    pub resource: String,
    pub columns: Vec<ViewColumn>,
}

impl ViewDefinition {
    /// Derives the view's Arrow schema from its column list.
    pub fn arrow_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|column| {
                let data_type = match column.column_type.as_str() {
                    "integer" | "positiveInt" | "unsignedInt" | "integer64" => DataType::Int64,
                    "decimal" => DataType::Float64,
                    "boolean" => DataType::Boolean,
                    _ => DataType::Utf8,
                };
                // The id column is the merge key and must be present.
                Field::new(&column.name, data_type, column.name != "id")
            })
            .collect();

        Arc::new(Schema::new(fields))
    }

    fn validate(&self, path: &Path) -> MergerResult<()> {
        if self.name.is_empty() {
            return Err(MergerError::ViewDefinition {
                path: path.display().to_string(),
                reason: "view name is empty".to_string(),
            });
        }
        if !self.columns.iter().any(|c| c.name == "id") {
            return Err(MergerError::ViewDefinition {
                path: path.display().to_string(),
                reason: "view has no id column to merge on".to_string(),
            });
        }
        Ok(())
    }
}

/// Loads every view definition JSON in a directory, keyed by view name.
pub fn load_view_dir(dir: &Path) -> MergerResult<HashMap<String, ViewDefinition>> {
    if !dir.is_dir() {
        return Err(MergerError::Config(format!(
            "view definitions path '{}' is not a directory",
            dir.display()
        )));
    }

    let mut views = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }

        let contents = fs::read_to_string(&path)?;
        let view: ViewDefinition =
            serde_json::from_str(&contents).map_err(|e| MergerError::ViewDefinition {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        view.validate(&path)?;
        views.insert(view.name.clone(), view);
    }

    Ok(views)
}
