//! FHIR StructureDefinition parsing for schema resolution.
//!
//! Only the pieces needed to derive warehouse columns are modeled: element
//! paths, cardinality, and primitive type codes. Complex elements stay inside
//! the JSON carrier column.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use arrow::datatypes::DataType;
use serde::Deserialize;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;

#[derive(Debug, Deserialize)]
struct StructureDefinitionDoc {
    #[serde(rename = "resourceType", default)]
    resource_type: String,
    #[serde(rename = "type", default)]
    type_name: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    snapshot: Option<ElementList>,
    #[serde(default)]
    differential: Option<ElementList>,
}

#[derive(Debug, Default, Deserialize)]
struct ElementList {
    #[serde(default)]
    element: Vec<ElementDefinition>,
}

#[derive(Debug, Deserialize)]
struct ElementDefinition {
    #[serde(default)]
    path: String,
    #[serde(rename = "type", default)]
    types: Vec<ElementType>,
    #[serde(default)]
    max: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ElementType {
    #[serde(default)]
    code: String,
}

/// One profile-derived warehouse column.
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileElement {
    /// Element path with dots replaced by underscores, e.g. `birthDate` or
    /// `maritalStatus_text`.
    pub column_name: String,
    pub data_type: DataType,
}

/// Maps a FHIR primitive type code to an Arrow type; `None` for complex types.
fn primitive_arrow_type(code: &str) -> Option<DataType> {
    match code {
        "string" | "code" | "uri" | "url" | "canonical" | "id" | "oid" | "uuid" | "markdown"
        | "base64Binary" | "xhtml" | "date" | "dateTime" | "instant" | "time" => {
            Some(DataType::Utf8)
        }
        "boolean" => Some(DataType::Boolean),
        "integer" | "positiveInt" | "unsignedInt" | "integer64" => Some(DataType::Int64),
        "decimal" => Some(DataType::Float64),
        _ => None,
    }
}

fn elements_for(doc: &StructureDefinitionDoc, recursive_depth: usize) -> Vec<ProfileElement> {
    let list = doc
        .snapshot
        .as_ref()
        .or(doc.differential.as_ref())
        .map(|l| l.element.as_slice())
        .unwrap_or(&[]);

    let mut elements: Vec<ProfileElement> = list
        .iter()
        .filter_map(|element| {
            let mut segments = element.path.split('.');
            let root = segments.next()?;
            if root != doc.type_name {
                return None;
            }

            let rest: Vec<&str> = segments.collect();
            if rest.is_empty() || rest.len() > recursive_depth {
                return None;
            }

            // Repeating elements and choice types stay in the JSON column.
            if element.max.as_deref() == Some("*") || element.path.contains("[x]") {
                return None;
            }
            if element.max.as_deref() == Some("0") {
                return None;
            }

            let [element_type] = element.types.as_slice() else {
                return None;
            };
            let data_type = primitive_arrow_type(&element_type.code)?;

            Some(ProfileElement {
                column_name: rest.join("_"),
                data_type,
            })
        })
        .collect();

    // Sorted by column name so equal inputs always yield identical schemas.
    elements.sort_by(|a, b| a.column_name.cmp(&b.column_name));
    elements.dedup_by(|a, b| a.column_name == b.column_name);
    elements
}

/// Loads every StructureDefinition from a directory, keyed by resource type.
pub fn load_profile_dir(
    dir: &Path,
    recursive_depth: usize,
) -> EtlResult<HashMap<String, Vec<ProfileElement>>> {
    if !dir.is_dir() {
        return Err(profile_error(dir, "structure definitions path is not a directory"));
    }

    let mut profiles = HashMap::new();
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(|e| profile_error(dir, "unreadable directory").with_source(e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| profile_error(dir, "unreadable directory entry").with_source(e))?;
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| profile_error(&path, "unreadable profile file").with_source(e))?;
        let doc: StructureDefinitionDoc = serde_json::from_str(&contents)
            .map_err(|e| profile_error(&path, "malformed profile json").with_source(e))?;

        if doc.resource_type != "StructureDefinition" || doc.kind != "resource" {
            continue;
        }

        profiles.insert(doc.type_name.clone(), elements_for(&doc, recursive_depth));
    }

    Ok(profiles)
}

fn profile_error(path: &Path, description: &'static str) -> crate::error::EtlError {
    etl_error!(
        ErrorKind::ProfileLoadError,
        description,
        path.display().to_string()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patient_definition() -> serde_json::Value {
        json!({
            "resourceType": "StructureDefinition",
            "kind": "resource",
            "type": "Patient",
            "snapshot": {
                "element": [
                    {"path": "Patient", "max": "*"},
                    {"path": "Patient.birthDate", "max": "1", "type": [{"code": "date"}]},
                    {"path": "Patient.active", "max": "1", "type": [{"code": "boolean"}]},
                    {"path": "Patient.multipleBirth[x]", "max": "1", "type": [{"code": "boolean"}, {"code": "integer"}]},
                    {"path": "Patient.name", "max": "*", "type": [{"code": "HumanName"}]},
                    {"path": "Patient.maritalStatus", "max": "1", "type": [{"code": "CodeableConcept"}]},
                    {"path": "Patient.maritalStatus.text", "max": "1", "type": [{"code": "string"}]}
                ]
            }
        })
    }

    #[test]
    fn test_scalar_primitives_become_columns() {
        let doc: StructureDefinitionDoc = serde_json::from_value(patient_definition()).unwrap();
        let elements = elements_for(&doc, 1);

        assert_eq!(
            elements,
            vec![
                ProfileElement {
                    column_name: "active".to_string(),
                    data_type: DataType::Boolean
                },
                ProfileElement {
                    column_name: "birthDate".to_string(),
                    data_type: DataType::Utf8
                },
            ]
        );
    }

    #[test]
    fn test_recursive_depth_expands_nested_scalars() {
        let doc: StructureDefinitionDoc = serde_json::from_value(patient_definition()).unwrap();
        let elements = elements_for(&doc, 2);

        assert!(elements
            .iter()
            .any(|e| e.column_name == "maritalStatus_text"));
    }

    #[test]
    fn test_load_profile_dir(){
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("patient.json"),
            serde_json::to_string(&patient_definition()).unwrap(),
        )
        .unwrap();
        // Non-resource definitions are skipped.
        fs::write(
            tmp.path().join("extension.json"),
            r#"{"resourceType": "StructureDefinition", "kind": "complex-type", "type": "Extension"}"#,
        )
        .unwrap();

        let profiles = load_profile_dir(tmp.path(), 1).unwrap();
        assert_eq!(profiles.len(), 1);
        assert!(profiles.contains_key("Patient"));
    }

    #[test]
    fn test_malformed_profile_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("broken.json"), "{not json").unwrap();

        let result = load_profile_dir(tmp.path(), 1);
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().kind(),
            crate::error::ErrorKind::ProfileLoadError
        );
    }
}
