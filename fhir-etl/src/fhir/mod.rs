//! Minimal FHIR data model for the pipeline.
//!
//! Resources are carried as raw JSON plus the handful of extracted fields the
//! warehouse and the merger key on (`id`, `resourceType`, `meta`). Keeping the
//! body verbatim is what makes the warehouse round-trip faithful.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;

/// Tag system marking a resource as deleted in an incremental snapshot.
pub const REMOVE_TAG_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v3-ActionType";
/// Tag code marking a resource as deleted in an incremental snapshot.
pub const REMOVE_TAG_CODE: &str = "REMOVE";

/// A `(system, code)` pair from `meta.tag`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Coding {
    /// True when this coding is the REMOVE tombstone tag.
    pub fn is_remove_tag(&self) -> bool {
        self.system.as_deref() == Some(REMOVE_TAG_SYSTEM)
            && self.code.as_deref() == Some(REMOVE_TAG_CODE)
    }
}

/// Resource metadata: version, last-updated instant, and tags.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "versionId", default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(
        rename = "lastUpdated",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<Coding>,
}

/// One FHIR resource: the extracted key fields plus the verbatim JSON body.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub id: String,
    pub resource_type: String,
    pub meta: Meta,
    body: serde_json::Value,
}

impl Resource {
    /// Extracts a resource from its JSON representation.
    ///
    /// `id` and `resourceType` are required; `meta` may be absent.
    pub fn from_json(body: serde_json::Value) -> EtlResult<Self> {
        let resource_type = body
            .get("resourceType")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                etl_error!(
                    ErrorKind::ConversionError,
                    "resource is missing the resourceType field"
                )
            })?
            .to_string();

        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                etl_error!(
                    ErrorKind::ConversionError,
                    "resource is missing the id field",
                    resource_type.clone()
                )
            })?
            .to_string();

        let meta = match body.get("meta") {
            Some(meta) => serde_json::from_value(meta.clone())?,
            None => Meta::default(),
        };

        Ok(Resource {
            id,
            resource_type,
            meta,
            body,
        })
    }

    /// True when the resource carries the REMOVE tombstone tag.
    pub fn is_deleted(&self) -> bool {
        self.meta.tag.iter().any(Coding::is_remove_tag)
    }

    /// The verbatim JSON body.
    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    /// Serializes the body back to a JSON string.
    pub fn to_json_string(&self) -> EtlResult<String> {
        Ok(serde_json::to_string(&self.body)?)
    }
}

/// A link entry in a search bundle.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BundleLink {
    #[serde(default)]
    pub relation: String,
    #[serde(default)]
    pub url: String,
}

/// One entry in a search bundle; the resource is kept as raw JSON.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BundleEntry {
    #[serde(default)]
    pub resource: Option<serde_json::Value>,
}

/// A FHIR search response: total count, continuation links, and entries.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub link: Vec<BundleLink>,
    #[serde(default)]
    pub entry: Vec<BundleEntry>,
}

impl Bundle {
    /// Returns the URL of the `next` continuation link, if any.
    pub fn next_link(&self) -> Option<&str> {
        self.link
            .iter()
            .find(|l| l.relation == "next")
            .map(|l| l.url.as_str())
    }

    /// Extracts every entry's resource, failing on malformed entries.
    pub fn resources(&self) -> EtlResult<Vec<Resource>> {
        self.entry
            .iter()
            .filter_map(|e| e.resource.clone())
            .map(Resource::from_json)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patient(id: &str, last_updated: &str) -> serde_json::Value {
        json!({
            "resourceType": "Patient",
            "id": id,
            "meta": {"versionId": "1", "lastUpdated": last_updated},
            "name": [{"family": "Doe"}]
        })
    }

    #[test]
    fn test_resource_extraction() {
        let resource = Resource::from_json(patient("p1", "2024-01-01T00:00:00Z")).unwrap();

        assert_eq!(resource.id, "p1");
        assert_eq!(resource.resource_type, "Patient");
        assert_eq!(resource.meta.version_id.as_deref(), Some("1"));
        assert_eq!(
            resource.meta.last_updated.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert!(!resource.is_deleted());
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let result = Resource::from_json(json!({"resourceType": "Patient"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_remove_tag_marks_deleted() {
        let body = json!({
            "resourceType": "Patient",
            "id": "p1",
            "meta": {
                "lastUpdated": "2024-02-01T00:00:00Z",
                "tag": [
                    {"system": "http://example.org/other", "code": "REMOVE"},
                    {"system": REMOVE_TAG_SYSTEM, "code": REMOVE_TAG_CODE}
                ]
            }
        });

        let resource = Resource::from_json(body).unwrap();
        assert!(resource.is_deleted());
    }

    #[test]
    fn test_matching_code_without_system_is_not_deleted() {
        let body = json!({
            "resourceType": "Patient",
            "id": "p1",
            "meta": {"tag": [{"code": "REMOVE"}]}
        });

        let resource = Resource::from_json(body).unwrap();
        assert!(!resource.is_deleted());
    }

    #[test]
    fn test_bundle_next_link_and_entries() {
        let bundle: Bundle = serde_json::from_value(json!({
            "resourceType": "Bundle",
            "total": 2,
            "link": [
                {"relation": "self", "url": "http://fhir/Patient?_count=2"},
                {"relation": "next", "url": "http://fhir?_getpages=abc&_getpagesoffset=2"}
            ],
            "entry": [
                {"resource": patient("p1", "2024-01-01T00:00:00Z")},
                {"resource": patient("p2", "2024-01-02T00:00:00Z")}
            ]
        }))
        .unwrap();

        assert_eq!(
            bundle.next_link(),
            Some("http://fhir?_getpages=abc&_getpagesoffset=2")
        );

        let resources = bundle.resources().unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[1].id, "p2");
    }
}
