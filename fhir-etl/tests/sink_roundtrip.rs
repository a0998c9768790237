//! Round-trip tests: resources written by the sink read back unchanged.

use std::sync::Arc;

use arrow::array::StringArray;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::json;

use fhir_etl::dwh::DwhFiles;
use fhir_etl::fhir::Resource;
use fhir_etl::schema::SchemaRegistry;
use fhir_etl::sink::ParquetSink;
use fhir_etl_config::shared::FhirVersion;
use fhir_etl_telemetry::tracing::init_test_tracing;

fn read_column(root: &std::path::Path, resource_type: &str, column: &str) -> Vec<String> {
    let dwh = DwhFiles::for_root(root).unwrap();
    let mut values = Vec::new();

    for part in dwh
        .list_part_files(&dwh.resource_path(resource_type))
        .unwrap()
    {
        let reader = ParquetRecordBatchReaderBuilder::try_new(std::fs::File::open(part).unwrap())
            .unwrap()
            .build()
            .unwrap();
        for batch in reader {
            let batch = batch.unwrap();
            let array = batch
                .column_by_name(column)
                .unwrap()
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap();
            for row in 0..batch.num_rows() {
                values.push(array.value(row).to_string());
            }
        }
    }

    values.sort();
    values
}

#[test]
fn test_key_fields_round_trip() {
    init_test_tracing();
    let tmp = tempfile::tempdir().unwrap();

    let body = json!({
        "resourceType": "Patient",
        "id": "p1",
        "meta": {"versionId": "5", "lastUpdated": "2024-03-15T08:30:00.123Z"},
        "birthDate": "1980-07-01",
        "name": [{"family": "Doe", "given": ["Jane"]}]
    });

    let registry = Arc::new(SchemaRegistry::new(FhirVersion::R4, None, 1).unwrap());
    let dwh = DwhFiles::for_root(tmp.path()).unwrap();
    let sink = ParquetSink::new(dwh, registry, 1 << 20);
    sink.write(&Resource::from_json(body.clone()).unwrap()).unwrap();
    sink.close_all().unwrap();

    assert_eq!(read_column(tmp.path(), "Patient", "id"), vec!["p1"]);
    assert_eq!(read_column(tmp.path(), "Patient", "version_id"), vec!["5"]);
    assert_eq!(
        read_column(tmp.path(), "Patient", "last_updated"),
        vec!["2024-03-15T08:30:00.123Z"]
    );

    // The JSON carrier column holds the full resource.
    let carried = read_column(tmp.path(), "Patient", "resource");
    let parsed: serde_json::Value = serde_json::from_str(&carried[0]).unwrap();
    assert_eq!(parsed, body);
}

#[test]
fn test_count_preserved_across_many_writes() {
    init_test_tracing();
    let tmp = tempfile::tempdir().unwrap();

    let registry = Arc::new(SchemaRegistry::new(FhirVersion::R4, None, 1).unwrap());
    let dwh = DwhFiles::for_root(tmp.path()).unwrap();
    // Small part budget so the run spans several part files.
    let sink = ParquetSink::new(dwh, registry, 4096);

    for i in 0..500 {
        let body = json!({
            "resourceType": "Observation",
            "id": format!("obs-{i:04}"),
            "meta": {"versionId": "1", "lastUpdated": "2024-01-01T00:00:00Z"}
        });
        sink.write(&Resource::from_json(body).unwrap()).unwrap();
    }
    sink.close_all().unwrap();

    let ids = read_column(tmp.path(), "Observation", "id");
    assert_eq!(ids.len(), 500);
    assert_eq!(ids[0], "obs-0000");
    assert_eq!(ids[499], "obs-0499");

    let dwh = DwhFiles::for_root(tmp.path()).unwrap();
    let parts = dwh
        .list_part_files(&dwh.resource_path("Observation"))
        .unwrap();
    assert!(parts.len() > 1, "expected rotation across part files");
}

#[test]
fn test_profile_columns_are_populated() {
    init_test_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let profiles = tempfile::tempdir().unwrap();

    std::fs::write(
        profiles.path().join("patient.json"),
        json!({
            "resourceType": "StructureDefinition",
            "kind": "resource",
            "type": "Patient",
            "snapshot": {"element": [
                {"path": "Patient.birthDate", "max": "1", "type": [{"code": "date"}]}
            ]}
        })
        .to_string(),
    )
    .unwrap();

    let registry = Arc::new(
        SchemaRegistry::new(FhirVersion::R4, Some(profiles.path()), 1).unwrap(),
    );
    let dwh = DwhFiles::for_root(tmp.path()).unwrap();
    let sink = ParquetSink::new(dwh, registry, 1 << 20);

    let body = json!({
        "resourceType": "Patient",
        "id": "p1",
        "meta": {"versionId": "1", "lastUpdated": "2024-01-01T00:00:00Z"},
        "birthDate": "1975-11-30"
    });
    sink.write(&Resource::from_json(body).unwrap()).unwrap();
    sink.close_all().unwrap();

    assert_eq!(
        read_column(tmp.path(), "Patient", "birthDate"),
        vec!["1975-11-30"]
    );
}
