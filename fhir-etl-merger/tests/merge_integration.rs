//! Integration tests for the warehouse merger.
//!
//! Each test writes two snapshots through the production Parquet sink, merges
//! them, and reads the merged output back.

use std::path::Path;
use std::sync::Arc;

use arrow::array::StringArray;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::json;

use fhir_etl::dwh::DwhFiles;
use fhir_etl::fhir::{Resource, REMOVE_TAG_CODE, REMOVE_TAG_SYSTEM};
use fhir_etl::schema::SchemaRegistry;
use fhir_etl::sink::ParquetSink;
use fhir_etl_config::shared::FhirVersion;
use fhir_etl_merger::{Merger, MergerConfig};
use fhir_etl_telemetry::tracing::init_test_tracing;

fn registry() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::new(FhirVersion::R4, None, 1).unwrap())
}

/// Writes resources into a snapshot root through the production sink.
fn write_snapshot(root: &Path, resources: &[serde_json::Value]) {
    let dwh = DwhFiles::for_root(root).unwrap();
    let sink = ParquetSink::new(dwh, registry(), 1 << 20);
    for body in resources {
        let resource = Resource::from_json(body.clone()).unwrap();
        sink.write(&resource).unwrap();
    }
    sink.close_all().unwrap();
}

fn resource(resource_type: &str, id: &str, last_updated: &str) -> serde_json::Value {
    json!({
        "resourceType": resource_type,
        "id": id,
        "meta": {"versionId": "1", "lastUpdated": last_updated}
    })
}

fn tombstone(resource_type: &str, id: &str, last_updated: &str) -> serde_json::Value {
    json!({
        "resourceType": resource_type,
        "id": id,
        "meta": {
            "versionId": "2",
            "lastUpdated": last_updated,
            "tag": [{"system": REMOVE_TAG_SYSTEM, "code": REMOVE_TAG_CODE}]
        }
    })
}

/// Reads `(id, last_updated, version_id)` rows of one type from a root.
fn read_records(root: &Path, dir_name: &str) -> Vec<(String, String, String)> {
    let dwh = DwhFiles::for_root(root).unwrap();
    let mut rows = Vec::new();

    for part in dwh.list_part_files(&root.join(dir_name)).unwrap() {
        let reader = ParquetRecordBatchReaderBuilder::try_new(std::fs::File::open(part).unwrap())
            .unwrap()
            .build()
            .unwrap();
        for batch in reader {
            let batch = batch.unwrap();
            let ids = column(&batch, "id");
            let updated = column(&batch, "last_updated");
            let versions = column(&batch, "version_id");
            for row in 0..batch.num_rows() {
                rows.push((
                    ids.value(row).to_string(),
                    updated.value(row).to_string(),
                    versions.value(row).to_string(),
                ));
            }
        }
    }

    rows.sort();
    rows
}

fn column<'a>(batch: &'a arrow::record_batch::RecordBatch, name: &str) -> &'a StringArray {
    batch
        .column_by_name(name)
        .unwrap()
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap()
}

fn merge(dwh1: &Path, dwh2: &Path, merged: &Path) -> fhir_etl_merger::MergeSummary {
    let config = MergerConfig::new(dwh1, dwh2, merged);
    Merger::new(config, registry()).unwrap().run().unwrap()
}

#[test]
fn test_last_writer_wins() {
    init_test_tracing();
    let (a, b, m) = roots();

    write_snapshot(a.path(), &[resource("Observation", "obs-9", "2024-01-01T00:00:00Z")]);
    write_snapshot(b.path(), &[resource("Observation", "obs-9", "2024-06-01T00:00:00Z")]);

    let summary = merge(a.path(), b.path(), m.path());

    let records = read_records(m.path(), "Observation");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1, "2024-06-01T00:00:00Z");
    assert_eq!(summary.counters.num_duplicates, 1);
    assert_eq!(summary.counters.num_output_records, 1);
}

#[test]
fn test_tombstone_erases_record() {
    init_test_tracing();
    let (a, b, m) = roots();

    write_snapshot(a.path(), &[resource("Patient", "p1", "2024-01-01T00:00:00Z")]);
    write_snapshot(b.path(), &[tombstone("Patient", "p1", "2024-02-01T00:00:00Z")]);

    merge(a.path(), b.path(), m.path());

    assert!(read_records(m.path(), "Patient").is_empty());
}

#[test]
fn test_older_tombstone_does_not_erase_newer_record() {
    init_test_tracing();
    let (a, b, m) = roots();

    write_snapshot(a.path(), &[tombstone("Patient", "p1", "2024-01-01T00:00:00Z")]);
    write_snapshot(b.path(), &[resource("Patient", "p1", "2024-03-01T00:00:00Z")]);

    merge(a.path(), b.path(), m.path());

    let records = read_records(m.path(), "Patient");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1, "2024-03-01T00:00:00Z");
}

#[test]
fn test_disjoint_types_are_carried_over() {
    init_test_tracing();
    let (a, b, m) = roots();

    write_snapshot(a.path(), &[resource("Encounter", "e1", "2024-01-01T00:00:00Z")]);
    write_snapshot(b.path(), &[resource("Observation", "o1", "2024-01-02T00:00:00Z")]);

    let summary = merge(a.path(), b.path(), m.path());

    assert_eq!(summary.resource_types_copied, 2);
    assert_eq!(summary.resource_types_merged, 0);
    assert_eq!(
        read_records(m.path(), "Encounter"),
        read_records(a.path(), "Encounter")
    );
    assert_eq!(
        read_records(m.path(), "Observation"),
        read_records(b.path(), "Observation")
    );
}

#[test]
fn test_merge_with_self_is_idempotent() {
    init_test_tracing();
    let (a, _, m) = roots();

    let bodies: Vec<serde_json::Value> = (0..25)
        .map(|i| resource("Patient", &format!("p{i:02}"), "2024-01-01T00:00:00Z"))
        .collect();
    write_snapshot(a.path(), &bodies);

    let summary = merge(a.path(), a.path(), m.path());

    assert_eq!(read_records(m.path(), "Patient"), read_records(a.path(), "Patient"));
    assert_eq!(summary.counters.num_output_records, 25);
    assert_eq!(summary.counters.num_duplicates, 25);
}

#[test]
fn test_equal_timestamps_second_input_wins() {
    init_test_tracing();
    let (a, b, m) = roots();

    let ts = "2024-04-01T00:00:00Z";
    write_snapshot(
        a.path(),
        &[json!({
            "resourceType": "Patient", "id": "p1",
            "meta": {"versionId": "from-dwh1", "lastUpdated": ts}
        })],
    );
    write_snapshot(
        b.path(),
        &[json!({
            "resourceType": "Patient", "id": "p1",
            "meta": {"versionId": "from-dwh2", "lastUpdated": ts}
        })],
    );

    merge(a.path(), b.path(), m.path());

    let records = read_records(m.path(), "Patient");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].2, "from-dwh2");
}

#[test]
fn test_types_file_lists_merged_output() {
    init_test_tracing();
    let (a, b, m) = roots();

    write_snapshot(a.path(), &[resource("Patient", "p1", "2024-01-01T00:00:00Z")]);
    write_snapshot(b.path(), &[resource("Patient", "p1", "2024-01-02T00:00:00Z")]);

    merge(a.path(), b.path(), m.path());

    let merged = DwhFiles::for_root(m.path()).unwrap();
    assert!(merged.read_types_file().unwrap().contains("Patient"));
}

#[test]
fn test_missing_last_updated_is_fatal() {
    init_test_tracing();
    let (a, b, m) = roots();

    write_snapshot(
        a.path(),
        &[json!({"resourceType": "Patient", "id": "p1", "meta": {"versionId": "1"}})],
    );
    write_snapshot(b.path(), &[resource("Patient", "p1", "2024-01-01T00:00:00Z")]);

    let config = MergerConfig::new(a.path(), b.path(), m.path());
    let result = Merger::new(config, registry()).unwrap().run();
    assert!(result.is_err());
}

#[test]
fn test_view_merge_uses_view_schema() {
    init_test_tracing();
    let (a, b, m) = roots();
    let views_dir = tempfile::tempdir().unwrap();

    std::fs::write(
        views_dir.path().join("patient_demographics.json"),
        json!({
            "name": "patient_demographics",
            "resource": "Patient",
            "columns": [
                {"name": "id", "type": "id"},
                {"name": "last_updated", "type": "instant"},
                {"name": "gender", "type": "code"}
            ]
        })
        .to_string(),
    )
    .unwrap();

    write_view_rows(
        a.path(),
        &views_dir.path().join("patient_demographics.json"),
        &[("p1", "2024-01-01T00:00:00Z", "female")],
    );
    write_view_rows(
        b.path(),
        &views_dir.path().join("patient_demographics.json"),
        &[
            ("p1", "2024-02-01T00:00:00Z", "male"),
            ("p2", "2024-02-01T00:00:00Z", "female"),
        ],
    );

    let config = MergerConfig::new(a.path(), b.path(), m.path())
        .with_views(views_dir.path().to_path_buf());
    let summary = Merger::new(config, registry()).unwrap().run().unwrap();

    assert_eq!(summary.views_merged, 1);

    let dwh = DwhFiles::for_root(m.path()).unwrap();
    let views = dwh.find_non_empty_view_types().unwrap();
    assert!(views.contains("patient_demographics"));
}

/// Writes view rows with the view's own schema (no tags, no resource body).
fn write_view_rows(root: &Path, view_def: &Path, rows: &[(&str, &str, &str)]) {
    use arrow::array::ArrayRef;
    use parquet::arrow::ArrowWriter;

    let view: fhir_etl_merger::views::ViewDefinition =
        serde_json::from_str(&std::fs::read_to_string(view_def).unwrap()).unwrap();
    let schema = view.arrow_schema();

    let ids: ArrayRef = Arc::new(StringArray::from(
        rows.iter().map(|(id, _, _)| *id).collect::<Vec<_>>(),
    ));
    let updated: ArrayRef = Arc::new(StringArray::from(
        rows.iter().map(|(_, ts, _)| *ts).collect::<Vec<_>>(),
    ));
    let genders: ArrayRef = Arc::new(StringArray::from(
        rows.iter().map(|(_, _, g)| *g).collect::<Vec<_>>(),
    ));
    let batch =
        arrow::record_batch::RecordBatch::try_new(schema.clone(), vec![ids, updated, genders])
            .unwrap();

    let dwh = DwhFiles::for_root(root).unwrap();
    let dir = dwh.view_path(&view.name);
    std::fs::create_dir_all(&dir).unwrap();
    let file = std::fs::File::create(dir.join(DwhFiles::part_file_name(0))).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

fn roots() -> (tempfile::TempDir, tempfile::TempDir, tempfile::TempDir) {
    (
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    )
}
