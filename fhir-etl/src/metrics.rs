use std::sync::Once;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

static REGISTER_METRICS: Once = Once::new();

pub const ETL_RESOURCES_WRITTEN_TOTAL: &str = "fhir_etl_resources_written_total";
pub const ETL_RESOURCES_UPLOADED_TOTAL: &str = "fhir_etl_resources_uploaded_total";
pub const ETL_UPLOAD_FAILURES_TOTAL: &str = "fhir_etl_upload_failures_total";
pub const ETL_SEGMENTS_FAILED_TOTAL: &str = "fhir_etl_segments_failed_total";
pub const ETL_FETCH_DURATION_MILLISECONDS: &str = "fhir_etl_fetch_duration_milliseconds";
pub const ETL_FETCH_WORKERS_ACTIVE: &str = "fhir_etl_fetch_workers_active";
pub const ETL_PARQUET_FILES_TOTAL: &str = "fhir_etl_parquet_files_total";

/// Label key for the FHIR resource type.
pub const RESOURCE_TYPE_LABEL: &str = "resource_type";
/// Label key for the fetch strategy ("search" or "db").
pub const MODE_LABEL: &str = "mode";

/// Register metrics emitted by the pipeline. Safe to call multiple times;
/// registration happens only once.
pub(crate) fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            ETL_RESOURCES_WRITTEN_TOTAL,
            Unit::Count,
            "Total number of resources written to the Parquet warehouse"
        );

        describe_counter!(
            ETL_RESOURCES_UPLOADED_TOTAL,
            Unit::Count,
            "Total number of resources uploaded to the mirror FHIR server"
        );

        describe_counter!(
            ETL_UPLOAD_FAILURES_TOTAL,
            Unit::Count,
            "Resources that failed to upload to the mirror FHIR server"
        );

        describe_counter!(
            ETL_SEGMENTS_FAILED_TOTAL,
            Unit::Count,
            "Fetch segments abandoned after exhausting permanent-failure handling"
        );

        describe_histogram!(
            ETL_FETCH_DURATION_MILLISECONDS,
            Unit::Milliseconds,
            "Time taken to fetch one segment from the source FHIR server"
        );

        describe_gauge!(
            ETL_FETCH_WORKERS_ACTIVE,
            Unit::Count,
            "Number of fetch workers currently processing a segment"
        );

        describe_counter!(
            ETL_PARQUET_FILES_TOTAL,
            Unit::Count,
            "Parquet part files finalized by the sink"
        );
    });
}
