//! CLI binary for the batch extraction pipeline.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use fhir_etl::client::FhirClient;
use fhir_etl::dwh::DwhFiles;
use fhir_etl::error::{ErrorKind, EtlError, EtlResult};
use fhir_etl::pipeline::{BatchPipeline, PipelineOptions};
use fhir_etl::schema::SchemaRegistry;
use fhir_etl::sink::ParquetSink;
use fhir_etl_config::shared::{
    BatchConfig, DbConfig, FhirVersion, RetryConfig, SinkFhirConfig, SourceFhirConfig,
};
use fhir_etl_telemetry::tracing::init_tracing;

/// Extracts FHIR resources into a Parquet warehouse, optionally mirroring
/// them to a second FHIR server.
#[derive(Parser, Debug)]
#[command(name = "fhir-etl-batch")]
#[command(about = "Batch FHIR to Parquet extraction")]
struct Args {
    /// Base URL of the source FHIR server
    #[arg(long)]
    source_url: String,

    /// Username for basic auth against the source
    #[arg(long)]
    source_user: Option<String>,

    /// Password for basic auth against the source
    #[arg(long)]
    source_password: Option<String>,

    /// Bearer token for the source; mutually exclusive with basic auth
    #[arg(long)]
    source_bearer_token: Option<String>,

    /// Base URL of the mirror FHIR server (optional)
    #[arg(long)]
    sink_fhir_url: Option<String>,

    /// Username for the mirror server
    #[arg(long)]
    sink_user: Option<String>,

    /// Password for the mirror server
    #[arg(long)]
    sink_password: Option<String>,

    /// Root directory of the output Parquet warehouse
    #[arg(long)]
    output_parquet_path: PathBuf,

    /// Comma-separated resource types to extract
    #[arg(long, value_delimiter = ',')]
    resources: Vec<String>,

    /// Search page size, and id-range width in database mode
    #[arg(long, default_value_t = BatchConfig::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Maximum ids in a single _id fetch
    #[arg(long, default_value_t = BatchConfig::DEFAULT_SEARCH_FETCH_SIZE)]
    fetch_size: usize,

    /// Number of parallel fetch workers
    #[arg(long, default_value_t = BatchConfig::DEFAULT_WORKER_COUNT)]
    worker_count: usize,

    /// Byte budget per Parquet part file before rotation
    #[arg(long, default_value_t = BatchConfig::DEFAULT_ROW_GROUP_SIZE)]
    row_group_size: usize,

    /// Read ids from the backing database instead of paging the search API
    #[arg(long, default_value_t = false)]
    db_mode: bool,

    /// Database URL, e.g. postgres://host:5432/openmrs
    #[arg(long)]
    db_url: Option<String>,

    /// Database user
    #[arg(long)]
    db_user: Option<String>,

    /// Database password
    #[arg(long)]
    db_password: Option<String>,

    /// Path to the table-to-resource mapping JSON (database mode)
    #[arg(long)]
    table_fhir_map_path: Option<String>,

    /// FHIR version of the source: DSTU3 or R4
    #[arg(long, default_value = "R4")]
    fhir_version: String,

    /// Directory of StructureDefinition JSON files (optional)
    #[arg(long)]
    structure_definitions_path: Option<PathBuf>,

    /// How many path segments below the resource root become typed columns
    #[arg(long, default_value_t = 1)]
    recursive_depth: usize,

    /// Attempts for transient source failures, including the first
    #[arg(long, default_value_t = RetryConfig::DEFAULT_MAX_ATTEMPTS)]
    retry_max_attempts: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(error) => {
            // Flag errors are configuration errors: exit 1.
            if error.use_stderr() {
                eprintln!("{error}");
                return ExitCode::from(1);
            }
            let _ = error.print();
            return ExitCode::SUCCESS;
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = %error, "pipeline failed");
            ExitCode::from(error.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> EtlResult<()> {
    let fhir_version: FhirVersion = args.fhir_version.parse().map_err(EtlError::from)?;

    let source = SourceFhirConfig {
        base_url: args.source_url,
        username: args.source_user,
        password: args.source_password,
        bearer_token: args.source_bearer_token,
    };

    let sink_fhir = args.sink_fhir_url.map(|base_url| SinkFhirConfig {
        base_url,
        username: args.sink_user,
        password: args.sink_password,
    });

    let db = if args.db_mode {
        let url = args.db_url.ok_or_else(|| {
            EtlError::from((ErrorKind::ConfigError, "--db-url is required with --db-mode"))
        })?;
        let table_fhir_map_path = args.table_fhir_map_path.ok_or_else(|| {
            EtlError::from((
                ErrorKind::ConfigError,
                "--table-fhir-map-path is required with --db-mode",
            ))
        })?;
        Some(DbConfig {
            url,
            user: args.db_user,
            password: args.db_password,
            table_fhir_map_path,
            min_connections: DbConfig::DEFAULT_MIN_CONNECTIONS,
        })
    } else {
        None
    };

    let batch = BatchConfig {
        batch_size: args.batch_size,
        search_fetch_size: args.fetch_size,
        worker_count: args.worker_count,
        row_group_size: args.row_group_size,
    };

    let retry = RetryConfig {
        max_attempts: args.retry_max_attempts,
        ..Default::default()
    };

    let registry = std::sync::Arc::new(SchemaRegistry::new(
        fhir_version,
        args.structure_definitions_path.as_deref(),
        args.recursive_depth,
    )?);

    let dwh = DwhFiles::for_root(&args.output_parquet_path)?;
    let sink = ParquetSink::new(dwh, registry, args.row_group_size);
    let client = FhirClient::new(source, sink_fhir, retry, args.worker_count)?;

    let options = PipelineOptions {
        resources: args.resources,
        batch,
        db,
    };
    let pipeline = BatchPipeline::new(client, sink, options)?;

    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining in-flight segments");
            let _ = shutdown.send(true);
        }
    });

    let (counters, result) = pipeline.run().await;

    if let Err(error) = result {
        eprintln!("run failed: {error}");
        for (resource_type, written) in counters.written_by_type() {
            eprintln!("  {resource_type}: {written} resources written");
        }
        return Err(error);
    }

    Ok(())
}
