//! CLI binary for merging two warehouse snapshots.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use fhir_etl::schema::SchemaRegistry;
use fhir_etl_config::shared::FhirVersion;
use fhir_etl_merger::{Merger, MergerConfig, MergerError, MergerResult};
use fhir_etl_telemetry::tracing::init_tracing;

/// Merges two FHIR Parquet warehouses with per-id deduplication.
#[derive(Parser, Debug)]
#[command(name = "fhir-etl-merger")]
#[command(about = "Merges two FHIR Parquet warehouses with deduplication")]
struct Args {
    /// First input warehouse root (the older snapshot)
    #[arg(long)]
    dwh1: PathBuf,

    /// Second input warehouse root; wins ties on equal lastUpdated
    #[arg(long)]
    dwh2: PathBuf,

    /// Output warehouse root
    #[arg(long)]
    merged_dwh: PathBuf,

    /// Maximum rows per Parquet row group in the merged output
    #[arg(long)]
    row_group_size: Option<usize>,

    /// Accepted for compatibility with dataflow-runner deployments; the
    /// native worker pool does not shard output files
    #[arg(long)]
    num_shards: Option<usize>,

    /// Also merge materialized view directories
    #[arg(long, default_value_t = false)]
    merge_parquet_views: bool,

    /// Directory of view definition documents
    #[arg(long)]
    view_definitions_dir: Option<PathBuf>,

    /// FHIR version of the warehouses: DSTU3 or R4
    #[arg(long, default_value = "R4")]
    fhir_version: String,

    /// Directory of StructureDefinition JSON files (optional)
    #[arg(long)]
    structure_definitions_path: Option<PathBuf>,

    /// How many path segments below the resource root are typed columns
    #[arg(long, default_value_t = 1)]
    recursive_depth: usize,
}

fn main() -> ExitCode {
    init_tracing();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(error) => {
            if error.use_stderr() {
                eprintln!("{error}");
                return ExitCode::from(1);
            }
            let _ = error.print();
            return ExitCode::SUCCESS;
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = %error, "merge failed");
            ExitCode::from(error.exit_code() as u8)
        }
    }
}

fn run(args: Args) -> MergerResult<()> {
    let fhir_version: FhirVersion = args
        .fhir_version
        .parse()
        .map_err(|e: fhir_etl_config::shared::ValidationError| MergerError::Config(e.to_string()))?;

    if args.merge_parquet_views && args.view_definitions_dir.is_none() {
        return Err(MergerError::Config(
            "--view-definitions-dir cannot be empty with --merge-parquet-views".to_string(),
        ));
    }
    if args.num_shards.is_some() {
        warn!("--num-shards is accepted for compatibility and ignored");
    }

    let registry = Arc::new(SchemaRegistry::new(
        fhir_version,
        args.structure_definitions_path.as_deref(),
        args.recursive_depth,
    )?);

    let mut config = MergerConfig::new(args.dwh1, args.dwh2, args.merged_dwh)
        .with_row_group_rows(args.row_group_size);
    if let Some(views_dir) = args.view_definitions_dir.filter(|_| args.merge_parquet_views) {
        config = config.with_views(views_dir);
    }

    let merger = Merger::new(config, registry)?;
    let summary = merger.run()?;

    info!(
        resource_types_merged = summary.resource_types_merged,
        resource_types_copied = summary.resource_types_copied,
        views_merged = summary.views_merged,
        duplicates = summary.counters.num_duplicates,
        output_records = summary.counters.num_output_records,
        "merge finished"
    );
    Ok(())
}
