//! Batch extraction pipeline.
//!
//! A single-shot orchestration: probe the source for per-type totals, plan
//! the fetch segments (search paging or database id ranges), fan them out to
//! the bounded worker pool, and close the sink. Failures are aggregated and
//! surfaced with the per-type written counts.

use std::sync::Arc;

use fhir_etl_config::shared::{BatchConfig, DbConfig};
use tracing::{info, warn};

use crate::client::{find_base_search_url, FhirClient};
use crate::concurrency::shutdown::{create_shutdown_channel, ShutdownRx, ShutdownTx};
use crate::db::{create_reverse_map, DbPartitioner};
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::metrics::register_metrics;
use crate::segment::{plan_search_segments, FetchTask};
use crate::sink::ParquetSink;
use crate::workers::{ExecutorCounters, SegmentExecutor};

/// What the pipeline should extract and how.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Resource types to extract, e.g. `["Patient", "Encounter"]`.
    pub resources: Vec<String>,
    /// Paging, fanout and sink sizing.
    pub batch: BatchConfig,
    /// When set, ids are read from the backing database instead of paging
    /// the search API.
    pub db: Option<DbConfig>,
}

impl PipelineOptions {
    fn validate(&self) -> EtlResult<()> {
        if self.resources.is_empty() {
            return Err(EtlError::from((
                ErrorKind::ConfigError,
                "at least one resource type must be requested",
            )));
        }
        self.batch.validate()?;
        if let Some(db) = &self.db {
            db.validate()?;
        }
        Ok(())
    }
}

/// Core orchestrator for one batch extraction run.
///
/// The pipeline is a one-shot object: construct it, optionally wire the
/// shutdown handle to a signal handler, call [`BatchPipeline::run`] once.
pub struct BatchPipeline {
    options: PipelineOptions,
    client: Arc<FhirClient>,
    sink: Arc<ParquetSink>,
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
}

impl BatchPipeline {
    /// Creates a pipeline over an already-configured client and sink.
    pub fn new(client: FhirClient, sink: ParquetSink, options: PipelineOptions) -> EtlResult<Self> {
        options.validate()?;
        register_metrics();

        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        Ok(BatchPipeline {
            options,
            client: Arc::new(client),
            sink: Arc::new(sink),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Handle for requesting a graceful shutdown from a signal handler.
    pub fn shutdown_handle(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Runs the extraction to completion.
    ///
    /// Returns the executor counters alongside errors so callers can report
    /// per-type written counts even for failed runs.
    pub async fn run(self) -> (Arc<ExecutorCounters>, EtlResult<()>) {
        let executor = SegmentExecutor::new(
            self.client.clone(),
            self.sink.clone(),
            self.options.batch.worker_count,
            self.shutdown_rx.clone(),
        );
        let counters = executor.counters();

        let mut errors = Vec::new();
        match self.plan_tasks(&executor).await {
            Ok(tasks) => {
                if let Err(error) = executor.run(tasks).await {
                    errors.push(error);
                }
            }
            Err(error) => errors.push(error),
        }

        // The sink is closed regardless: a drained pool plus a clean close
        // keeps every part file readable even on a failed run.
        if let Err(error) = self.sink.close_all() {
            errors.push(error);
        }

        for (resource_type, written) in counters.written_by_type() {
            info!(resource_type = %resource_type, written, "resources written");
        }
        info!(
            written = counters.resources_written(),
            uploaded = counters.resources_uploaded(),
            upload_failures = counters.upload_failures(),
            segments_failed = counters.segments_failed(),
            "pipeline finished"
        );

        let result = if errors.is_empty() {
            Ok(())
        } else {
            Err(EtlError::from_many(errors))
        };
        (counters, result)
    }

    async fn plan_tasks(&self, executor: &SegmentExecutor) -> EtlResult<Vec<FetchTask>> {
        match &self.options.db {
            Some(db) => self.plan_db_tasks(db).await,
            None => self.plan_search_tasks(executor).await,
        }
    }

    async fn plan_db_tasks(&self, db: &DbConfig) -> EtlResult<Vec<FetchTask>> {
        let tables = create_reverse_map(
            &self.options.resources,
            std::path::Path::new(&db.table_fhir_map_path),
        )?;
        info!(tables = tables.len(), "resolved table mapping");

        let partitioner = DbPartitioner::connect(
            db,
            self.options.batch.batch_size,
            self.options.batch.search_fetch_size,
        )
        .await?;

        let batches = partitioner.plan_id_batches(&tables).await?;
        Ok(batches.into_iter().map(FetchTask::Ids).collect())
    }

    async fn plan_search_tasks(&self, executor: &SegmentExecutor) -> EtlResult<Vec<FetchTask>> {
        let page_size = self.options.batch.batch_size;
        let mut tasks = Vec::new();

        for resource_type in &self.options.resources {
            let count_bundle = self
                .client
                .search_for_resource(resource_type, 1, true)
                .await?;
            let total = count_bundle.total.unwrap_or(0);
            if total == 0 {
                info!(resource_type = %resource_type, "no resources on the source, skipping");
                continue;
            }

            let probe = self
                .client
                .search_for_resource(resource_type, 1, false)
                .await?;

            match find_base_search_url(&probe) {
                Ok(page_token) => {
                    let segments = plan_search_segments(&page_token, total, page_size);
                    info!(
                        resource_type = %resource_type,
                        total,
                        segments = segments.len(),
                        "planned search segments"
                    );
                    tasks.extend(segments.into_iter().map(FetchTask::Page));
                }
                Err(error) if error.kind() == ErrorKind::NoNextLink && total <= 1 => {
                    // The whole type fit in the probe page; there is no
                    // cursor to page against.
                    info!(resource_type = %resource_type, total, "single-page resource type");
                    executor.ingest_bundle(&probe).await?;
                }
                Err(error) => {
                    warn!(resource_type = %resource_type, error = %error, "probe bundle link unusable");
                    return Err(error);
                }
            }
        }

        Ok(tasks)
    }
}
