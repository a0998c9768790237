//! Bounded fetch worker pool.
//!
//! Consumes the planned fetch tasks, fans them out over `worker_count`
//! workers, and hands every fetched resource to the Parquet sink and, when
//! configured, the mirror FHIR server. Segments are independent: no ordering
//! is promised between them, but within one segment resources are written in
//! bundle order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::client::FhirClient;
use crate::concurrency::shutdown::{is_shutdown_requested, ShutdownRx};
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::metrics::{
    ETL_FETCH_DURATION_MILLISECONDS, ETL_FETCH_WORKERS_ACTIVE, ETL_RESOURCES_WRITTEN_TOTAL,
    ETL_SEGMENTS_FAILED_TOTAL, RESOURCE_TYPE_LABEL,
};
use crate::segment::FetchTask;
use crate::sink::ParquetSink;

/// How long in-flight segments may keep draining after a shutdown signal.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Counters shared between the workers and the pipeline summary.
#[derive(Debug, Default)]
pub struct ExecutorCounters {
    resources_written: AtomicU64,
    resources_uploaded: AtomicU64,
    upload_failures: AtomicU64,
    segments_failed: AtomicU64,
    written_by_type: Mutex<BTreeMap<String, u64>>,
}

impl ExecutorCounters {
    fn record_written(&self, resource_type: &str) {
        self.resources_written.fetch_add(1, Ordering::Relaxed);
        let mut by_type = self.written_by_type.lock().unwrap_or_else(|e| e.into_inner());
        *by_type.entry(resource_type.to_string()).or_insert(0) += 1;
    }

    /// Total resources written to the warehouse.
    pub fn resources_written(&self) -> u64 {
        self.resources_written.load(Ordering::Relaxed)
    }

    /// Resources uploaded to the mirror server.
    pub fn resources_uploaded(&self) -> u64 {
        self.resources_uploaded.load(Ordering::Relaxed)
    }

    /// Mirror uploads that failed.
    pub fn upload_failures(&self) -> u64 {
        self.upload_failures.load(Ordering::Relaxed)
    }

    /// Segments abandoned after a permanent failure.
    pub fn segments_failed(&self) -> u64 {
        self.segments_failed.load(Ordering::Relaxed)
    }

    /// Per-resource-type written counts.
    pub fn written_by_type(&self) -> BTreeMap<String, u64> {
        self.written_by_type
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Fans planned fetch tasks out over a bounded pool of workers.
pub struct SegmentExecutor {
    client: Arc<FhirClient>,
    sink: Arc<ParquetSink>,
    worker_count: usize,
    shutdown_rx: ShutdownRx,
    counters: Arc<ExecutorCounters>,
}

impl SegmentExecutor {
    pub fn new(
        client: Arc<FhirClient>,
        sink: Arc<ParquetSink>,
        worker_count: usize,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        SegmentExecutor {
            client,
            sink,
            worker_count,
            shutdown_rx,
            counters: Arc::new(ExecutorCounters::default()),
        }
    }

    /// Counters observed by the workers so far.
    pub fn counters(&self) -> Arc<ExecutorCounters> {
        self.counters.clone()
    }

    /// Writes one already-fetched bundle through the sink and mirror path.
    ///
    /// Used for resource types whose whole content fit in the probe page, so
    /// the server never produced a paging cursor to plan segments against.
    pub async fn ingest_bundle(&self, bundle: &crate::fhir::Bundle) -> EtlResult<()> {
        write_bundle(&self.client, &self.sink, &self.counters, bundle).await
    }

    /// Processes every task, then drains the pool.
    ///
    /// A shutdown signal stops intake; in-flight segments get a bounded
    /// deadline to finish before they are aborted. Fatal worker errors are
    /// aggregated; permanent per-segment failures are only counted.
    pub async fn run(&self, tasks: Vec<FetchTask>) -> EtlResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut join_set: JoinSet<EtlResult<()>> = JoinSet::new();
        let mut shutdown_seen = false;

        info!(
            tasks = tasks.len(),
            workers = self.worker_count,
            "starting segment executor"
        );

        for task in tasks {
            if is_shutdown_requested(&self.shutdown_rx) {
                warn!("shutdown requested, not accepting further segments");
                shutdown_seen = true;
                break;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| {
                    etl_error!(ErrorKind::WorkerPanic, "worker semaphore closed").with_source(e)
                })?;

            let client = self.client.clone();
            let sink = self.sink.clone();
            let counters = self.counters.clone();
            join_set.spawn(async move {
                metrics::gauge!(ETL_FETCH_WORKERS_ACTIVE).increment(1.0);
                let result = process_task(&client, &sink, &counters, task).await;
                metrics::gauge!(ETL_FETCH_WORKERS_ACTIVE).decrement(1.0);
                drop(permit);
                result
            });
        }

        let errors = drain(&mut join_set, shutdown_seen).await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EtlError::from_many(errors))
        }
    }
}

async fn drain(join_set: &mut JoinSet<EtlResult<()>>, shutdown_seen: bool) -> Vec<EtlError> {
    let mut errors = Vec::new();
    let deadline = Instant::now() + SHUTDOWN_DRAIN_DEADLINE;

    loop {
        let joined = if shutdown_seen {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, join_set.join_next()).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("shutdown drain deadline exceeded, aborting in-flight segments");
                    join_set.abort_all();
                    errors.push(etl_error!(
                        ErrorKind::ShutdownTimeout,
                        "in-flight segments did not drain before the shutdown deadline"
                    ));
                    break;
                }
            }
        } else {
            join_set.join_next().await
        };

        match joined {
            None => break,
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(error))) => {
                error!(error = %error, "segment worker failed");
                errors.push(error);
            }
            Some(Err(join_error)) => {
                if join_error.is_cancelled() {
                    continue;
                }
                errors.push(
                    etl_error!(ErrorKind::WorkerPanic, "segment worker panicked")
                        .with_source(join_error),
                );
            }
        }
    }

    errors
}

async fn process_task(
    client: &FhirClient,
    sink: &ParquetSink,
    counters: &ExecutorCounters,
    task: FetchTask,
) -> EtlResult<()> {
    let started = Instant::now();
    let fetched = match &task {
        FetchTask::Page(segment) => {
            client
                .search_by_page(&segment.page_token, segment.count, segment.offset)
                .await
        }
        FetchTask::Ids(batch) => {
            client
                .batch_get_by_ids(&batch.resource_type, &batch.joined_ids)
                .await
        }
    };
    metrics::histogram!(ETL_FETCH_DURATION_MILLISECONDS)
        .record(started.elapsed().as_millis() as f64);

    // The client has already exhausted transient retries by the time an
    // error surfaces here: permanent failures cost one segment, anything
    // else fails the run.
    let bundle = match fetched {
        Ok(bundle) => bundle,
        Err(error) if error.kind() == ErrorKind::PermanentRemoteError => {
            warn!(error = %error, task = ?task, "segment failed permanently, skipping");
            counters.segments_failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(ETL_SEGMENTS_FAILED_TOTAL).increment(1);
            return Ok(());
        }
        Err(error) => return Err(error),
    };

    match write_bundle(client, sink, counters, &bundle).await {
        Err(error) if error.kind() == ErrorKind::ConversionError => {
            warn!(error = %error, task = ?task, "segment carried malformed resources, skipping");
            counters.segments_failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(ETL_SEGMENTS_FAILED_TOTAL).increment(1);
            Ok(())
        }
        other => other,
    }
}

async fn write_bundle(
    client: &FhirClient,
    sink: &ParquetSink,
    counters: &ExecutorCounters,
    bundle: &crate::fhir::Bundle,
) -> EtlResult<()> {
    let resources = bundle.resources()?;

    let mut first_sink_error = None;
    for resource in &resources {
        match sink.write(resource) {
            Ok(()) => {
                counters.record_written(&resource.resource_type);
                metrics::counter!(
                    ETL_RESOURCES_WRITTEN_TOTAL,
                    RESOURCE_TYPE_LABEL => resource.resource_type.clone()
                )
                .increment(1);
            }
            Err(error) if error.kind() == ErrorKind::SinkIoError => {
                // Fatal for the type; other types in this bundle still land.
                if first_sink_error.is_none() {
                    first_sink_error = Some(error);
                }
            }
            Err(error) => return Err(error),
        }
    }

    if client.has_sink() {
        let summary = client.upload_bundle(bundle).await?;
        counters
            .resources_uploaded
            .fetch_add(summary.uploaded, Ordering::Relaxed);
        counters
            .upload_failures
            .fetch_add(summary.failed, Ordering::Relaxed);
    }

    match first_sink_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
