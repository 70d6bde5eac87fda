//! Query job
//!
//! One [`QueryJob`] runs one SQL query from submission to a durable result
//! artifact.
//!
//! ## Lifecycle
//!
//! 1. [`QueryJob::run`] submits the query and returns; a rejected submission
//!    cancels the job and is returned to the caller
//! 2. A background task polls the warehouse job until it is done
//! 3. A failed warehouse job cancels with the reported `reason : message` list
//! 4. The result table's metadata is recorded and the job moves to
//!    `ReadingResults`
//! 5. A [`ResultReader`] fans the table out into the shared row queue while a
//!    writer task drains it into the sink as CSV
//! 6. Once the reader finished cleanly and every row was written, the
//!    artifact is finalized, its size recorded, and the job is `Done`
//!
//! Any failure cancels the job through its single cancellation primitive and
//! leaves the artifact according to [`FailureCleanup`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quarry_warehouse::{
    ErrorEntry, JobHandle, QueryRequest, RemoteJobStatus, Row, TableRef, WarehouseClient,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{classify_query, PartitionPolicy};
use crate::config::{FailureCleanup, JobConfig};
use crate::error::{JobError, Result};
use crate::metrics;
use crate::reader::ResultReader;
use crate::sink::{ArtifactWriter, ResultSink};
use crate::state::{CoreJobState, Job};
use crate::status::JobState;
use crate::writer::RowWriter;

/// Reported reason of a query stopped by the bytes billed limit.
const BYTES_BILLED_LIMIT_EXCEEDED: &str = "bytesBilledLimitExceeded";

/// Upper bound on finishing, aborting, or deleting an abandoned artifact.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct QueryJob {
    core: CoreJobState,
    config: JobConfig,
    policy: PartitionPolicy,
    started: AtomicBool,
    settled: CancellationToken,
}

impl Job for QueryJob {
    fn core(&self) -> &CoreJobState {
        &self.core
    }
}

impl QueryJob {
    /// Create a job and arm its deadline. Must be called within a Tokio runtime.
    pub fn new(
        report_id: impl Into<String>,
        query_id: impl Into<String>,
        query: impl Into<String>,
        config: JobConfig,
    ) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| JobError::Task(format!("no runtime to run the job on: {}", e)))?;

        let query = query.into();
        let policy = classify_query(&query);
        let job = Arc::new(Self {
            core: CoreJobState::new(report_id, query_id, query, config.timeout()),
            config,
            policy,
            started: AtomicBool::new(false),
            settled: CancellationToken::new(),
        });
        metrics::JOBS_CREATED_TOTAL.inc();

        let scope = job.core.scope().clone();
        let deadline = job.core.deadline();
        let weak = Arc::downgrade(&job);
        runtime.spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(job) = weak.upgrade() {
                        warn!(job_id = %job.id(), query_id = %job.query_id(), "Job deadline exceeded");
                        job.core.cancel();
                    }
                }
            }
        });

        Ok(job)
    }

    pub fn partition_policy(&self) -> PartitionPolicy {
        self.policy
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Wait until the job's background work, artifact cleanup included, is over.
    ///
    /// Never resolves for a job that was not run.
    pub async fn settled(&self) {
        self.settled.cancelled().await
    }

    /// Submit the query and continue in the background.
    ///
    /// Returns once the warehouse accepted the job. A job runs at most once.
    pub async fn run(
        self: &Arc<Self>,
        warehouse: Arc<dyn WarehouseClient>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(JobError::AlreadyStarted(self.core.id().to_string()));
        }

        let request = QueryRequest {
            query: self.core.query().to_string(),
            project_id: self.config.project_id.clone(),
            max_bytes_billed: self.config.max_bytes_billed,
            use_legacy_sql: false,
        };
        let submitted = match self.core.scoped(warehouse.submit_query(&request)).await {
            Some(submitted) => submitted,
            None => {
                self.core.settle();
                self.settled.cancel();
                return Err(JobError::Cancelled);
            }
        };
        let handle = match submitted {
            Ok(handle) => handle,
            Err(e) => {
                self.log_reported_errors(e.reported_errors());
                let err = JobError::Submission(e);
                self.core.cancel_with_error(&err);
                self.settled.cancel();
                return Err(err);
            }
        };

        if !self.core.transition(JobState::Running) {
            self.core.settle();
            self.settled.cancel();
            return Err(JobError::Cancelled);
        }
        info!(
            job_id = %self.core.id(),
            query_id = %self.core.query_id(),
            warehouse_job = %handle,
            policy = ?self.policy,
            "Query submitted"
        );

        let job = Arc::clone(self);
        tokio::spawn(async move { job.wait(warehouse, sink, handle).await });
        Ok(())
    }

    async fn wait(
        self: Arc<Self>,
        warehouse: Arc<dyn WarehouseClient>,
        sink: Arc<dyn ResultSink>,
        handle: JobHandle,
    ) {
        if let Err(err) = self.execute(warehouse, sink, &handle).await {
            self.core.cancel_with_error(&err);
        }
        self.core.settle();
        self.settled.cancel();
    }

    async fn execute(
        self: &Arc<Self>,
        warehouse: Arc<dyn WarehouseClient>,
        sink: Arc<dyn ResultSink>,
        handle: &JobHandle,
    ) -> Result<()> {
        let status = self.poll(warehouse.as_ref(), handle).await?;
        if status.failed() {
            return Err(self.reported_failure(&status));
        }

        let table = status
            .destination_table
            .clone()
            .ok_or_else(|| JobError::MissingDestination(handle.to_string()))?;
        let metadata = self
            .core
            .scoped(warehouse.get_table_metadata(&table))
            .await
            .ok_or(JobError::Cancelled)?
            .map_err(JobError::TableMetadata)?;

        let processed = status
            .statistics
            .as_ref()
            .and_then(|s| s.total_bytes_processed)
            .or(metadata.num_bytes);
        self.core.record_table_stats(metadata.num_rows, processed);

        if !self.core.transition(JobState::ReadingResults) {
            return Err(JobError::Cancelled);
        }
        info!(
            job_id = %self.core.id(),
            query_id = %self.core.query_id(),
            table = %table,
            rows = metadata.num_rows,
            "Reading results"
        );

        self.materialize(warehouse, sink, table, metadata.num_rows).await
    }

    /// Fetch the warehouse job status every poll interval until it is done.
    async fn poll(
        &self,
        warehouse: &dyn WarehouseClient,
        handle: &JobHandle,
    ) -> Result<RemoteJobStatus> {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.core
                .scoped(interval.tick())
                .await
                .ok_or(JobError::Cancelled)?;

            let status = self
                .core
                .scoped(warehouse.get_job_status(handle))
                .await
                .ok_or(JobError::Cancelled)?
                .map_err(JobError::Polling)?;
            if status.done {
                return Ok(status);
            }
            debug!(job_id = %self.core.id(), warehouse_job = %handle, "Warehouse job still running");
        }
    }

    fn reported_failure(&self, status: &RemoteJobStatus) -> JobError {
        let entries: Vec<&ErrorEntry> = if status.errors.is_empty() {
            status.error_result.iter().collect()
        } else {
            status.errors.iter().collect()
        };
        self.log_reported_errors(entries.iter().copied());

        let joined: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
        JobError::WarehouseReported(joined.join(","))
    }

    fn log_reported_errors<'a>(&self, entries: impl IntoIterator<Item = &'a ErrorEntry>) {
        for entry in entries {
            if entry.reason == BYTES_BILLED_LIMIT_EXCEEDED {
                warn!(
                    job_id = %self.core.id(),
                    query_id = %self.core.query_id(),
                    max_bytes_billed = ?self.config.max_bytes_billed,
                    message = %entry.message,
                    "Query exceeded the bytes billed limit"
                );
            }
        }
    }

    async fn materialize(
        self: &Arc<Self>,
        warehouse: Arc<dyn WarehouseClient>,
        sink: Arc<dyn ResultSink>,
        table: TableRef,
        total_rows: u64,
    ) -> Result<()> {
        let artifact = sink.writer().await?;
        let (rows_tx, mut rows_rx) = mpsc::channel(self.config.row_queue_capacity_for(total_rows));
        let (errors_tx, mut errors_rx) = mpsc::channel(1);

        let reader = ResultReader::new(
            warehouse,
            self.core.scope().clone(),
            self.core.id(),
            self.core.query_id(),
            self.config.partition_queue_capacity,
        );
        let partitions = self.policy.partition_count(self.config.max_partitions);
        let reader_task = tokio::spawn(reader.run(table, partitions, total_rows, rows_tx, errors_tx));

        let job = Arc::clone(self);
        let writer_task = tokio::spawn(async move {
            let mut writer = RowWriter::new(artifact);
            let drained = writer.drain(&mut rows_rx, job.core.scope()).await;
            if let Err(e) = &drained {
                if !e.is_cancellation() {
                    job.core.cancel_with_error(e);
                }
            }
            (writer, rows_rx, drained)
        });

        if let Some(err) = errors_rx.recv().await {
            self.core.cancel_with_error(&err);
        }
        if let Err(e) = reader_task.await {
            self.core.cancel_with_error(&JobError::from(e));
        }
        let (writer, rows_rx, drained) = writer_task.await?;

        if drained.is_err() || self.core.is_finished() {
            self.abandon(sink.as_ref(), writer, rows_rx).await;
            return Ok(());
        }

        let rows_written = writer.records().saturating_sub(1);
        metrics::ROWS_WRITTEN_TOTAL.inc_by(rows_written);
        if rows_written != total_rows {
            self.core.cancel_with_error(&JobError::RowCountMismatch {
                expected: total_rows,
                written: rows_written,
            });
            self.abandon(sink.as_ref(), writer, rows_rx).await;
            return Ok(());
        }

        let closed = self.close(sink.as_ref(), writer.into_artifact(), rows_written).await;
        if closed.is_err() && self.config.failure_cleanup == FailureCleanup::Discard {
            if let Err(e) = sink.discard().await {
                warn!(job_id = %self.core.id(), error = %e, "Failed to discard result");
            }
        }
        closed
    }

    /// Finalize the artifact and reach `Done`.
    async fn close(
        &self,
        sink: &dyn ResultSink,
        artifact: Box<dyn ArtifactWriter>,
        rows: u64,
    ) -> Result<()> {
        self.core
            .scoped(artifact.finish())
            .await
            .ok_or(JobError::Cancelled)??;
        let size = self
            .core
            .scoped(sink.size())
            .await
            .ok_or(JobError::Cancelled)??;

        if self.core.complete(size) {
            info!(
                job_id = %self.core.id(),
                query_id = %self.core.query_id(),
                rows,
                bytes = size,
                location = %sink.location(),
                "Job done"
            );
        }
        Ok(())
    }

    /// Leave the artifact of a job that will not complete.
    ///
    /// A failed job under `Keep` persists every row that reached the writer,
    /// queued ones included.
    async fn abandon(
        &self,
        sink: &dyn ResultSink,
        mut writer: RowWriter,
        mut rows: mpsc::Receiver<Row>,
    ) {
        let failed = self.core.stats().error.is_some();
        let cleanup = async {
            match (self.config.failure_cleanup, failed) {
                (FailureCleanup::Keep, true) => {
                    let salvaged = writer.salvage(&mut rows).await;
                    let kept = writer.records();
                    let artifact = writer.into_artifact();
                    if let Err(e) = salvaged {
                        artifact.abort().await?;
                        return Err(e);
                    }
                    artifact.finish().await?;
                    info!(
                        job_id = %self.core.id(),
                        location = %sink.location(),
                        records = kept,
                        "Partial result left in place"
                    );
                }
                (FailureCleanup::Keep, false) => writer.into_artifact().abort().await?,
                (FailureCleanup::Discard, _) => {
                    writer.into_artifact().abort().await?;
                    sink.discard().await?;
                }
            }
            Ok::<(), JobError>(())
        };

        match tokio::time::timeout(CLEANUP_TIMEOUT, cleanup).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job_id = %self.core.id(), error = %e, "Result cleanup failed"),
            Err(_) => warn!(job_id = %self.core.id(), "Result cleanup timed out"),
        }
    }
}
