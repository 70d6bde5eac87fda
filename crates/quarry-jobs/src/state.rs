//! Shared job state
//!
//! [`CoreJobState`] is the part of a job every job kind shares: identity,
//! mutable stats behind a lock, the cancellable lifetime scope, and the
//! status event channel. Concrete jobs hold one and implement [`Job`] by
//! handing it out.
//!
//! ## Status Events
//!
//! Status is published on a last-value channel. Emitting never blocks, and a
//! consumer that subscribes late still observes the latest status.
//!
//! ## Terminal States
//!
//! `Done` and `Cancelled` are sticky. Once either is reached, later
//! cancellations change neither the recorded stats nor the published status.
//! The state is always settled before the lifetime scope ends, so anything
//! waiting on the scope observes final stats.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::metrics;
use crate::status::{JobState, JobStatus};

/// Snapshot of a job's mutable stats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub state: JobState,
    /// Rows reported by the warehouse for the result table. Set once.
    pub total_rows: Option<u64>,
    pub processed_bytes: Option<u64>,
    /// Size of the completed artifact; zero until `Done`.
    pub result_size: u64,
    /// Present only once the job reached `Done`.
    pub result_id: Option<String>,
    /// Present only when the job ended abnormally.
    pub error: Option<String>,
}

pub struct CoreJobState {
    id: String,
    report_id: String,
    query_id: String,
    query: String,
    created_at: DateTime<Utc>,
    deadline: Instant,
    scope: CancellationToken,
    status_tx: watch::Sender<JobStatus>,
    stats: Mutex<JobStats>,
}

impl CoreJobState {
    pub fn new(
        report_id: impl Into<String>,
        query_id: impl Into<String>,
        query: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let (status_tx, _) = watch::channel(JobStatus::Unspecified);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            report_id: report_id.into(),
            query_id: query_id.into(),
            query: query.into(),
            created_at: Utc::now(),
            deadline: Instant::now() + timeout,
            scope: CancellationToken::new(),
            status_tx,
            stats: Mutex::new(JobStats::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn report_id(&self) -> &str {
        &self.report_id
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The job's lifetime scope.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> JobStatus {
        *self.status_tx.borrow()
    }

    pub fn stats(&self) -> JobStats {
        self.stats.lock().clone()
    }

    pub fn state(&self) -> JobState {
        self.stats.lock().state
    }

    /// True once the lifetime scope ended.
    pub fn is_finished(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Wait for the lifetime scope to end.
    pub async fn finished(&self) {
        self.scope.cancelled().await
    }

    /// Run `fut` unless the lifetime scope ends first.
    pub async fn scoped<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Move to a non-terminal state. Returns false if the job already ended.
    pub fn transition(&self, next: JobState) -> bool {
        let changed = {
            let mut stats = self.stats.lock();
            if stats.state.is_terminal() || self.scope.is_cancelled() {
                false
            } else {
                stats.state = next;
                true
            }
        };
        if changed {
            self.status_tx.send_replace(next.status());
            debug!(job_id = %self.id, query_id = %self.query_id, state = %next, "Job state changed");
        }
        changed
    }

    /// Record warehouse-reported result stats. The row count is kept once set.
    pub fn record_table_stats(&self, total_rows: u64, processed_bytes: Option<u64>) {
        let mut stats = self.stats.lock();
        if stats.total_rows.is_none() {
            stats.total_rows = Some(total_rows);
        }
        if processed_bytes.is_some() {
            stats.processed_bytes = processed_bytes;
        }
    }

    /// Reach `Done` with the artifact size and end the lifetime scope.
    ///
    /// Returns false, changing nothing, if the job already ended.
    pub fn complete(&self, result_size: u64) -> bool {
        let completed = {
            let mut stats = self.stats.lock();
            if stats.state.is_terminal() || self.scope.is_cancelled() {
                false
            } else {
                stats.state = JobState::Done;
                stats.result_size = result_size;
                stats.result_id = Some(self.id.clone());
                true
            }
        };
        if completed {
            self.status_tx.send_replace(JobStatus::Done);
            metrics::JOBS_FINISHED_TOTAL.with_label_values(&["done"]).inc();
            metrics::RESULT_BYTES_TOTAL.inc_by(result_size);
        }
        self.scope.cancel();
        completed
    }

    /// Cancel the job, recording `err` unless it is itself a cancellation.
    ///
    /// A job that already ended keeps its stats and status.
    pub fn cancel_with_error(&self, err: &JobError) {
        let outcome = {
            let mut stats = self.stats.lock();
            if stats.state.is_terminal() {
                None
            } else {
                if !err.is_cancellation() {
                    stats.error = Some(err.to_string());
                }
                stats.state = JobState::Cancelled;
                Some(if stats.error.is_some() { "failed" } else { "cancelled" })
            }
        };
        if let Some(outcome) = outcome {
            self.status_tx.send_replace(JobStatus::Unspecified);
            metrics::JOBS_FINISHED_TOTAL.with_label_values(&[outcome]).inc();
            if outcome == "failed" {
                warn!(job_id = %self.id, query_id = %self.query_id, error = %err, "Job failed");
            } else {
                info!(job_id = %self.id, query_id = %self.query_id, "Job cancelled");
            }
        }
        self.scope.cancel();
    }

    pub fn cancel(&self) {
        self.cancel_with_error(&JobError::Cancelled)
    }

    /// Mark a job whose scope ended without reaching a terminal state.
    pub fn settle(&self) {
        if self.scope.is_cancelled() && !self.state().is_terminal() {
            self.cancel();
        }
    }
}

impl std::fmt::Debug for CoreJobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreJobState")
            .field("id", &self.id)
            .field("report_id", &self.report_id)
            .field("query_id", &self.query_id)
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

/// Capability set exposed to callers of a job.
pub trait Job: Send + Sync {
    fn core(&self) -> &CoreJobState;

    fn id(&self) -> &str {
        self.core().id()
    }

    fn report_id(&self) -> &str {
        self.core().report_id()
    }

    fn query_id(&self) -> &str {
        self.core().query_id()
    }

    fn result_id(&self) -> Option<String> {
        self.core().stats().result_id
    }

    fn total_rows(&self) -> Option<u64> {
        self.core().stats().total_rows
    }

    fn processed_bytes(&self) -> Option<u64> {
        self.core().stats().processed_bytes
    }

    fn result_size(&self) -> u64 {
        self.core().stats().result_size
    }

    fn error(&self) -> Option<String> {
        self.core().stats().error
    }

    fn state(&self) -> JobState {
        self.core().state()
    }

    fn status(&self) -> watch::Receiver<JobStatus> {
        self.core().subscribe()
    }

    fn cancel(&self) {
        self.core().cancel()
    }
}
