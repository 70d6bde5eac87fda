//! Job store
//!
//! Registry of the live query jobs of one process. The service constructs a
//! single store at startup and shares it by cloning; clones see the same jobs.
//!
//! A job stays registered until its lifetime scope ends, whether it finished,
//! failed, or was cancelled. Membership only changes under the store's lock,
//! and the live list has no ordering guarantee.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

use crate::config::JobConfig;
use crate::error::{JobError, Result};
use crate::job::QueryJob;
use crate::metrics;
use crate::state::Job;
use crate::status::JobStatus;

#[derive(Debug, Default)]
struct StoreInner {
    jobs: Mutex<Vec<Arc<QueryJob>>>,
    changed: Notify,
    config: JobConfig,
}

#[derive(Debug, Clone, Default)]
pub struct JobStore {
    inner: Arc<StoreInner>,
}

impl JobStore {
    pub fn new(config: JobConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                jobs: Mutex::new(Vec::new()),
                changed: Notify::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.inner.config
    }

    /// Register a new job for `query`.
    ///
    /// The job is deregistered automatically once its lifetime scope ends.
    /// Must be called within a Tokio runtime.
    pub fn create(
        &self,
        report_id: impl Into<String>,
        query_id: impl Into<String>,
        query: impl Into<String>,
    ) -> Result<(Arc<QueryJob>, watch::Receiver<JobStatus>)> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(JobError::InvalidQuery("query text is empty".to_string()));
        }

        let job = QueryJob::new(report_id, query_id, query, self.inner.config.clone())?;
        let status = job.status();
        self.inner.jobs.lock().push(Arc::clone(&job));
        metrics::JOBS_LIVE.inc();
        info!(job_id = %job.id(), report_id = %job.report_id(), query_id = %job.query_id(), "Job created");

        let store = self.clone();
        let watched = Arc::clone(&job);
        tokio::spawn(async move { store.remove_job_when_done(watched).await });

        Ok((job, status))
    }

    /// Wait until `job`'s lifetime scope ends, then deregister it.
    pub async fn remove_job_when_done(&self, job: Arc<QueryJob>) {
        job.core().finished().await;
        job.core().settle();

        let removed = {
            let mut jobs = self.inner.jobs.lock();
            match jobs.iter().position(|j| Arc::ptr_eq(j, &job)) {
                Some(index) => {
                    jobs.swap_remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            metrics::JOBS_LIVE.dec();
            debug!(job_id = %job.id(), state = %job.state(), "Job deregistered");
        }
        self.inner.changed.notify_waiters();
    }

    /// Cancel every live job for `query_id`. Returns whether one was found.
    pub fn cancel(&self, query_id: &str) -> bool {
        let jobs = self.inner.jobs.lock();
        let mut found = false;
        for job in jobs.iter().filter(|j| j.query_id() == query_id) {
            job.cancel();
            found = true;
        }
        found
    }

    /// Cancel every live job.
    ///
    /// Status emission never blocks, so this returns without waiting for the
    /// jobs to wind down; see [`JobStore::drain`].
    pub fn cancel_all(&self) {
        let jobs = self.inner.jobs.lock();
        if !jobs.is_empty() {
            info!(jobs = jobs.len(), "Cancelling all jobs");
        }
        for job in jobs.iter() {
            job.cancel();
        }
    }

    /// Most recently created live job for `query_id`.
    pub fn get(&self, query_id: &str) -> Option<Arc<QueryJob>> {
        self.inner
            .jobs
            .lock()
            .iter()
            .rev()
            .find(|j| j.query_id() == query_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.jobs.lock().is_empty()
    }

    /// Wait until every job deregistered. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let changed = self.inner.changed.notified();
                if self.is_empty() {
                    return;
                }
                changed.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::JobState;

    #[tokio::test]
    async fn test_create_registers_job() {
        let store = JobStore::new(JobConfig::default());
        let (job, status) = store.create("report", "query-1", "SELECT 1").unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(*status.borrow(), JobStatus::Unspecified);
        assert_eq!(job.state(), JobState::Created);
        assert!(Arc::ptr_eq(&store.get("query-1").unwrap(), &job));
        store.cancel_all();
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let store = JobStore::default();
        let err = store.create("report", "query-1", "   ").unwrap_err();
        assert!(matches!(err, JobError::InvalidQuery(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_by_query_id() {
        let store = JobStore::default();
        let (job, status) = store.create("report", "query-1", "SELECT 1").unwrap();
        let (other, _) = store.create("report", "query-2", "SELECT 2").unwrap();

        assert!(!store.cancel("missing"));
        assert!(store.cancel("query-1"));
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(*status.borrow(), JobStatus::Unspecified);
        assert!(job.error().is_none());
        assert_eq!(other.state(), JobState::Created);

        store.cancel_all();
    }

    #[tokio::test]
    async fn test_cancel_stops_every_run_of_a_query() {
        let store = JobStore::default();
        let (first, _) = store.create("report", "query-1", "SELECT 1").unwrap();
        let (rerun, _) = store.create("report", "query-1", "SELECT 1").unwrap();

        assert!(store.cancel("query-1"));
        assert_eq!(first.state(), JobState::Cancelled);
        assert_eq!(rerun.state(), JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_finished_jobs_are_deregistered() {
        let store = JobStore::default();
        let (first, _) = store.create("report", "query-1", "SELECT 1").unwrap();
        let (_second, _) = store.create("report", "query-2", "SELECT 2").unwrap();

        first.cancel();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.len() != 1 && std::time::Instant::now() < deadline {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.len(), 1);
        assert!(store.get("query-1").is_none());
        assert!(store.get("query-2").is_some());

        store.cancel_all();
    }

    #[tokio::test]
    async fn test_cancel_all_then_drain() {
        let store = JobStore::default();
        let mut jobs = Vec::new();
        for i in 0..3 {
            let (job, _) = store.create("report", format!("query-{}", i), "SELECT 1").unwrap();
            jobs.push(job);
        }

        store.cancel_all();
        assert!(store.drain(Duration::from_secs(5)).await);
        assert!(store.is_empty());
        for job in &jobs {
            assert_eq!(job.state(), JobState::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_drain_times_out_with_live_jobs() {
        let store = JobStore::default();
        store.create("report", "query-1", "SELECT 1").unwrap();
        assert!(!store.drain(Duration::from_millis(50)).await);
        store.cancel_all();
    }
}
