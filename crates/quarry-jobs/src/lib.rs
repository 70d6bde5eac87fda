//! Quarry Jobs
//!
//! Asynchronous warehouse query jobs whose results are streamed, partition by
//! partition, into a durable CSV artifact.
//!
//! ## Architecture
//!
//! ```text
//! JobStore::create ──> QueryJob::run ──> submit ──> poll loop
//!                                                     │
//!                                   ResultReader ─────┤
//!                              ┌──────┼──────┐        │
//!                        Partition  Partition  ...    │
//!                              └──────┼──────┘        │
//!                                shared row queue     │
//!                                     │               │
//!                                 RowWriter ──> ResultSink ──> Done
//! ```
//!
//! Each job owns one lifetime scope with an absolute deadline. Ending it stops
//! the poller, every partition task, and the writer.
//!
//! ## Example
//!
//! ```ignore
//! let store = JobStore::new(JobConfig::from_env());
//! let (job, mut status) = store.create("report-1", "query-1", "SELECT * FROM t")?;
//! let sink = results.sink(job.id());
//! job.run(warehouse, sink).await?;
//! status.wait_for(|s| *s == JobStatus::Done).await?;
//! println!("{} rows, {} bytes", job.total_rows().unwrap_or(0), job.result_size());
//! ```

pub mod classify;
pub mod config;
pub mod error;
pub mod job;
pub mod metrics;
pub mod reader;
pub mod sink;
pub mod state;
pub mod status;
pub mod store;
pub mod writer;

pub use classify::{classify_query, PartitionPolicy};
pub use config::{FailureCleanup, JobConfig};
pub use error::{JobError, Result};
pub use job::QueryJob;
pub use reader::{PartitionReader, ResultReader};
pub use sink::{ArtifactWriter, ObjectStoreSink, ResultSink, ResultStore};
pub use state::{CoreJobState, Job, JobStats};
pub use status::{JobState, JobStatus};
pub use store::JobStore;
pub use writer::RowWriter;
