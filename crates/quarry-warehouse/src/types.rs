//! Wire-neutral types exchanged with a warehouse.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One text row as produced by a [`RowDecoder`](crate::RowDecoder).
pub type Row = Vec<String>;

/// Fully qualified reference to a warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/datasets/{}/tables/{}",
            self.project_id, self.dataset_id, self.table_id
        )
    }
}

/// Handle to a submitted warehouse job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub project_id: String,
    pub job_id: String,
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_id, self.job_id)
    }
}

/// Query submission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// SQL text.
    pub query: String,
    /// Project the job is billed to. `None` lets the client pick its default.
    pub project_id: Option<String>,
    /// Upper bound on billed bytes; the warehouse fails the job above it.
    pub max_bytes_billed: Option<i64>,
    /// Always `false`: queries are standard SQL.
    pub use_legacy_sql: bool,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            project_id: None,
            max_bytes_billed: None,
            use_legacy_sql: false,
        }
    }
}

/// A single error entry reported by the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ErrorEntry {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
            location: None,
        }
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {}", self.reason, self.message)
    }
}

/// Execution statistics of a warehouse job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total_bytes_processed: Option<u64>,
}

/// Status of a warehouse job as returned by one status fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJobStatus {
    /// The job reached the warehouse's `DONE` state (success or failure).
    pub done: bool,
    /// Summary error when the job failed.
    pub error_result: Option<ErrorEntry>,
    /// Every error the warehouse reported for the job.
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    pub statistics: Option<JobStatistics>,
    /// Table holding the query result.
    pub destination_table: Option<TableRef>,
}

impl RemoteJobStatus {
    /// True when the job finished with reported errors.
    pub fn failed(&self) -> bool {
        self.done && (self.error_result.is_some() || !self.errors.is_empty())
    }
}

/// Metadata of a materialized table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub num_rows: u64,
    pub num_bytes: Option<u64>,
}

/// Handle to one partition (read stream) of a read session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionHandle {
    pub name: String,
}

impl PartitionHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for PartitionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A read session against a result table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSession {
    pub name: String,
    pub table: TableRef,
    /// Avro record schema of the rows, as JSON.
    pub avro_schema: String,
    /// Partitions granted by the warehouse; at most the requested count.
    pub partitions: Vec<PartitionHandle>,
}

/// One binary-encoded block of rows received from a partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowBlock {
    pub row_count: u64,
    /// Encoded rows. A block announcing rows without a payload is malformed.
    pub payload: Option<Bytes>,
}

impl RowBlock {
    pub fn new(row_count: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            row_count,
            payload: Some(payload.into()),
        }
    }
}
