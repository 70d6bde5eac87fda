//! Job Error Types
//!
//! Every failure path of a query job converges on [`JobError`]. The variants
//! follow the phases of a job:
//!
//! - submission (`InvalidQuery`, `Submission`)
//! - polling (`Polling`, `WarehouseReported`, `MissingDestination`, `TableMetadata`)
//! - materialization (`ReadSession`, `DecoderConstruction`, `NoPartitions`,
//!   `PartitionTransport`, `Decode`)
//! - output (`Encode`, `ObjectStore`, `Io`, `RowCountMismatch`,
//!   `IncompleteArtifact`)
//!
//! `Cancelled` is the benign end of a job's lifetime scope and is never
//! recorded as a job error message.

use quarry_warehouse::WarehouseError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Job {0} was already started")]
    AlreadyStarted(String),

    #[error("Query submission failed: {0}")]
    Submission(#[source] WarehouseError),

    #[error("Job status poll failed: {0}")]
    Polling(#[source] WarehouseError),

    /// Joined `reason : message` entries reported by the warehouse.
    #[error("{0}")]
    WarehouseReported(String),

    #[error("Warehouse job {0} finished without a destination table")]
    MissingDestination(String),

    #[error("Table metadata fetch failed: {0}")]
    TableMetadata(#[source] WarehouseError),

    #[error("Read session creation failed: {0}")]
    ReadSession(#[source] WarehouseError),

    #[error("Row decoder construction failed: {0}")]
    DecoderConstruction(#[source] WarehouseError),

    #[error("no streams in read session for {table} ({rows} rows expected)")]
    NoPartitions { table: String, rows: u64 },

    #[error("Partition {partition} read failed: {source}")]
    PartitionTransport {
        partition: String,
        #[source]
        source: WarehouseError,
    },

    #[error("Partition {partition} decode failed: {message}")]
    Decode { partition: String, message: String },

    #[error("Row encoding failed: {0}")]
    Encode(#[from] csv::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Wrote {written} rows but the warehouse reported {expected}")]
    RowCountMismatch { expected: u64, written: u64 },

    #[error("Artifact is missing a chunk after a failed write")]
    IncompleteArtifact,

    #[error("Task failed: {0}")]
    Task(String),

    #[error("context canceled")]
    Cancelled,
}

impl JobError {
    /// True when the error only reports that a lifetime scope ended.
    pub fn is_cancellation(&self) -> bool {
        match self {
            JobError::Cancelled => true,
            JobError::Submission(e)
            | JobError::Polling(e)
            | JobError::TableMetadata(e)
            | JobError::ReadSession(e)
            | JobError::DecoderConstruction(e)
            | JobError::PartitionTransport { source: e, .. } => e.is_cancellation(),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for JobError {
    fn from(e: tokio::task::JoinError) -> Self {
        JobError::Task(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---------------------------------------------------------------
    // Cancellation classification
    // ---------------------------------------------------------------

    #[test]
    fn test_cancelled_is_cancellation() {
        assert!(JobError::Cancelled.is_cancellation());
    }

    #[test]
    fn test_wrapped_cancellation_is_cancellation() {
        let err = JobError::Polling(WarehouseError::DeadlineExceeded);
        assert!(err.is_cancellation());

        let err = JobError::PartitionTransport {
            partition: "s/0".to_string(),
            source: WarehouseError::Transport("rpc error: context canceled".to_string()),
        };
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_real_failures_are_not_cancellation() {
        let variants = vec![
            JobError::WarehouseReported("quota : exceeded".to_string()),
            JobError::RowCountMismatch {
                expected: 6,
                written: 7,
            },
            JobError::Decode {
                partition: "s/0".to_string(),
                message: "bad block".to_string(),
            },
            JobError::PartitionTransport {
                partition: "s/0".to_string(),
                source: WarehouseError::Transport("connection reset".to_string()),
            },
        ];
        for err in &variants {
            assert!(!err.is_cancellation(), "{:?} classified as cancellation", err);
        }
    }

    // ---------------------------------------------------------------
    // Display
    // ---------------------------------------------------------------

    #[test]
    fn test_warehouse_reported_display_is_verbatim() {
        let err = JobError::WarehouseReported("quota : exceeded".to_string());
        assert_eq!(err.to_string(), "quota : exceeded");
    }

    #[test]
    fn test_partition_errors_name_the_partition() {
        let err = JobError::Decode {
            partition: "sessions/1/streams/0".to_string(),
            message: "trailing bytes".to_string(),
        };
        assert!(err.to_string().contains("sessions/1/streams/0"));
        assert!(err.to_string().contains("trailing bytes"));
    }

    #[test]
    fn test_io_error_has_source() {
        let err: JobError = std::io::Error::new(std::io::ErrorKind::Other, "inner").into();
        assert!(std::error::Error::source(&err).is_some());
    }
}
