//! The warehouse client capability.
//!
//! A client is bound to one caller's credentials and is supplied per job.
//! Implementations own the wire format of both the submission API and the
//! streaming read API; callers only see the types in [`crate::types`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::decoder::{AvroRowDecoder, RowDecoder};
use crate::error::Result;
use crate::types::{
    JobHandle, PartitionHandle, QueryRequest, ReadSession, RemoteJobStatus, RowBlock,
    TableMetadata, TableRef,
};

/// Ordered stream of row blocks from one partition. Ends at end-of-data.
pub type PartitionStream = BoxStream<'static, Result<RowBlock>>;

/// Remote query engine: submission, polling, and streaming reads.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Submit a query. Returns as soon as the warehouse accepted the job.
    async fn submit_query(&self, request: &QueryRequest) -> Result<JobHandle>;

    /// Fetch the current status of a submitted job.
    async fn get_job_status(&self, job: &JobHandle) -> Result<RemoteJobStatus>;

    /// Fetch row count and size of a table.
    async fn get_table_metadata(&self, table: &TableRef) -> Result<TableMetadata>;

    /// Create a read session exposing at most `max_partitions` partitions.
    async fn create_read_session(&self, table: &TableRef, max_partitions: u32)
        -> Result<ReadSession>;

    /// Open the block stream of one partition.
    async fn open_partition_stream(&self, partition: &PartitionHandle) -> Result<PartitionStream>;

    /// Build the decoder for a session's rows.
    fn row_decoder(&self, session: &ReadSession) -> Result<Arc<dyn RowDecoder>> {
        Ok(Arc::new(AvroRowDecoder::from_session(session)?))
    }
}
