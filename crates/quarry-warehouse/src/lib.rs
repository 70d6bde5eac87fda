//! Quarry Warehouse
//!
//! The capability a query job needs from a remote warehouse: submit a query,
//! poll its status, read table metadata, open a partitioned read session,
//! and stream each partition's row blocks.
//!
//! ## Modules
//!
//! - [`client`]: the [`WarehouseClient`] trait
//! - [`decoder`]: turning binary row blocks into text rows
//! - [`memory`]: an in-process warehouse for local runs and tests
//! - [`types`]: wire-neutral request and response types

pub mod client;
pub mod decoder;
pub mod error;
pub mod memory;
pub mod types;

pub use client::{PartitionStream, WarehouseClient};
pub use decoder::{AvroRowDecoder, RowDecoder};
pub use error::{Result, WarehouseError};
pub use memory::{InMemoryWarehouse, MemoryTable, PartitionFault, SessionRequest};
pub use types::{
    ErrorEntry, JobHandle, JobStatistics, PartitionHandle, QueryRequest, ReadSession,
    RemoteJobStatus, Row, RowBlock, TableMetadata, TableRef,
};
