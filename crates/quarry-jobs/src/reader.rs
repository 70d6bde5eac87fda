//! Result Reader
//!
//! Fans a result table out over the partitions of one read session and
//! funnels every decoded row into a single shared row queue.
//!
//! ## How It Works
//!
//! 1. [`ResultReader`] creates a read session and the session's row decoder
//! 2. The field names are sent as the first row
//! 3. One [`PartitionReader`] per partition runs in a `JoinSet`
//! 4. Each partition is two tasks joined by a bounded block queue: a receiver
//!    pulling binary blocks off the partition stream, and a decode-forwarder
//!    turning blocks into rows
//! 5. Once every partition finished, the row and error queues close
//!
//! Rows keep their order within a partition. Rows from different partitions
//! interleave in no particular order.
//!
//! ## Errors
//!
//! Errors go to a shared error queue of capacity one through non-blocking
//! sends: the first error wins and later ones are dropped. Cancellation is
//! never reported. Every wait races the job's lifetime scope.

use std::sync::Arc;

use futures::StreamExt;
use quarry_warehouse::{PartitionHandle, Row, RowBlock, RowDecoder, TableRef, WarehouseClient};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::JobError;
use crate::metrics;

/// Push `err` onto the shared error queue unless it is a cancellation or an
/// earlier error is still queued.
pub(crate) fn report(errors: &mpsc::Sender<JobError>, err: JobError) {
    if err.is_cancellation() {
        debug!(error = %err, "Ignoring cancellation");
        return;
    }
    match errors.try_send(err) {
        Ok(()) => {}
        Err(TrySendError::Full(err)) => {
            debug!(error = %err, "Dropping error, an earlier one was already reported");
        }
        Err(TrySendError::Closed(err)) => {
            debug!(error = %err, "Dropping error, nobody is listening");
        }
    }
}

/// Send one row unless the scope ends first. Returns false when the row
/// could not be delivered.
async fn forward_row(rows: &mpsc::Sender<Row>, scope: &CancellationToken, row: Row) -> bool {
    tokio::select! {
        biased;
        _ = scope.cancelled() => false,
        sent = rows.send(row) => sent.is_ok(),
    }
}

/// Reads one job's result table through a partitioned read session.
pub struct ResultReader {
    warehouse: Arc<dyn WarehouseClient>,
    scope: CancellationToken,
    job_id: String,
    query_id: String,
    partition_queue_capacity: usize,
}

impl ResultReader {
    pub fn new(
        warehouse: Arc<dyn WarehouseClient>,
        scope: CancellationToken,
        job_id: impl Into<String>,
        query_id: impl Into<String>,
        partition_queue_capacity: usize,
    ) -> Self {
        Self {
            warehouse,
            scope,
            job_id: job_id.into(),
            query_id: query_id.into(),
            partition_queue_capacity: partition_queue_capacity.max(1),
        }
    }

    /// Read `table` into `rows`, header first.
    ///
    /// Both queues close when this returns: `rows` and `errors` are dropped
    /// here and in every partition task.
    pub async fn run(
        self,
        table: TableRef,
        max_partitions: u32,
        expected_rows: u64,
        rows: mpsc::Sender<Row>,
        errors: mpsc::Sender<JobError>,
    ) {
        let session = tokio::select! {
            biased;
            _ = self.scope.cancelled() => return,
            session = self.warehouse.create_read_session(&table, max_partitions) => session,
        };
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                report(&errors, JobError::ReadSession(e));
                return;
            }
        };

        let decoder = match self.warehouse.row_decoder(&session) {
            Ok(decoder) => decoder,
            Err(e) => {
                report(&errors, JobError::DecoderConstruction(e));
                return;
            }
        };

        info!(
            job_id = %self.job_id,
            query_id = %self.query_id,
            session = %session.name,
            requested = max_partitions,
            granted = session.partitions.len(),
            "Read session created"
        );

        if !forward_row(&rows, &self.scope, decoder.field_names().to_vec()).await {
            return;
        }

        if session.partitions.is_empty() {
            if expected_rows > 0 {
                report(
                    &errors,
                    JobError::NoPartitions {
                        table: table.to_string(),
                        rows: expected_rows,
                    },
                );
            }
            return;
        }

        let mut partitions = JoinSet::new();
        for partition in session.partitions {
            let reader = PartitionReader {
                warehouse: Arc::clone(&self.warehouse),
                decoder: Arc::clone(&decoder),
                partition,
                scope: self.scope.clone(),
                queue_capacity: self.partition_queue_capacity,
                job_id: self.job_id.clone(),
            };
            partitions.spawn(reader.run(rows.clone(), errors.clone()));
        }

        while let Some(joined) = partitions.join_next().await {
            if let Err(e) = joined {
                report(&errors, JobError::from(e));
            }
        }
        debug!(job_id = %self.job_id, "All partitions finished");
    }
}

/// Reads one partition of a read session.
pub struct PartitionReader {
    warehouse: Arc<dyn WarehouseClient>,
    decoder: Arc<dyn RowDecoder>,
    partition: PartitionHandle,
    scope: CancellationToken,
    queue_capacity: usize,
    job_id: String,
}

impl PartitionReader {
    pub async fn run(self, rows: mpsc::Sender<Row>, errors: mpsc::Sender<JobError>) {
        let (blocks_tx, blocks_rx) = mpsc::channel(self.queue_capacity);
        let receiver = tokio::spawn(receive_blocks(
            Arc::clone(&self.warehouse),
            self.partition.clone(),
            self.scope.clone(),
            blocks_tx,
            errors.clone(),
        ));

        self.forward_rows(blocks_rx, &rows, &errors).await;

        if let Err(e) = receiver.await {
            report(&errors, JobError::from(e));
        }
        metrics::PARTITIONS_READ_TOTAL.inc();
        debug!(job_id = %self.job_id, partition = %self.partition, "Partition finished");
    }

    /// Decode blocks into rows until the block queue closes or the scope ends.
    async fn forward_rows(
        &self,
        mut blocks: mpsc::Receiver<RowBlock>,
        rows: &mpsc::Sender<Row>,
        errors: &mpsc::Sender<JobError>,
    ) {
        loop {
            let block = tokio::select! {
                biased;
                _ = self.scope.cancelled() => return,
                block = blocks.recv() => match block {
                    Some(block) => block,
                    None => return,
                },
            };
            if block.row_count == 0 {
                continue;
            }

            let Some(payload) = block.payload else {
                report(
                    errors,
                    JobError::Decode {
                        partition: self.partition.to_string(),
                        message: format!("block announced {} rows without a payload", block.row_count),
                    },
                );
                return;
            };

            let decoded = match self.decoder.decode_rows(&payload, block.row_count) {
                Ok(decoded) => decoded,
                Err(e) => {
                    report(
                        errors,
                        JobError::Decode {
                            partition: self.partition.to_string(),
                            message: e.to_string(),
                        },
                    );
                    return;
                }
            };

            for row in decoded {
                if !forward_row(rows, &self.scope, row).await {
                    return;
                }
            }
        }
    }
}

/// Pull blocks off one partition stream into the block queue.
async fn receive_blocks(
    warehouse: Arc<dyn WarehouseClient>,
    partition: PartitionHandle,
    scope: CancellationToken,
    blocks: mpsc::Sender<RowBlock>,
    errors: mpsc::Sender<JobError>,
) {
    let opened = tokio::select! {
        biased;
        _ = scope.cancelled() => return,
        opened = warehouse.open_partition_stream(&partition) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            report(
                &errors,
                JobError::PartitionTransport {
                    partition: partition.to_string(),
                    source: e,
                },
            );
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            None => {
                debug!(partition = %partition, "End of partition data");
                return;
            }
            Some(Err(e)) => {
                report(
                    &errors,
                    JobError::PartitionTransport {
                        partition: partition.to_string(),
                        source: e,
                    },
                );
                return;
            }
            Some(Ok(block)) => {
                let sent = tokio::select! {
                    biased;
                    _ = scope.cancelled() => return,
                    sent = blocks.send(block) => sent,
                };
                if sent.is_err() {
                    // Decode-forwarder stopped.
                    return;
                }
            }
        }
    }
}
