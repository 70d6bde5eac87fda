//! Row writer
//!
//! Drains the shared row queue into an [`ArtifactWriter`] as CSV, one record
//! per row. Encoded bytes are handed to the artifact in chunks of roughly
//! [`FLUSH_THRESHOLD`] bytes, so the result is never buffered whole.

use bytes::Bytes;
use quarry_warehouse::Row;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, Result};
use crate::sink::ArtifactWriter;

/// Encoded bytes accumulated before a write to the artifact.
pub const FLUSH_THRESHOLD: usize = 64 * 1024;

/// CSV encoder feeding one artifact.
pub struct RowWriter {
    artifact: Box<dyn ArtifactWriter>,
    csv: csv::Writer<Vec<u8>>,
    records: u64,
    /// A chunk was lost to a failed or interrupted write.
    torn: bool,
}

impl RowWriter {
    pub fn new(artifact: Box<dyn ArtifactWriter>) -> Self {
        Self {
            artifact,
            csv: csv::Writer::from_writer(Vec::new()),
            records: 0,
            torn: false,
        }
    }

    /// Records written so far, header included.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Drain `rows` until the queue closes or `scope` ends.
    pub async fn drain(
        &mut self,
        rows: &mut mpsc::Receiver<Row>,
        scope: &CancellationToken,
    ) -> Result<()> {
        loop {
            let row = tokio::select! {
                biased;
                _ = scope.cancelled() => return Err(JobError::Cancelled),
                row = rows.recv() => row,
            };
            let Some(row) = row else {
                break;
            };

            self.csv.write_record(&row)?;
            self.records += 1;
            if self.csv.get_ref().len() >= FLUSH_THRESHOLD {
                self.flush_chunk(scope).await?;
            }
        }

        self.flush_chunk(scope).await
    }

    /// Write out every row still queued, then everything encoded so far.
    ///
    /// Used for a job that will not complete but keeps its partial result:
    /// the scope has ended, so nothing here races it.
    pub async fn salvage(&mut self, rows: &mut mpsc::Receiver<Row>) -> Result<()> {
        if self.torn {
            return Err(JobError::IncompleteArtifact);
        }
        while let Ok(row) = rows.try_recv() {
            self.csv.write_record(&row)?;
            self.records += 1;
        }
        self.flush_pending().await
    }

    /// Hand everything encoded so far to the artifact.
    pub async fn flush_pending(&mut self) -> Result<()> {
        let Some(chunk) = self.take_chunk()? else {
            return Ok(());
        };
        let res = self.artifact.write(chunk).await;
        self.torn |= res.is_err();
        res
    }

    async fn flush_chunk(&mut self, scope: &CancellationToken) -> Result<()> {
        let Some(chunk) = self.take_chunk()? else {
            return Ok(());
        };
        let res = tokio::select! {
            biased;
            _ = scope.cancelled() => Err(JobError::Cancelled),
            res = self.artifact.write(chunk) => res,
        };
        self.torn |= res.is_err();
        res
    }

    fn take_chunk(&mut self) -> Result<Option<Bytes>> {
        let encoder = std::mem::replace(&mut self.csv, csv::Writer::from_writer(Vec::new()));
        let chunk = encoder.into_inner().map_err(|e| JobError::Io(e.into_error()))?;
        Ok((!chunk.is_empty()).then(|| Bytes::from(chunk)))
    }

    /// The artifact writer, for finishing or aborting.
    pub fn into_artifact(self) -> Box<dyn ArtifactWriter> {
        self.artifact
    }
}
