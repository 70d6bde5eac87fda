//! Result sinks
//!
//! A [`ResultSink`] is the write-once destination of one job's materialized
//! result. Bytes are appended through an [`ArtifactWriter`] as rows arrive,
//! and the artifact's size is queried once the writer finished.
//!
//! [`ObjectStoreSink`] stores the artifact in any `object_store` backend
//! through a buffered multipart upload, so a result is never held in memory
//! as a whole. [`ResultStore`] hands out one sink per result id.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::buffered::BufWriter;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{JobError, Result};

/// Append-only byte writer for one artifact.
#[async_trait]
pub trait ArtifactWriter: Send {
    async fn write(&mut self, data: Bytes) -> Result<()>;

    /// Flush and persist everything written so far.
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Drop everything written so far without persisting it.
    async fn abort(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn writer(&self) -> Result<Box<dyn ArtifactWriter>>;

    /// Size in bytes of the persisted artifact.
    async fn size(&self) -> Result<u64>;

    async fn created_at(&self) -> Result<DateTime<Utc>>;

    /// Read the persisted artifact back.
    async fn reader(&self) -> Result<BoxStream<'static, Result<Bytes>>>;

    /// Delete the persisted artifact. Succeeds if there is none.
    async fn discard(&self) -> Result<()>;

    /// Human-readable artifact location.
    fn location(&self) -> String;
}

/// Sink storing one artifact at a fixed path of an object store.
#[derive(Debug, Clone)]
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
}

impl ObjectStoreSink {
    pub fn new(store: Arc<dyn ObjectStore>, path: ObjectPath) -> Self {
        Self { store, path }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }
}

struct ObjectStoreWriter {
    inner: BufWriter,
}

#[async_trait]
impl ArtifactWriter for ObjectStoreWriter {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.inner.write_all(&data).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.inner.abort().await?;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for ObjectStoreSink {
    async fn writer(&self) -> Result<Box<dyn ArtifactWriter>> {
        Ok(Box::new(ObjectStoreWriter {
            inner: BufWriter::new(Arc::clone(&self.store), self.path.clone()),
        }))
    }

    async fn size(&self) -> Result<u64> {
        let meta = self.store.head(&self.path).await?;
        Ok(meta.size as u64)
    }

    async fn created_at(&self) -> Result<DateTime<Utc>> {
        let meta = self.store.head(&self.path).await?;
        Ok(meta.last_modified)
    }

    async fn reader(&self) -> Result<BoxStream<'static, Result<Bytes>>> {
        let result = self.store.get(&self.path).await?;
        Ok(result.into_stream().map_err(JobError::from).boxed())
    }

    async fn discard(&self) -> Result<()> {
        match self.store.delete(&self.path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                debug!(path = %self.path, "Nothing to discard");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn location(&self) -> String {
        self.path.to_string()
    }
}

/// Hands out one [`ObjectStoreSink`] per result id, under a common prefix.
#[derive(Debug, Clone)]
pub struct ResultStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ResultStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "results")
    }

    /// Store artifacts under an existing local directory.
    pub fn local(dir: impl AsRef<std::path::Path>) -> Result<Self> {
        let store = LocalFileSystem::new_with_prefix(dir.as_ref())?;
        Ok(Self::new(Arc::new(store), ""))
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn artifact_path(&self, result_id: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(format!("{}.csv", result_id))
        } else {
            ObjectPath::from(format!("{}/{}.csv", self.prefix, result_id))
        }
    }

    pub fn sink(&self, result_id: &str) -> Arc<ObjectStoreSink> {
        Arc::new(ObjectStoreSink::new(
            Arc::clone(&self.store),
            self.artifact_path(result_id),
        ))
    }
}
