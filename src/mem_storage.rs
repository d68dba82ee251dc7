//! In-memory storage driver
//!
//! Blobs live in a map for the lifetime of the process. Meant for tests and
//! ephemeral deployments.

use crate::storage::{BlobWriter, StorageDriver, StoredBlob};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

type BlobMap = Arc<RwLock<HashMap<String, Bytes>>>;

/// Key to blob map shared by all writers of one driver
#[derive(Clone, Default)]
pub struct MemStorage {
    blobs: BlobMap,
}

impl MemStorage {
    pub const SCHEME: &'static str = "mem";

    pub fn new() -> Self {
        Self::default()
    }

    /// Open from a storage URI; everything after the scheme is ignored
    pub fn open(_uri: &str) -> Result<Self> {
        Ok(Self::new())
    }

    /// Number of committed blobs
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl StorageDriver for MemStorage {
    async fn writer(&self, key: &str) -> Result<Box<dyn BlobWriter>> {
        Ok(Box::new(MemBlobWriter {
            blobs: Arc::clone(&self.blobs),
            key: key.to_string(),
            data: Vec::new(),
            finalized: false,
        }))
    }

    async fn reader(&self, key: &str) -> Result<Option<StoredBlob>> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(key).map(|data| StoredBlob {
            len: data.len() as u64,
            reader: Box::new(Cursor::new(data.clone())),
        }))
    }

    fn scheme(&self) -> &'static str {
        Self::SCHEME
    }
}

/// Buffers a blob and publishes it to the map on commit
pub struct MemBlobWriter {
    blobs: BlobMap,
    key: String,
    data: Vec<u8>,
    finalized: bool,
}

#[async_trait]
impl BlobWriter for MemBlobWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<usize> {
        if self.finalized {
            return Err(ProxyError::CacheError(
                "Cannot write to finalized writer".to_string(),
            ));
        }
        self.data.extend_from_slice(chunk);
        Ok(chunk.len())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.finalized {
            return Err(ProxyError::CacheError("Writer already finalized".to_string()));
        }
        self.finalized = true;
        let data = Bytes::from(std::mem::take(&mut self.data));
        debug!("Committed in-memory blob: key={}, size={}", self.key, data.len());
        self.blobs.write().await.insert(self.key.clone(), data);
        Ok(())
    }

    async fn abort(&mut self, reason: &str) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        debug!("Aborted in-memory blob: key={}, reason={}", self.key, reason);
        self.data = Vec::new();
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_finalized(&self) -> bool {
        self.finalized
    }
}
