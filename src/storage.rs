//! Storage Driver Module
//!
//! Key to blob persistence behind a small driver abstraction. Drivers are
//! selected by URI scheme through a [`StorageRegistry`] that is built once at
//! startup and never mutated afterwards.
//!
//! A [`BlobWriter`] is one in-flight write under one key. It ends in exactly
//! one terminal outcome: `commit` publishes the blob, `abort` discards it.
//! Calling `abort` after a terminal outcome is a no-op, so cleanup paths can
//! always call it. Nothing written through a writer is visible to readers
//! before `commit` returns.

use crate::fs_storage::FsStorage;
use crate::mem_storage::MemStorage;
use crate::{ProxyError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::info;

/// Reader over a committed blob
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// A committed blob opened for reading
pub struct StoredBlob {
    pub reader: BlobReader,
    /// Length of the blob in bytes
    pub len: u64,
}

/// One in-flight write under a single key
#[async_trait]
pub trait BlobWriter: Send {
    /// Append a chunk, returning the number of bytes accepted
    async fn write(&mut self, chunk: &[u8]) -> Result<usize>;

    /// Publish everything written so far under the key
    async fn commit(&mut self) -> Result<()>;

    /// Discard everything written so far. No-op after a terminal outcome.
    async fn abort(&mut self, reason: &str) -> Result<()>;

    /// Bytes accepted by `write` so far
    fn bytes_written(&self) -> u64;

    /// Whether `commit` or `abort` already ran
    fn is_finalized(&self) -> bool;
}

/// Key to blob persistence backend
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Open a writer for `key`
    async fn writer(&self, key: &str) -> Result<Box<dyn BlobWriter>>;

    /// Open the committed blob for `key`, `None` if nothing was committed
    async fn reader(&self, key: &str) -> Result<Option<StoredBlob>>;

    /// Scheme this driver is registered under
    fn scheme(&self) -> &'static str;
}

/// Constructs a driver from its storage URI
pub type StorageOpener = fn(&str) -> Result<Arc<dyn StorageDriver>>;

/// Scheme name to driver constructor map
pub struct StorageRegistry {
    openers: Vec<(&'static str, StorageOpener)>,
}

impl StorageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            openers: Vec::new(),
        }
    }

    /// Create a registry with the built-in `mem` and `fs` drivers
    pub fn with_default_drivers() -> Self {
        let mut registry = Self::new();
        registry.register(MemStorage::SCHEME, |uri| {
            Ok(Arc::new(MemStorage::open(uri)?) as Arc<dyn StorageDriver>)
        });
        registry.register(FsStorage::SCHEME, |uri| {
            Ok(Arc::new(FsStorage::open(uri)?) as Arc<dyn StorageDriver>)
        });
        registry
    }

    /// Register a driver under `scheme`, replacing any previous one
    pub fn register(&mut self, scheme: &'static str, opener: StorageOpener) {
        self.openers.retain(|(existing, _)| *existing != scheme);
        self.openers.push((scheme, opener));
    }

    /// Registered scheme names in registration order
    pub fn schemes(&self) -> Vec<&'static str> {
        self.openers.iter().map(|(scheme, _)| *scheme).collect()
    }

    /// Open the driver selected by the scheme of `uri`
    ///
    /// A bare scheme name (`mem`) is accepted as well as `<scheme>://...`.
    pub fn open(&self, uri: &str) -> Result<Arc<dyn StorageDriver>> {
        let uri = uri.trim();
        for (scheme, opener) in &self.openers {
            if uri == *scheme || uri.starts_with(&format!("{}://", scheme)) {
                let driver = opener(uri)?;
                info!("Opened {} storage from {}", scheme, uri);
                return Ok(driver);
            }
        }
        Err(ProxyError::UnknownScheme(uri.to_string()))
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_default_drivers()
    }
}
