//! Cache Module
//!
//! URL keyed write-through cache on top of a [`StorageDriver`].
//!
//! - Read path: [`Cache::read`] opens the blob for a URL and yields it in
//!   fixed size chunks, tracking how much was produced.
//! - Write path: [`Cache::tee`] wraps an origin body in a [`TeeStream`] and
//!   spawns one persistence task that writes the copied chunks and commits
//!   the blob only if it matches what the client received byte for byte.
//!   The queue between them holds `queue_capacity` chunks of `chunk_size`.

use crate::config::CachePipelineConfig;
use crate::storage::{BlobReader, BlobWriter, StorageDriver};
use crate::tee_stream::{Completion, TeeStream};
use crate::{ProxyError, Result};
use bytes::Bytes;
use futures::Stream;
use hyper::body::Frame;
use std::fmt;
use std::fmt::Display;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cache key for a URL: BLAKE3 truncated to 128 bits, lowercase hex
pub fn cache_key(url: &str) -> String {
    let hash = blake3::hash(url.as_bytes());
    hash.to_hex().as_str()[..32].to_string()
}

/// How a write-through attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    Committed { bytes: u64 },
    Aborted { reason: String },
    /// No writer could be opened; the response was passed through
    Skipped { reason: String },
}

impl CacheOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CacheOutcome::Committed { .. })
    }
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheOutcome::Committed { bytes } => write!(f, "committed {} bytes", bytes),
            CacheOutcome::Aborted { reason } => write!(f, "aborted: {}", reason),
            CacheOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// URL keyed cache over a storage driver
#[derive(Clone)]
pub struct Cache {
    driver: Arc<dyn StorageDriver>,
    config: CachePipelineConfig,
}

impl Cache {
    pub fn new(driver: Arc<dyn StorageDriver>, config: CachePipelineConfig) -> Self {
        Self { driver, config }
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub fn config(&self) -> &CachePipelineConfig {
        &self.config
    }

    /// Open the cached blob for `url`
    ///
    /// Returns [`ProxyError::CacheMiss`] when nothing was committed.
    pub async fn read(&self, url: &str) -> Result<CachedBody> {
        let key = cache_key(url);
        match self.driver.reader(&key).await? {
            Some(blob) => {
                debug!("Cache hit: url={}, key={}, size={}", url, key, blob.len);
                Ok(CachedBody {
                    key,
                    reader: blob.reader,
                    len: blob.len,
                    written: 0,
                    chunk_size: self.config.chunk_size.max(1),
                })
            }
            None => Err(ProxyError::CacheMiss {
                url: url.to_string(),
                key,
            }),
        }
    }

    /// Tee `origin` into the cache under the key of `url`
    ///
    /// The returned stream yields exactly what `origin` yields. The handle
    /// resolves once the blob was committed or aborted.
    pub async fn tee<S, E>(&self, url: &str, origin: S) -> (TeeStream<S>, JoinHandle<CacheOutcome>)
    where
        S: Stream<Item = std::result::Result<Frame<Bytes>, E>> + Unpin,
        E: Display,
    {
        let key = cache_key(url);
        let writer = match self.driver.writer(&key).await {
            Ok(writer) => writer,
            Err(e) => {
                warn!("Cache writer unavailable, passing through: url={}, error={}", url, e);
                let reason = e.to_string();
                let outcome = tokio::spawn(async move { CacheOutcome::Skipped { reason } });
                return (TeeStream::passthrough(origin), outcome);
            }
        };

        let (chunk_tx, chunk_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (completion_tx, completion_rx) = oneshot::channel();

        let handle = tokio::spawn(persist(
            writer,
            chunk_rx,
            completion_rx,
            url.to_string(),
            key,
        ));

        let tee = TeeStream::new(
            origin,
            chunk_tx,
            completion_tx,
            self.config.chunk_size,
            self.config.retry_wait,
        );
        (tee, handle)
    }
}

/// Persistence side of a tee: drain the queue into the writer, then commit
/// or abort depending on the completion report
async fn persist(
    mut writer: Box<dyn BlobWriter>,
    mut chunks: mpsc::Receiver<Bytes>,
    completion: oneshot::Receiver<Completion>,
    url: String,
    key: String,
) -> CacheOutcome {
    let mut failure = None;
    while let Some(chunk) = chunks.recv().await {
        match writer.write(&chunk).await {
            Ok(n) if n == chunk.len() => {}
            Ok(n) => {
                failure = Some(format!("short write: {} of {} bytes", n, chunk.len()));
                break;
            }
            Err(e) => {
                failure = Some(format!("write failed: {}", e));
                break;
            }
        }
    }
    // Tells the tee to stop offering
    drop(chunks);

    let persisted = writer.bytes_written();
    let failure = match failure {
        Some(reason) => Some(reason),
        None => match completion.await {
            Ok(Ok(forwarded)) if forwarded == persisted => None,
            Ok(Ok(forwarded)) => Some(format!(
                "integrity: persisted {} bytes of {} bytes sent to the client",
                persisted, forwarded
            )),
            Ok(Err(reason)) => Some(reason),
            Err(_) => Some("response ended without a completion report".to_string()),
        },
    };

    match failure {
        None => match writer.commit().await {
            Ok(()) => {
                info!(
                    "Cached response: url={}, key={}, bytes={}",
                    url, key, persisted
                );
                CacheOutcome::Committed { bytes: persisted }
            }
            Err(e) => {
                warn!("Cache commit failed: url={}, key={}, error={}", url, key, e);
                let _ = writer.abort("commit failed").await;
                CacheOutcome::Aborted {
                    reason: format!("commit failed: {}", e),
                }
            }
        },
        Some(reason) => {
            warn!(
                "Cache write aborted: url={}, key={}, persisted={}, reason={}",
                url, key, persisted, reason
            );
            if let Err(e) = writer.abort(&reason).await {
                warn!("Cache abort cleanup failed: key={}, error={}", key, e);
            }
            CacheOutcome::Aborted { reason }
        }
    }
}

/// A committed blob being served
pub struct CachedBody {
    key: String,
    reader: BlobReader,
    len: u64,
    written: u64,
    chunk_size: usize,
}

impl CachedBody {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Blob length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes produced so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Read the next chunk; `None` once the whole blob was produced
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        let mut buf = vec![0u8; self.chunk_size];
        match self.reader.read(&mut buf).await {
            Ok(0) if self.written < self.len => Some(Err(ProxyError::CacheError(format!(
                "blob {} truncated: read {} of {} bytes",
                self.key, self.written, self.len
            )))),
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                self.written += n as u64;
                Some(Ok(Bytes::from(buf)))
            }
            Err(e) => Some(Err(ProxyError::CacheError(format!(
                "blob {} read failed after {} bytes: {}",
                self.key, self.written, e
            )))),
        }
    }

    /// Turn the remaining blob into a chunk stream
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send {
        futures::stream::unfold(self, |mut body| async move {
            let chunk = body.next_chunk().await?;
            Some((chunk, body))
        })
    }
}
