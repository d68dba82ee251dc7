//! Filesystem storage driver
//!
//! Blobs are stored under `<folder>/<key[0..2]>/<key[2..4]>/<key>`. A writer
//! streams into a private temporary file under the system temp dir; commit
//! copies it next to its final location and publishes it with one rename, so
//! readers see either nothing or the complete blob.
//!
//! The total size of stored blobs is bounded by `limit`. A commit that would
//! exceed the limit is rejected and its data discarded. Replacing a blob only
//! charges the difference to the blob it replaces; publishing is serialized so
//! concurrent commits to one key are accounted once.

use crate::bytefmt::{parse_byte_quantity, GIBIBYTE};
use crate::storage::{BlobWriter, StorageDriver, StoredBlob};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Limit used when the URI has no `limit` or sets it to zero
pub const DEFAULT_FS_LIMIT: u64 = 4 * GIBIBYTE;

const URI_PREFIX: &str = "fs://";
const TEMP_FILE_PREFIX: &str = "cache-proxy-fs-";
const STAGING_SUFFIX: &str = ".tmp";

/// Sharded directory tree with a size limit
#[derive(Clone)]
pub struct FsStorage {
    folder: PathBuf,
    limit: u64,
    used: Arc<AtomicU64>,
    publish_lock: Arc<Mutex<()>>,
}

impl FsStorage {
    pub const SCHEME: &'static str = "fs";

    /// Open from `fs://<path>?limit=<quantity>`
    ///
    /// Leading `./` and `../` in the path are resolved against the current
    /// working directory.
    pub fn open(uri: &str) -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read current directory: {}", e))
        })?;
        let (folder, limit) = parse_fs_uri(uri, &cwd)?;
        Self::new(folder, limit)
    }

    /// Create the folder if needed and account for what is already stored
    pub fn new(folder: impl Into<PathBuf>, limit: u64) -> Result<Self> {
        let folder = folder.into();
        std::fs::create_dir_all(&folder).map_err(|e| {
            error!("Failed to create storage folder: path={:?}, error={}", folder, e);
            ProxyError::ConfigError(format!(
                "Failed to create storage folder {}: {}",
                folder.display(),
                e
            ))
        })?;

        let used = scan_stored_bytes(&folder);
        info!(
            "Filesystem storage ready: folder={:?}, limit={}, used={}",
            folder, limit, used
        );

        Ok(Self {
            folder,
            limit,
            used: Arc::new(AtomicU64::new(used)),
            publish_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes currently held by committed blobs
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    /// Final location of the blob for `key`
    pub fn blob_path(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(key)
    }

    fn shard_dir(&self, key: &str) -> PathBuf {
        match (key.get(0..2), key.get(2..4)) {
            (Some(first), Some(second)) => self.folder.join(first).join(second),
            _ => self.folder.clone(),
        }
    }

    /// Open a writer with its concrete type
    pub async fn create_writer(&self, key: &str) -> Result<FsBlobWriter> {
        let temp_path =
            std::env::temp_dir().join(format!("{}{}", TEMP_FILE_PREFIX, Uuid::new_v4()));

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let temp_file = options.open(&temp_path).await.map_err(|e| {
            error!(
                "Failed to create temporary blob file: path={:?}, error={}",
                temp_path, e
            );
            ProxyError::CacheError(format!("Failed to create temporary file: {}", e))
        })?;

        debug!("Opened blob writer: key={}, temp_path={:?}", key, temp_path);

        Ok(FsBlobWriter {
            key: key.to_string(),
            temp_file: Some(temp_file),
            temp_path,
            shard_dir: self.shard_dir(key),
            final_path: self.blob_path(key),
            limit: self.limit,
            used: Arc::clone(&self.used),
            publish_lock: Arc::clone(&self.publish_lock),
            bytes_written: 0,
            finalized: false,
        })
    }
}

#[async_trait]
impl StorageDriver for FsStorage {
    async fn writer(&self, key: &str) -> Result<Box<dyn BlobWriter>> {
        Ok(Box::new(self.create_writer(key).await?))
    }

    async fn reader(&self, key: &str) -> Result<Option<StoredBlob>> {
        let path = self.blob_path(key);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProxyError::CacheError(format!(
                    "Failed to open blob {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let len = file.metadata().await?.len();
        Ok(Some(StoredBlob {
            reader: Box::new(file),
            len,
        }))
    }

    fn scheme(&self) -> &'static str {
        Self::SCHEME
    }
}

/// Split an `fs://` URI into its folder and byte limit
pub(crate) fn parse_fs_uri(uri: &str, cwd: &Path) -> Result<(PathBuf, u64)> {
    let rest = uri
        .trim()
        .strip_prefix(URI_PREFIX)
        .ok_or_else(|| ProxyError::UnknownScheme(uri.to_string()))?;

    let (location, query) = match rest.split_once('?') {
        Some((location, query)) => (location, Some(query)),
        None => (rest, None),
    };

    let folder = if let Some(relative) = location.strip_prefix("./") {
        cwd.join(relative)
    } else if let Some(relative) = location.strip_prefix("../") {
        cwd.join("..").join(relative)
    } else if location.starts_with('/') {
        PathBuf::from(location)
    } else if location.is_empty() {
        return Err(ProxyError::ConfigError(format!(
            "Storage URI has no folder: {}",
            uri
        )));
    } else {
        let authority = location.split('/').next().unwrap_or(location);
        return Err(ProxyError::ConfigError(format!(
            "Storage URI must not name a host ('{}'), use fs:///absolute/path or fs://./relative/path: {}",
            authority, uri
        )));
    };

    let mut limit = 0;
    if let Some(query) = query {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if name != "limit" {
                continue;
            }
            // A bare zero asks for the default like an empty value does
            let value = value.trim();
            if value.is_empty() || value.parse::<f64>() == Ok(0.0) {
                continue;
            }
            limit = parse_byte_quantity(value)?;
        }
    }
    if limit == 0 {
        limit = DEFAULT_FS_LIMIT;
    }

    Ok((folder, limit))
}

/// Sum blob sizes under `folder`, removing staging files left by a crash
fn scan_stored_bytes(folder: &Path) -> u64 {
    let mut used = 0;
    for entry in WalkDir::new(folder).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with(STAGING_SUFFIX) {
            debug!("Removing stale staging file: {:?}", entry.path());
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!(
                    "Failed to remove stale staging file: path={:?}, error={}",
                    entry.path(),
                    e
                );
            }
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            used += metadata.len();
        }
    }
    used
}

/// In-flight write of one blob
pub struct FsBlobWriter {
    key: String,
    temp_file: Option<File>,
    temp_path: PathBuf,
    shard_dir: PathBuf,
    final_path: PathBuf,
    limit: u64,
    used: Arc<AtomicU64>,
    publish_lock: Arc<Mutex<()>>,
    bytes_written: u64,
    finalized: bool,
}

impl FsBlobWriter {
    /// Private temporary file receiving the data
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Where the blob lands on commit
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    fn reserve(&self, len: u64) -> Result<()> {
        let limit = self.limit;
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(len).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|used| {
                ProxyError::QuotaExceeded(format!(
                    "blob {} of {} bytes does not fit: {} of {} bytes used",
                    self.key, len, used, limit
                ))
            })
    }

    fn release(&self, len: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(len))
            });
    }

    /// Copy the temporary file next to its final location and fsync it
    async fn stage(&self, staging_path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.shard_dir).await?;
        tokio::fs::copy(&self.temp_path, staging_path).await?;
        let staged = OpenOptions::new().write(true).open(staging_path).await?;
        staged.sync_all().await
    }

    /// Rename the staged copy into place, charging only the growth over the
    /// blob it replaces
    async fn publish(&self, staging_path: &Path) -> Result<()> {
        let len = self.bytes_written;
        let _publishing = self.publish_lock.lock().await;

        let replaced = match tokio::fs::metadata(&self.final_path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };
        let growth = len.saturating_sub(replaced);
        self.reserve(growth)?;

        if let Err(e) = tokio::fs::rename(staging_path, &self.final_path).await {
            self.release(growth);
            return Err(ProxyError::CacheError(format!(
                "Failed to commit blob {}: {}",
                self.key, e
            )));
        }
        self.release(replaced.saturating_sub(len));
        Ok(())
    }

    async fn remove_temp_file(&mut self) {
        self.temp_file.take();
        if let Err(e) = tokio::fs::remove_file(&self.temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove temporary file: path={:?}, error={}",
                    self.temp_path, e
                );
            }
        }
    }
}

#[async_trait]
impl BlobWriter for FsBlobWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<usize> {
        if self.finalized {
            return Err(ProxyError::CacheError(
                "Cannot write to finalized writer".to_string(),
            ));
        }
        let file = self
            .temp_file
            .as_mut()
            .ok_or_else(|| ProxyError::CacheError("Temporary file not available".to_string()))?;

        file.write_all(chunk).await.map_err(|e| {
            error!(
                "Failed to write blob chunk: path={:?}, size={}, error={}",
                self.temp_path,
                chunk.len(),
                e
            );
            ProxyError::CacheError(format!("Failed to write to cache: {}", e))
        })?;

        self.bytes_written += chunk.len() as u64;
        Ok(chunk.len())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.finalized {
            return Err(ProxyError::CacheError("Writer already finalized".to_string()));
        }
        self.finalized = true;

        if let Some(mut file) = self.temp_file.take() {
            if let Err(e) = file.flush().await {
                self.remove_temp_file().await;
                return Err(ProxyError::CacheError(format!(
                    "Failed to flush temporary file: {}",
                    e
                )));
            }
        }

        let staging_path = self.final_path.with_file_name(format!(
            "{}.{}{}",
            self.key,
            Uuid::new_v4(),
            STAGING_SUFFIX
        ));

        let staged = self.stage(&staging_path).await;
        self.remove_temp_file().await;
        let result = match staged {
            Ok(()) => self.publish(&staging_path).await,
            Err(e) => Err(ProxyError::CacheError(format!(
                "Failed to stage blob {}: {}",
                self.key, e
            ))),
        };

        match result {
            Ok(()) => {
                info!(
                    "Committed blob: key={}, path={:?}, bytes={}",
                    self.key, self.final_path, self.bytes_written
                );
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging_path).await;
                match &e {
                    ProxyError::QuotaExceeded(_) => warn!("Rejected blob commit: {}", e),
                    _ => error!(
                        "Failed to commit blob: key={}, path={:?}, error={}",
                        self.key, self.final_path, e
                    ),
                }
                Err(e)
            }
        }
    }

    async fn abort(&mut self, reason: &str) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        debug!("Aborting blob: key={}, reason={}", self.key, reason);
        self.remove_temp_file().await;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl Drop for FsBlobWriter {
    fn drop(&mut self) {
        if !self.finalized && self.temp_path.exists() {
            warn!(
                "Blob writer dropped without commit or abort, cleaning up: {:?}",
                self.temp_path
            );
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}
