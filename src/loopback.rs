//! Loopback transport
//!
//! Channel between the CONNECT handler and the TLS endpoint. The default is a
//! Unix domain socket private to the process; the in-process variant pairs
//! the two ends with a duplex pipe and never touches the filesystem.

use crate::{ProxyError, Result};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Buffer size of each in-process pipe direction
const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

/// Pending in-process connections not yet accepted
const MEMORY_BACKLOG: usize = 128;

/// Where the TLS endpoint listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackAddr {
    Unix(PathBuf),
    Memory,
}

impl LoopbackAddr {
    /// Default Unix socket for a proxy port: `<tmp>/cache-proxy_<port>.sock`
    pub fn default_unix(port: u16) -> Self {
        LoopbackAddr::Unix(std::env::temp_dir().join(format!("cache-proxy_{}.sock", port)))
    }

    /// Bind the endpoint and return it with a dialer for the CONNECT side
    pub fn bind(&self) -> Result<(LoopbackListener, LoopbackDialer)> {
        match self {
            LoopbackAddr::Unix(path) => {
                remove_stale_socket(path);
                let listener = UnixListener::bind(path).map_err(|e| {
                    ProxyError::ConnectionError(format!(
                        "Failed to bind loopback socket {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                info!("TLS endpoint listening on {}", path.display());
                Ok((
                    LoopbackListener::Unix {
                        listener,
                        path: path.clone(),
                    },
                    LoopbackDialer::Unix(path.clone()),
                ))
            }
            LoopbackAddr::Memory => {
                let (tx, rx) = mpsc::channel(MEMORY_BACKLOG);
                info!("TLS endpoint listening in-process");
                Ok((LoopbackListener::Memory(rx), LoopbackDialer::Memory(tx)))
            }
        }
    }
}

impl fmt::Display for LoopbackAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopbackAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            LoopbackAddr::Memory => write!(f, "memory"),
        }
    }
}

fn remove_stale_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale loopback socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove loopback socket {}: {}", path.display(), e),
    }
}

/// Accepting side of the loopback endpoint
///
/// Dropping a Unix listener removes its socket file.
pub enum LoopbackListener {
    Unix { listener: UnixListener, path: PathBuf },
    Memory(mpsc::Receiver<DuplexStream>),
}

impl LoopbackListener {
    pub async fn accept(&mut self) -> Result<LoopbackStream> {
        match self {
            LoopbackListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(LoopbackStream::Unix(stream))
            }
            LoopbackListener::Memory(rx) => rx
                .recv()
                .await
                .map(LoopbackStream::Memory)
                .ok_or_else(|| ProxyError::ConnectionError("Loopback dialers are gone".to_string())),
        }
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        if let LoopbackListener::Unix { path, .. } = self {
            match std::fs::remove_file(&*path) {
                Ok(()) => debug!("Removed loopback socket {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove loopback socket {}: {}", path.display(), e),
            }
        }
    }
}

/// Connecting side of the loopback endpoint
#[derive(Clone)]
pub enum LoopbackDialer {
    Unix(PathBuf),
    Memory(mpsc::Sender<DuplexStream>),
}

impl LoopbackDialer {
    pub async fn dial(&self) -> Result<LoopbackStream> {
        match self {
            LoopbackDialer::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    ProxyError::ConnectionError(format!(
                        "Failed to dial loopback socket {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(LoopbackStream::Unix(stream))
            }
            LoopbackDialer::Memory(tx) => {
                let (local, remote) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
                tx.send(remote).await.map_err(|_| {
                    ProxyError::ConnectionError("Loopback endpoint is closed".to_string())
                })?;
                Ok(LoopbackStream::Memory(local))
            }
        }
    }
}

/// One loopback connection
pub enum LoopbackStream {
    Unix(UnixStream),
    Memory(DuplexStream),
}

impl AsyncRead for LoopbackStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LoopbackStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            LoopbackStream::Memory(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LoopbackStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            LoopbackStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            LoopbackStream::Memory(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LoopbackStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            LoopbackStream::Memory(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LoopbackStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            LoopbackStream::Memory(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_once(addr: LoopbackAddr) {
        let (mut listener, dialer) = addr.bind().unwrap();
        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            listener
        });

        let mut client = dialer.dial().await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        echo_once(LoopbackAddr::Memory).await;
    }

    #[tokio::test]
    async fn test_unix_round_trip_and_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("proxy.sock");
        // Stale file from an earlier run
        std::fs::write(&path, b"").unwrap();

        echo_once(LoopbackAddr::Unix(path.clone())).await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unusable_socket_path_fails_bind() {
        let addr = LoopbackAddr::Unix(PathBuf::from("/nonexistent-dir/cache-proxy.sock"));
        assert!(matches!(addr.bind(), Err(ProxyError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_dial_after_listener_closed_fails() {
        let (listener, dialer) = LoopbackAddr::Memory.bind().unwrap();
        drop(listener);
        assert!(dialer.dial().await.is_err());

        let temp_dir = TempDir::new().unwrap();
        let (listener, dialer) = LoopbackAddr::Unix(temp_dir.path().join("gone.sock"))
            .bind()
            .unwrap();
        drop(listener);
        assert!(dialer.dial().await.is_err());
    }

    #[test]
    fn test_default_unix_path() {
        assert_eq!(
            LoopbackAddr::default_unix(8999),
            LoopbackAddr::Unix(std::env::temp_dir().join("cache-proxy_8999.sock"))
        );
    }
}
