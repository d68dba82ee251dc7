//! Origin Connector
//!
//! `tower::Service<Uri>` connector for the hyper client used on cache misses.
//! `http` URIs get a plain TCP connection, `https` URIs a rustls session
//! verified against the configured roots.

use crate::{ProxyError, Result};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tower::Service;
use tracing::{debug, warn};

/// Connection to an origin server
pub enum OriginStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl OriginStream {
    fn poll_read_tokio(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self {
            OriginStream::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            OriginStream::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl Read for OriginStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        // SAFETY: the tokio ReadBuf only writes initialized bytes into the
        // cursor's spare capacity and we advance by exactly that amount.
        let mut tokio_buf = ReadBuf::uninit(unsafe { buf.as_mut() });
        match self.poll_read_tokio(cx, &mut tokio_buf) {
            Poll::Ready(Ok(())) => {
                let filled = tokio_buf.filled().len();
                unsafe {
                    buf.advance(filled);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Write for OriginStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            OriginStream::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            OriginStream::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            OriginStream::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            OriginStream::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            OriginStream::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            OriginStream::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connection for OriginStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Dials origins for the hyper client
#[derive(Clone)]
pub struct OriginConnector {
    tls_connector: TlsConnector,
    connect_timeout: Duration,
}

impl OriginConnector {
    pub fn new(tls_config: Arc<rustls::ClientConfig>, connect_timeout: Duration) -> Self {
        Self {
            tls_connector: TlsConnector::from(tls_config),
            connect_timeout,
        }
    }
}

/// Host and port to dial for `uri`, with IPv6 brackets removed
fn target(uri: &Uri) -> Result<(String, u16, bool)> {
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::InvalidRequest(format!("No host in URI {}", uri)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

    let tls = match uri.scheme_str() {
        Some("https") => true,
        Some("http") | None => false,
        Some(other) => {
            return Err(ProxyError::InvalidRequest(format!(
                "Unsupported origin scheme '{}'",
                other
            )))
        }
    };
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Ok((host, port, tls))
}

impl Service<Uri> for OriginConnector {
    type Response = OriginStream;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        // Always ready to create new connections
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls_connector = self.tls_connector.clone();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let (host, port, tls) = target(&uri)?;
            debug!("Connecting to origin {}:{} (tls={})", host, port, tls);

            let tcp = tokio::time::timeout(
                connect_timeout,
                TcpStream::connect((host.as_str(), port)),
            )
            .await
            .map_err(|_| {
                ProxyError::TimeoutError(format!("Connecting to {}:{} timed out", host, port))
            })?
            .map_err(|e| {
                warn!("TCP connection failed to {}:{}: {}", host, port, e);
                ProxyError::ConnectionError(format!("Failed to connect to {}:{}: {}", host, port, e))
            })?;

            if let Err(e) = tcp.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}:{}: {}", host, port, e);
            }

            if !tls {
                return Ok(OriginStream::Plain(tcp));
            }

            let server_name = ServerName::try_from(host.clone()).map_err(|e| {
                ProxyError::TlsError(format!("Invalid server name '{}': {}", host, e))
            })?;

            let stream = tls_connector.connect(server_name, tcp).await.map_err(|e| {
                warn!("TLS handshake failed to {}:{}: {}", host, port, e);
                ProxyError::TlsError(format!("TLS handshake failed to {}: {}", host, e))
            })?;

            debug!("TLS connection established to {}:{}", host, port);
            Ok(OriginStream::Tls(Box::new(stream)))
        })
    }
}
