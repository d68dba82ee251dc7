//! CONNECT interception: the tunnel is spliced onto the loopback TLS
//! endpoint, the client's TLS session is terminated with the test
//! certificate, and the decrypted GETs are answered from the cache.

mod common;

use bytes::Bytes;
use cache_proxy::cache::cache_key;
use cache_proxy::config::CachePipelineConfig;
use cache_proxy::loopback::LoopbackAddr;
use cache_proxy::mem_storage::MemStorage;
use cache_proxy::proxy::X_CACHE;
use cache_proxy::storage::StorageDriver;
use cache_proxy::tls;
use common::*;
use http_body_util::Empty;
use hyper::{Request, StatusCode};
use rustls::pki_types::{CertificateDer, ServerName};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const CACHED_BODY: &[u8] = b"{\"name\":\"left-pad\",\"versions\":{}}";

async fn seed(storage: &MemStorage, url: &str, body: &[u8]) {
    let mut writer = storage.writer(&cache_key(url)).await.unwrap();
    writer.write(body).await.unwrap();
    writer.commit().await.unwrap();
}

/// Send CONNECT and read the reply head, byte at a time so nothing past the
/// head is consumed
async fn connect_head(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n",
        target = target
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await.unwrap();
        assert_eq!(n, 1, "proxy closed the tunnel early");
        head.push(byte[0]);
    }
    (stream, String::from_utf8(head).unwrap())
}

/// Open a CONNECT tunnel and return the raw stream plus the status line
async fn open_tunnel(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
    let (stream, head) = connect_head(proxy, target).await;
    let status_line = head.lines().next().unwrap_or_default().to_string();
    (stream, status_line)
}

async fn tls_client(
    stream: TcpStream,
    ca: &CertificateDer<'static>,
    server_name: &'static str,
) -> TlsStream<TcpStream> {
    let config = tls::origin_client_config(vec![ca.clone()]).unwrap();
    let connector = TlsConnector::from(Arc::new(config));
    connector
        .connect(ServerName::try_from(server_name).unwrap(), stream)
        .await
        .unwrap()
}

async fn intercepted_get_from_cache(loopback: LoopbackAddr) {
    let certs = test_certs();
    let storage = MemStorage::new();
    seed(&storage, "https://localhost/left-pad", CACHED_BODY).await;

    let options = test_options(loopback, CachePipelineConfig::default());
    let proxy = start_proxy_with(Arc::new(storage), options, Arc::clone(&certs.server_config)).await;

    let (tunnel, status_line) = open_tunnel(proxy.addr, "localhost:443").await;
    assert_eq!(status_line, "HTTP/1.1 200 Connection established");

    let tls = tls_client(tunnel, &certs.ca, "localhost").await;
    let req = Request::get("/left-pad")
        .header("host", "localhost")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let reply = send_over(tls, req).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers[X_CACHE], "HIT");
    assert_eq!(&reply.body[..], CACHED_BODY);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_connect_is_intercepted_over_memory_loopback() {
    intercepted_get_from_cache(LoopbackAddr::Memory).await;
}

#[tokio::test]
async fn test_connect_is_intercepted_over_unix_loopback() {
    let temp_dir = TempDir::new().unwrap();
    let socket = temp_dir.path().join("proxy.sock");

    intercepted_get_from_cache(LoopbackAddr::Unix(socket.clone())).await;

    assert!(!socket.exists(), "socket file must be removed at shutdown");
}

#[tokio::test]
async fn test_missing_sni_falls_back_to_host_header() {
    let certs = test_certs();
    let storage = MemStorage::new();
    seed(&storage, "https://mirror.internal/simple/", CACHED_BODY).await;

    let proxy = start_proxy_with(
        Arc::new(storage),
        test_options(LoopbackAddr::Memory, CachePipelineConfig::default()),
        Arc::clone(&certs.server_config),
    )
    .await;

    let (tunnel, status_line) = open_tunnel(proxy.addr, "127.0.0.1:443").await;
    assert!(status_line.ends_with("200 Connection established"));

    // An IP address server name sends no SNI
    let tls = tls_client(tunnel, &certs.ca, "127.0.0.1").await;
    let req = Request::get("/simple/")
        .header("host", "mirror.internal")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let reply = send_over(tls, req).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&reply.body[..], CACHED_BODY);
}

#[tokio::test]
async fn test_tunnel_closes_when_client_goes_away() {
    let certs = test_certs();
    let proxy = start_proxy_with(
        Arc::new(MemStorage::new()),
        test_options(LoopbackAddr::Memory, CachePipelineConfig::default()),
        Arc::clone(&certs.server_config),
    )
    .await;

    let (tunnel, _) = open_tunnel(proxy.addr, "localhost:443").await;
    let mut tls = tls_client(tunnel, &certs.ca, "localhost").await;
    tls.shutdown().await.unwrap();
    drop(tls);

    // The proxy keeps serving new tunnels afterwards
    let (_tunnel, status_line) = open_tunnel(proxy.addr, "localhost:443").await;
    assert_eq!(status_line, "HTTP/1.1 200 Connection established");
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_connect_reply_head_has_no_framing_headers() {
    let certs = test_certs();
    let proxy = start_proxy_with(
        Arc::new(MemStorage::new()),
        test_options(LoopbackAddr::Memory, CachePipelineConfig::default()),
        Arc::clone(&certs.server_config),
    )
    .await;

    let (_tunnel, head) = connect_head(proxy.addr, "localhost:443").await;
    let mut lines = head.split("\r\n").filter(|line| !line.is_empty());
    assert_eq!(lines.next(), Some("HTTP/1.1 200 Connection established"));

    // hyper may stamp a date; nothing may announce a body
    for line in lines {
        let name = line.split(':').next().unwrap_or_default().to_ascii_lowercase();
        assert_eq!(name, "date", "unexpected header in CONNECT reply: {}", line);
    }

    proxy.shutdown().await;
}
