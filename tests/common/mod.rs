//! Shared harness for the end-to-end proxy tests: a local origin server with
//! a request counter, test certificates, and a proxy running on ephemeral
//! ports.

#![allow(dead_code)]

use bytes::Bytes;
use cache_proxy::config::CachePipelineConfig;
use cache_proxy::loopback::LoopbackAddr;
use cache_proxy::proxy::{ProxyOptions, ProxyServer};
use cache_proxy::shutdown::{InFlightWrites, ShutdownCoordinator};
use cache_proxy::storage::StorageDriver;
use cache_proxy::tls;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const PACKAGE_BODY: &[u8] = b"package tarball contents, version 1.0.0";
pub const LARGE_BODY_LEN: usize = 4 * 1024 * 1024;

/// Local origin server counting the requests it serves
pub struct Origin {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    last_headers: Arc<Mutex<Option<HeaderMap>>>,
}

impl Origin {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_headers(&self) -> Option<HeaderMap> {
        self.last_headers.lock().unwrap().clone()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn origin_response(path: &str) -> Response<Full<Bytes>> {
    let (status, body): (StatusCode, Bytes) = match path {
        "/pkg.tgz" => (StatusCode::OK, Bytes::from_static(PACKAGE_BODY)),
        "/large.bin" => (StatusCode::OK, Bytes::from(vec![7u8; LARGE_BODY_LEN])),
        "/missing" => (StatusCode::NOT_FOUND, Bytes::from_static(b"not found")),
        "/gone" => (StatusCode::GONE, Bytes::new()),
        _ => (StatusCode::NOT_FOUND, Bytes::new()),
    };

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header("x-origin", "test")
        .body(Full::new(body))
        .unwrap()
}

pub async fn start_origin() -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let last_headers = Arc::new(Mutex::new(None));

    let server_hits = Arc::clone(&hits);
    let server_headers = Arc::clone(&last_headers);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let hits = Arc::clone(&server_hits);
            let last_headers = Arc::clone(&server_headers);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    *last_headers.lock().unwrap() = Some(req.headers().clone());
                    async move { Ok::<_, Infallible>(origin_response(req.uri().path())) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Origin {
        addr,
        hits,
        last_headers,
    }
}

/// CA plus a leaf for `localhost` and `127.0.0.1` signed by it
pub struct TestCerts {
    pub ca: CertificateDer<'static>,
    pub server_config: Arc<rustls::ServerConfig>,
}

pub fn test_certs() -> TestCerts {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "cache-proxy test CA");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let leaf_params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    let leaf = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
    let server_config =
        tls::server_config(vec![leaf.der().clone(), ca_cert.der().clone()], key).unwrap();

    TestCerts {
        ca: ca_cert.der().clone(),
        server_config: Arc::new(server_config),
    }
}

/// A proxy serving on an ephemeral port
pub struct TestProxy {
    pub addr: SocketAddr,
    pub cache_writes: InFlightWrites,
    coordinator: ShutdownCoordinator,
    task: JoinHandle<cache_proxy::Result<()>>,
}

impl TestProxy {
    /// Wait until every cache write started so far has committed or aborted
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.cache_writes.wait_idle())
            .await
            .expect("cache writes did not settle");
    }

    pub async fn shutdown(self) {
        self.coordinator.initiate_shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("proxy did not stop")
            .unwrap()
            .unwrap();
    }
}

pub fn test_options(loopback: LoopbackAddr, cache: CachePipelineConfig) -> ProxyOptions {
    ProxyOptions {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        loopback,
        request_timeout: Duration::from_secs(5),
        cache,
        origin_tls: Arc::new(tls::origin_client_config(Vec::new()).unwrap()),
    }
}

pub async fn start_proxy_with(
    driver: Arc<dyn StorageDriver>,
    options: ProxyOptions,
    server_config: Arc<rustls::ServerConfig>,
) -> TestProxy {
    let server = ProxyServer::new(options, driver, server_config).unwrap();
    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr();
    let cache_writes = server.cache_writes();

    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    coordinator.set_cache_writes(cache_writes.clone());
    let task = tokio::spawn(bound.serve(coordinator.subscribe()));

    TestProxy {
        addr,
        cache_writes,
        coordinator,
        task,
    }
}

pub async fn start_proxy(driver: Arc<dyn StorageDriver>) -> TestProxy {
    let options = test_options(LoopbackAddr::Memory, CachePipelineConfig::default());
    start_proxy_with(driver, options, test_certs().server_config).await
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Send one request over an existing connection
pub async fn send_over<T>(io: T, req: Request<Empty<Bytes>>) -> Reply
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(conn);

    let response = sender.send_request(req).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Reply {
        status: parts.status,
        headers: parts.headers,
        body,
    }
}

/// Proxy-style GET with an absolute-form target
pub async fn proxy_get(proxy: SocketAddr, url: &str) -> Reply {
    let uri: hyper::Uri = url.parse().unwrap();
    let host = uri.authority().unwrap().to_string();
    let req = Request::get(uri)
        .header("host", host)
        .header("user-agent", "cache-proxy-tests/1.0")
        .header("authorization", "Bearer not-for-origin")
        .body(Empty::new())
        .unwrap();
    send_over(TcpStream::connect(proxy).await.unwrap(), req).await
}
