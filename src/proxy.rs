//! Proxy Module
//!
//! The gateway in front of the cache. Two entry points share one request
//! handler:
//!
//! - the plaintext TCP listener, where clients send proxy-style `GET`s and
//!   `CONNECT`s;
//! - the loopback TLS endpoint. A `CONNECT` is answered by dialing it and
//!   splicing the client's tunnel onto it, so the tunnelled TLS session is
//!   terminated here with the configured certificate and the decrypted
//!   requests come back through [`handle_request`].
//!
//! `GET` responses are served from the cache when present and otherwise
//! fetched from the origin and teed into the cache while streaming to the
//! client.

use crate::cache::{Cache, CachedBody};
use crate::config::{CachePipelineConfig, Config, LoopbackMode};
use crate::loopback::{LoopbackAddr, LoopbackDialer, LoopbackListener, LoopbackStream};
use crate::origin_client::OriginClient;
use crate::shutdown::{InFlightWrites, ShutdownSignal};
use crate::storage::StorageDriver;
use crate::{ProxyError, Result};
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ALLOW, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Response body used by every handler
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

pub const X_CACHE: &str = "x-cache";
pub const X_REQUEST_ID: &str = "x-request-id";

const HIJACK_UNSUPPORTED: &str = "connection does not support hijacking";
const CONNECTION_ESTABLISHED: &[u8] = b"Connection established";

/// Settings of one proxy instance
#[derive(Clone)]
pub struct ProxyOptions {
    pub listen_addr: SocketAddr,
    pub loopback: LoopbackAddr,
    /// Bound on connecting to an origin and receiving its response head
    pub request_timeout: Duration,
    pub cache: CachePipelineConfig,
    /// Trust anchors for `https` origins
    pub origin_tls: Arc<rustls::ClientConfig>,
}

impl ProxyOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let listen = format!("{}:{}", config.server.bind_address, config.server.port);
        let listen_addr = listen.parse().map_err(|e| {
            ProxyError::ConfigError(format!("Invalid listen address {}: {}", listen, e))
        })?;

        let loopback = match config.server.loopback {
            LoopbackMode::Unix => LoopbackAddr::Unix(config.loopback_socket_path()),
            LoopbackMode::Memory => LoopbackAddr::Memory,
        };

        Ok(Self {
            listen_addr,
            loopback,
            request_timeout: config.server.request_timeout,
            cache: config.cache.clone(),
            origin_tls: Arc::new(crate::tls::origin_client_config(Vec::new())?),
        })
    }
}

/// How a request reached the handler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Arrived through the TLS endpoint
    pub tls: bool,
    /// SNI sent by the client during the TLS handshake
    pub tls_server_name: Option<String>,
}

impl ConnectionInfo {
    pub fn plaintext() -> Self {
        Self::default()
    }

    pub fn tls(server_name: Option<String>) -> Self {
        Self {
            tls: true,
            tls_server_name: server_name,
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.tls, &self.tls_server_name) {
            (false, _) => write!(f, "plaintext"),
            (true, Some(name)) => write!(f, "tls sni={}", name),
            (true, None) => write!(f, "tls"),
        }
    }
}

/// Everything a request handler needs
pub struct GatewayState {
    pub cache: Cache,
    pub origin: OriginClient,
    pub dialer: LoopbackDialer,
    pub cache_writes: InFlightWrites,
}

/// Caching MITM proxy
pub struct ProxyServer {
    options: ProxyOptions,
    cache: Cache,
    origin: OriginClient,
    tls_acceptor: TlsAcceptor,
    cache_writes: InFlightWrites,
}

impl ProxyServer {
    /// Create a proxy storing into `driver` and presenting `tls_config` on
    /// intercepted tunnels
    pub fn new(
        options: ProxyOptions,
        driver: Arc<dyn StorageDriver>,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> Result<Self> {
        options.cache.validate().map_err(ProxyError::ConfigError)?;
        if options.request_timeout.is_zero() {
            return Err(ProxyError::ConfigError(
                "request_timeout must be greater than zero".to_string(),
            ));
        }

        info!(
            "Proxy configured: listen={}, loopback={}, storage={}",
            options.listen_addr,
            options.loopback,
            driver.scheme()
        );

        let cache = Cache::new(driver, options.cache.clone());
        let origin = OriginClient::new(Arc::clone(&options.origin_tls), options.request_timeout);

        Ok(Self {
            options,
            cache,
            origin,
            tls_acceptor: TlsAcceptor::from(tls_config),
            cache_writes: InFlightWrites::new(),
        })
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Cache writes started by this proxy and not finished yet
    pub fn cache_writes(&self) -> InFlightWrites {
        self.cache_writes.clone()
    }

    /// Bind the TCP listener and the loopback TLS endpoint
    pub async fn bind(&self) -> Result<BoundProxy> {
        let tcp = TcpListener::bind(self.options.listen_addr)
            .await
            .map_err(|e| {
                ProxyError::ConnectionError(format!(
                    "Failed to bind {}: {}",
                    self.options.listen_addr, e
                ))
            })?;
        let local_addr = tcp.local_addr()?;
        let (loopback, dialer) = self.options.loopback.bind()?;

        info!("Proxy listening on {}", local_addr);

        Ok(BoundProxy {
            tcp,
            local_addr,
            loopback,
            tls_acceptor: self.tls_acceptor.clone(),
            state: Arc::new(GatewayState {
                cache: self.cache.clone(),
                origin: self.origin.clone(),
                dialer,
                cache_writes: self.cache_writes.clone(),
            }),
        })
    }

    /// Bind and serve until shutdown
    pub async fn listen(&self, shutdown_signal: ShutdownSignal) -> Result<()> {
        self.bind().await?.serve(shutdown_signal).await
    }
}

/// A proxy whose listeners are bound
pub struct BoundProxy {
    tcp: TcpListener,
    local_addr: SocketAddr,
    loopback: LoopbackListener,
    tls_acceptor: TlsAcceptor,
    state: Arc<GatewayState>,
}

impl BoundProxy {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept on both entry points until the shutdown signal fires
    ///
    /// Connections already being served keep running; the loopback endpoint
    /// is closed when this returns.
    pub async fn serve(self, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        let BoundProxy {
            tcp,
            local_addr,
            mut loopback,
            tls_acceptor,
            state,
        } = self;

        loop {
            tokio::select! {
                accept_result = tcp.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("Proxy connection from {}", addr);
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }
                            let state = Arc::clone(&state);
                            tokio::spawn(serve_plaintext(stream, addr, state));
                        }
                        Err(e) => {
                            error!("Failed to accept proxy connection: {}", e);
                        }
                    }
                }
                accept_result = loopback.accept() => {
                    match accept_result {
                        Ok(stream) => {
                            let acceptor = tls_acceptor.clone();
                            let state = Arc::clone(&state);
                            tokio::spawn(serve_tls(stream, acceptor, state));
                        }
                        Err(e) => {
                            error!("Failed to accept loopback connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("Proxy received shutdown signal, stopping accept loops");
                    break;
                }
            }
        }

        drop(loopback);
        info!(
            "Proxy on {} stopped ({} cache writes still running)",
            local_addr,
            state.cache_writes.count()
        );
        Ok(())
    }
}

async fn serve_plaintext(stream: TcpStream, addr: SocketAddr, state: Arc<GatewayState>) {
    serve_connection(stream, addr.to_string(), ConnectionInfo::plaintext(), state).await
}

async fn serve_tls(stream: LoopbackStream, acceptor: TlsAcceptor, state: Arc<GatewayState>) {
    match acceptor.accept(stream).await {
        Ok(tls_stream) => {
            let server_name = tls_stream.get_ref().1.server_name().map(str::to_string);
            let info = ConnectionInfo::tls(server_name);
            debug!("Intercepted tunnel established ({})", info);
            serve_connection(tls_stream, "loopback".to_string(), info, state).await
        }
        Err(e) => {
            warn!("TLS handshake on intercepted tunnel failed: {}", e);
        }
    }
}

/// Serve HTTP/1.1 on one connection
async fn serve_connection<I>(io: I, peer: String, info: ConnectionInfo, state: Arc<GatewayState>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let info = info.clone();
        let state = Arc::clone(&state);
        async move { handle_request(req, info, state).await }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        let err_str = err.to_string();
        if err.is_incomplete_message()
            || err.is_canceled()
            || err_str.contains("connection closed")
            || err_str.contains("broken pipe")
            || err_str.contains("reset by peer")
        {
            debug!("Client disconnected from {}: {}", peer, err);
        } else {
            error!("Error serving connection from {}: {}", peer, err);
        }
    }
}

/// Handle one request from either entry point
pub async fn handle_request(
    req: Request<Incoming>,
    info: ConnectionInfo,
    state: Arc<GatewayState>,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let span = info_span!("request", id = %request_id, method = %method);

    let response = async move {
        match method {
            Method::GET => handle_get(req, &info, &state, &request_id).await,
            Method::CONNECT => handle_connect(req, &state, &request_id).await,
            _ => {
                debug!("Rejecting {} {}", method, req.uri());
                let mut response = error_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "method not allowed",
                    &request_id,
                );
                response
                    .headers_mut()
                    .insert(ALLOW, HeaderValue::from_static("GET, CONNECT"));
                response
            }
        }
    }
    .instrument(span)
    .await;

    Ok(response)
}

async fn handle_get(
    req: Request<Incoming>,
    info: &ConnectionInfo,
    state: &GatewayState,
    request_id: &str,
) -> Response<ProxyBody> {
    let start_time = Instant::now();

    let url = match target_url(&req, info) {
        Ok(url) => url,
        Err(e) => {
            warn!("Cannot build outbound URL for {}: {}", req.uri(), e);
            return error_response(StatusCode::BAD_REQUEST, &e.to_string(), request_id);
        }
    };
    let url_str = url.to_string();

    match state.cache.read(&url_str).await {
        Ok(cached) => match serve_cached(cached).await {
            Ok(response) => {
                log_get(&url_str, "HIT", response.status(), start_time);
                return response;
            }
            Err(e) => warn!("Cached copy unreadable, fetching from origin: {}", e),
        },
        Err(ProxyError::CacheMiss { .. }) => {}
        Err(e) => warn!("Cache lookup failed, fetching from origin: {}", e),
    }

    let response = fetch_from_origin(&url, &url_str, req.headers(), state, request_id).await;
    log_get(&url_str, "MISS", response.status(), start_time);
    response
}

fn log_get(url: &str, cache_result: &str, status: StatusCode, start_time: Instant) {
    info!(
        "GET {} cache={} status={} elapsed={:?}",
        url,
        cache_result,
        status.as_u16(),
        start_time.elapsed()
    );
}

/// Build the origin URL for an intercepted or proxied GET
///
/// Requests from the TLS endpoint go to `https://<sni><path>`, falling back
/// to the `Host` header when no SNI was sent. Plaintext requests use an
/// absolute-form target as is, or `http://<host><path>` for origin-form.
pub fn target_url<B>(req: &Request<B>, info: &ConnectionInfo) -> Result<Uri> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    if info.tls {
        let host = match &info.tls_server_name {
            Some(name) => name.clone(),
            None => host_header(req)?,
        };
        return build_url("https", &host, path_and_query);
    }

    if req.uri().scheme().is_some() && req.uri().authority().is_some() {
        return Ok(req.uri().clone());
    }

    let host = host_header(req)?;
    build_url("http", &host, path_and_query)
}

fn host_header<B>(req: &Request<B>) -> Result<String> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProxyError::InvalidRequest("request has no host".to_string()))
}

fn build_url(scheme: &str, host: &str, path_and_query: &str) -> Result<Uri> {
    Uri::builder()
        .scheme(scheme)
        .authority(host)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid target {}://{}: {}", scheme, host, e)))
}

/// Stream a committed blob to the client
///
/// The first chunk is read before the response is built, so a blob that
/// cannot be read at all still falls back to the origin. A failure after
/// that ends the body with an error.
async fn serve_cached(mut cached: CachedBody) -> Result<Response<ProxyBody>> {
    let len = cached.len();
    let first = match cached.next_chunk().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(e)) => return Err(e),
        None => None,
    };
    debug!("Serving {} bytes from cache key {}", len, cached.key());

    let key = cached.key().to_string();
    let chunks = stream::iter(first.map(Ok))
        .chain(cached.into_stream())
        .inspect_err(move |e| warn!("Cached body for key {} failed mid-stream: {}", key, e))
        .map_ok(Frame::data);

    let mut response = Response::new(StreamBody::new(chunks).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
    Ok(response)
}

async fn fetch_from_origin(
    url: &Uri,
    url_str: &str,
    client_headers: &HeaderMap,
    state: &GatewayState,
    request_id: &str,
) -> Response<ProxyBody> {
    let origin_response = match state.origin.get(url, client_headers).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Origin fetch failed for {}: {}", url, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string(), request_id);
        }
    };

    let status = origin_response.status();
    if status != StatusCode::OK {
        let message = origin_error_message(origin_response, state.origin.request_timeout()).await;
        debug!("Origin answered {} for {}: {}", status, url, message);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &message, request_id);
    }

    let (parts, incoming) = origin_response.into_parts();
    let expected_len = incoming.size_hint().exact();

    let guard = state.cache_writes.track();
    let (tee, outcome) = state.cache.tee(url_str, BodyStream::new(incoming)).await;
    let tee = tee.with_expected_len(expected_len);
    let url_owned = url_str.to_string();
    tokio::spawn(async move {
        let _guard = guard;
        match outcome.await {
            Ok(outcome) => debug!("Cache write for {} finished: {}", url_owned, outcome),
            Err(e) => error!("Cache write task for {} failed: {}", url_owned, e),
        }
    });

    let body = StreamBody::new(tee.map_err(ProxyError::from)).boxed_unsync();
    let mut response = Response::new(body);
    *response.headers_mut() = without_hop_by_hop(&parts.headers);
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static("MISS"));
    response
}

/// Text reported to the client for a non-200 origin response: the origin
/// body when it has more than one byte, otherwise the status line
async fn origin_error_message(response: Response<Incoming>, timeout: Duration) -> String {
    let status = response.status();
    let status_line = status.to_string();

    match tokio::time::timeout(timeout, response.into_body().collect()).await {
        Ok(Ok(collected)) => {
            let body = collected.to_bytes();
            if body.len() > 1 {
                String::from_utf8_lossy(&body).into_owned()
            } else {
                status_line
            }
        }
        Ok(Err(e)) => {
            debug!("Failed to read origin error body: {}", e);
            status_line
        }
        Err(_) => {
            debug!("Timed out reading origin error body");
            status_line
        }
    }
}

const HOP_BY_HOP: [HeaderName; 7] = [
    CONNECTION,
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Copy of `headers` without hop-by-hop headers, including any named in
/// `Connection`
pub fn without_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let hop_by_hop = HOP_BY_HOP.contains(name)
            || name.as_str() == "keep-alive"
            || listed.iter().any(|listed| listed == name.as_str());
        if !hop_by_hop {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

async fn handle_connect(
    mut req: Request<Incoming>,
    state: &GatewayState,
    request_id: &str,
) -> Response<ProxyBody> {
    let target = req.uri().to_string();

    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        warn!("CONNECT {} on a connection without upgrade support", target);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, HIJACK_UNSUPPORTED, request_id);
    };

    let loopback = match state.dialer.dial().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("CONNECT {}: loopback dial failed: {}", target, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string(), request_id);
        }
    };

    info!("CONNECT {} intercepted", target);
    tokio::spawn(
        async move {
            match on_upgrade.await {
                Ok(upgraded) => splice(TokioIo::new(upgraded), loopback).await,
                Err(e) => warn!("CONNECT upgrade failed: {}", e),
            }
        }
        .instrument(info_span!("tunnel", target = %target)),
    );

    let mut response = Response::new(empty_body());
    *response.version_mut() = req.version();
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(CONNECTION_ESTABLISHED));
    response
}

/// Relay bytes both ways until either side is done, then drop both
pub async fn splice<A, B>(client: A, loopback: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut loopback_read, mut loopback_write) = tokio::io::split(loopback);

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut loopback_write) => match result {
            Ok(bytes) => debug!("Client closed tunnel after sending {} bytes", bytes),
            Err(e) => debug!("Tunnel client side ended: {}", e),
        },
        result = tokio::io::copy(&mut loopback_read, &mut client_write) => match result {
            Ok(bytes) => debug!("Endpoint closed tunnel after sending {} bytes", bytes),
            Err(e) => debug!("Tunnel endpoint side ended: {}", e),
        },
    }
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Plain text error response carrying the request id
fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response<ProxyBody> {
    let text = format!("{}\n", message);
    let len = text.len();
    let body = Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed_unsync();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(target: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(Method::GET).uri(target);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_tls_request_uses_sni() {
        let req = get("/pkg/-/pkg-1.0.0.tgz?x=1", Some("ignored.example:8443"));
        let info = ConnectionInfo::tls(Some("registry.example.org".to_string()));
        assert_eq!(
            target_url(&req, &info).unwrap().to_string(),
            "https://registry.example.org/pkg/-/pkg-1.0.0.tgz?x=1"
        );
    }

    #[test]
    fn test_tls_request_without_sni_uses_host() {
        let req = get("/simple/", Some("pypi.example.org"));
        let info = ConnectionInfo::tls(None);
        assert_eq!(
            target_url(&req, &info).unwrap().to_string(),
            "https://pypi.example.org/simple/"
        );
    }

    #[test]
    fn test_plaintext_absolute_form_is_kept() {
        let req = get("http://mirror.example.org:8080/a/b?c=d", Some("other.example"));
        assert_eq!(
            target_url(&req, &ConnectionInfo::plaintext()).unwrap().to_string(),
            "http://mirror.example.org:8080/a/b?c=d"
        );
    }

    #[test]
    fn test_plaintext_origin_form_uses_host() {
        let req = get("/a/b", Some("mirror.example.org"));
        assert_eq!(
            target_url(&req, &ConnectionInfo::plaintext()).unwrap().to_string(),
            "http://mirror.example.org/a/b"
        );
    }

    #[test]
    fn test_missing_host_is_rejected() {
        let req = get("/a/b", None);
        assert!(matches!(
            target_url(&req, &ConnectionInfo::plaintext()),
            Err(ProxyError::InvalidRequest(_))
        ));
        assert!(matches!(
            target_url(&req, &ConnectionInfo::tls(None)),
            Err(ProxyError::InvalidRequest(_))
        ));

        let req = get("/a/b", Some("bad host"));
        assert!(target_url(&req, &ConnectionInfo::plaintext()).is_err());
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let filtered = without_hop_by_hop(&headers);
        assert_eq!(filtered[CONTENT_TYPE], "application/octet-stream");
        assert_eq!(filtered[CONTENT_LENGTH], "42");
        assert_eq!(filtered.get_all("set-cookie").iter().count(), 2);
        assert!(filtered.get(CONNECTION).is_none());
        assert!(filtered.get("keep-alive").is_none());
        assert!(filtered.get("x-trace").is_none());
        assert!(filtered.get(TRANSFER_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = error_response(StatusCode::INTERNAL_SERVER_ERROR, "404 Not Found", "req-1");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(response.headers()[X_REQUEST_ID], "req-1");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"404 Not Found\n");
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.server.port = 9100;
        config.server.bind_address = "127.0.0.1".to_string();
        let options = ProxyOptions::from_config(&config).unwrap();
        assert_eq!(options.listen_addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(options.loopback, LoopbackAddr::default_unix(9100));

        config.server.loopback = LoopbackMode::Memory;
        let options = ProxyOptions::from_config(&config).unwrap();
        assert_eq!(options.loopback, LoopbackAddr::Memory);

        config.server.bind_address = "not an address".to_string();
        assert!(matches!(
            ProxyOptions::from_config(&config),
            Err(ProxyError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_splice_relays_both_ways() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (endpoint, mut endpoint_peer) = tokio::io::duplex(1024);
        let relay = tokio::spawn(splice(client, endpoint));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        endpoint_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        endpoint_peer.write_all(b"pong").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_peer);
        relay.await.unwrap();
        let mut rest = Vec::new();
        endpoint_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
