//! Origin Client Module
//!
//! Pooled HTTP/1.1 client used to fetch cache misses from origin servers.

use crate::origin_connector::OriginConnector;
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, ACCEPT, HOST, USER_AGENT};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Client headers copied onto origin requests. Everything else stays behind,
/// so cached bodies are identity-encoded and never fetched with one
/// client's credentials.
pub const FORWARDED_HEADERS: [HeaderName; 2] = [USER_AGENT, ACCEPT];

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// HTTP client for origin fetches
#[derive(Clone)]
pub struct OriginClient {
    client: Client<OriginConnector, Empty<Bytes>>,
    request_timeout: Duration,
}

impl OriginClient {
    pub fn new(tls_config: Arc<rustls::ClientConfig>, request_timeout: Duration) -> Self {
        let connector = OriginConnector::new(tls_config, request_timeout);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Self {
            client,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Issue a GET for `url` and wait for the response head
    ///
    /// `client_headers` are the headers of the intercepted request; only
    /// [`FORWARDED_HEADERS`] are copied.
    pub async fn get(&self, url: &Uri, client_headers: &HeaderMap) -> Result<Response<Incoming>> {
        let request = build_origin_request(url, client_headers)?;
        debug!("Fetching from origin: {}", url);

        tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| {
                ProxyError::TimeoutError(format!(
                    "Origin did not respond within {:?}: {}",
                    self.request_timeout, url
                ))
            })?
            .map_err(ProxyError::from)
    }
}

fn build_origin_request(url: &Uri, client_headers: &HeaderMap) -> Result<Request<Empty<Bytes>>> {
    let authority = url
        .authority()
        .ok_or_else(|| ProxyError::InvalidRequest(format!("No host in URL {}", url)))?;

    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(url.clone())
        .header(HOST, authority.as_str());

    for name in FORWARDED_HEADERS.iter() {
        for value in client_headers.get_all(name) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Empty::new())
        .map_err(|e| ProxyError::InvalidRequest(format!("Failed to build origin request: {}", e)))
}
