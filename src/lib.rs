//! cache-proxy - caching MITM forward proxy
//!
//! Intercepts HTTP and tunnelled HTTPS `GET` traffic and keeps a write-through
//! copy of every successful response in a pluggable blob store, keyed by URL.

pub mod bytefmt;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs_storage;
pub mod logging;
pub mod loopback;
pub mod mem_storage;
pub mod origin_client;
pub mod origin_connector;
pub mod proxy;
pub mod shutdown;
pub mod storage;
pub mod tee_stream;
pub mod tls;

pub use error::{ProxyError, Result};
