//! Error Module
//!
//! Defines error types and result types used throughout the caching proxy.

use thiserror::Error;

/// Main error type for the caching proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Cache miss: url {url} key {key} not found")]
    CacheMiss { url: String, key: String },

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Unknown storage scheme: {0}")]
    UnknownScheme(String),

    #[error("Invalid byte quantity '{0}': byte quantity must be a positive number with a unit of measurement like M, MB, MiB, G, GiB, or GB")]
    InvalidByteQuantity(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        if err.is_connect() {
            ProxyError::ConnectionError(err.to_string())
        } else {
            ProxyError::HttpError(err.to_string())
        }
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::TlsError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::ConfigError(err.to_string())
    }
}

/// Result type alias for the caching proxy
pub type Result<T> = std::result::Result<T, ProxyError>;
