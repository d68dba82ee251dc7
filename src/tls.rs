//! TLS material
//!
//! PEM loading for the interception certificate and the rustls configs on
//! both sides of the proxy: the server config of the TLS endpoint that
//! terminates intercepted CONNECT tunnels, and the client config used to
//! reach `https` origins.

use crate::{ProxyError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ALPN_HTTP1: &[u8] = b"http/1.1";

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::TlsError(format!("Failed to open {}: {}", path.display(), e))
    })?;
    Ok(BufReader::new(file))
}

/// Read every certificate from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            ProxyError::TlsError(format!("Failed to parse certificates in {}: {}", path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(ProxyError::TlsError(format!(
            "No certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            ProxyError::TlsError(format!("Failed to parse private key in {}: {}", path.display(), e))
        })?
        .ok_or_else(|| ProxyError::TlsError(format!("No private key found in {}", path.display())))
}

/// Server config presenting one certificate chain for every server name
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(config)
}

/// Load the interception certificate and key and build the endpoint config
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = server_config(certs, key)?;
    info!(
        "Loaded interception certificate from {} (key {})",
        cert_path.display(),
        key_path.display()
    );
    Ok(Arc::new(config))
}

/// Client config for origin connections
///
/// Trusts the bundled webpki roots, the platform store when it can be read,
/// and `extra_roots`.
pub fn origin_client_config(extra_roots: Vec<CertificateDer<'static>>) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            debug!("Loaded {} platform root certificates ({} ignored)", added, ignored);
        }
        Err(e) => warn!("Platform root certificates unavailable: {}", e),
    }

    for cert in extra_roots {
        root_store.add(cert)?;
    }

    let mut config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(config)
}
