use cache_proxy::{
    config::Config,
    logging::{get_hostname, LoggerManager},
    proxy::{ProxyOptions, ProxyServer},
    shutdown::ShutdownCoordinator,
    storage::StorageRegistry,
    tls, ProxyError, Result,
};
use std::time::Duration;
use tracing::{error, info};

/// Time given to cache writes still running at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Rotated log files older than this are removed at startup
const LOG_RETENTION_DAYS: u32 = 7;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let logger = LoggerManager::new(config.logging.clone(), get_hostname());
    logger.initialize()?;
    match logger.cleanup_old_logs(LOG_RETENTION_DAYS) {
        Ok(0) => {}
        Ok(removed) => info!("Removed {} old log files", removed),
        Err(e) => error!("Failed to clean up old log files: {}", e),
    }

    info!(
        "Starting cache-proxy v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    config.log_summary();

    let registry = StorageRegistry::with_default_drivers();
    let driver = registry.open(&config.storage.uri)?;
    info!("Storage: {} ({})", config.storage.uri, driver.scheme());

    let (cert_path, key_path) = match (&config.tls.cert_path, &config.tls.key_path) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            return Err(ProxyError::ConfigError(
                "TLS certificate and key are required".to_string(),
            ))
        }
    };
    let tls_config = tls::load_server_config(cert_path, key_path)?;

    let options = ProxyOptions::from_config(&config)?;
    let proxy = ProxyServer::new(options, driver, tls_config)?;

    let mut shutdown_coordinator = ShutdownCoordinator::new(SHUTDOWN_TIMEOUT);
    shutdown_coordinator.set_cache_writes(proxy.cache_writes());
    let proxy_shutdown = shutdown_coordinator.subscribe();

    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Shutdown coordinator error: {}", e);
        }
    });

    // Bind failures end the process here
    proxy.listen(proxy_shutdown).await?;

    // Returns once pending cache writes have settled
    shutdown_task.await.ok();

    info!("cache-proxy shutdown complete");
    Ok(())
}
