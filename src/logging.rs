//! Logging Module
//!
//! Application logging through `tracing`: a compact console layer and, when
//! `app_log_dir` is configured, a daily rolling file under
//! `<app_log_dir>/<hostname>/cache-proxy.log`.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_NAME: &str = "cache-proxy.log";

/// Host name used to partition log directories
pub fn get_hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// Logger manager for application logging
pub struct LoggerManager {
    pub config: LoggingConfig,
    hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Directory of this host's log files, if file logging is enabled
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.config
            .app_log_dir
            .as_ref()
            .map(|dir| dir.join(&self.hostname))
    }

    /// Install the global subscriber
    ///
    /// `RUST_LOG` overrides the configured level. An already installed
    /// subscriber is left in place.
    pub fn initialize(&self) -> Result<()> {
        let file_layer = match self.host_log_dir() {
            Some(host_log_dir) => {
                std::fs::create_dir_all(&host_log_dir).map_err(|e| {
                    ProxyError::IoError(format!("Failed to create app log directory: {}", e))
                })?;

                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, host_log_dir, LOG_FILE_NAME);

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_line_number(true)
                        .with_level(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(()) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if let Some(dir) = self.host_log_dir() {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                // Already initialized, likely in tests
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }

    /// Remove rotated log files older than `keep_days`
    pub fn cleanup_old_logs(&self, keep_days: u32) -> Result<usize> {
        match self.host_log_dir() {
            Some(dir) => {
                let cutoff = SystemTime::now() - Duration::from_secs(keep_days as u64 * 24 * 3600);
                Ok(remove_files_older_than(&dir, cutoff))
            }
            None => Ok(0),
        }
    }
}

fn remove_files_older_than(dir: &Path, cutoff: SystemTime) -> usize {
    let mut removed = 0;
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        match metadata.modified() {
            Ok(modified) if modified < cutoff => match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("Removed old log file: {:?}", entry.path());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove old log file {:?}: {}", entry.path(), e),
            },
            _ => {}
        }
    }
    removed
}
