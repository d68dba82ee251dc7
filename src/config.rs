//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Sources are applied in order: defaults, YAML file (`--config`), environment, CLI flags.

use crate::{ProxyError, Result};
use clap::{Arg, Command};
use serde::{Deserialize, Serialize};

use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Custom deserializers for paths that expand ~ to the home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.filter(|s| !s.is_empty()).map(|s| expand_tilde(&s)))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "s" | "sec" | "secs" | "second" | "seconds" | "" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub cache: CachePipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Bound on reaching an origin and receiving its response head
    #[serde(
        with = "duration_serde",
        default = "default_request_timeout"
    )]
    pub request_timeout: Duration,
    /// Transport between the CONNECT handler and the TLS endpoint
    #[serde(default)]
    pub loopback: LoopbackMode,
    /// Unix socket path; defaults to `/tmp/cache-proxy_<port>.sock`
    #[serde(default, deserialize_with = "pathbuf_serde::deserialize_option")]
    pub loopback_socket: Option<PathBuf>,
}

fn default_port() -> u16 {
    8999
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            request_timeout: default_request_timeout(),
            loopback: LoopbackMode::default(),
            loopback_socket: None,
        }
    }
}

/// Loopback transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopbackMode {
    #[default]
    #[serde(rename = "unix")]
    Unix,
    #[serde(rename = "memory")]
    Memory,
}

impl std::str::FromStr for LoopbackMode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "unix" => Ok(LoopbackMode::Unix),
            "memory" | "mem" => Ok(LoopbackMode::Memory),
            other => Err(ProxyError::ConfigError(format!(
                "Unknown loopback mode '{}', expected 'unix' or 'memory'",
                other
            ))),
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `mem` or `fs://<path>?limit=<quantity>`
    #[serde(default = "default_storage_uri")]
    pub uri: String,
}

fn default_storage_uri() -> String {
    "mem".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uri: default_storage_uri(),
        }
    }
}

/// Certificate presented by the TLS endpoint for every server name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default, deserialize_with = "pathbuf_serde::deserialize_option")]
    pub cert_path: Option<PathBuf>,
    #[serde(default, deserialize_with = "pathbuf_serde::deserialize_option")]
    pub key_path: Option<PathBuf>,
}

/// Write-through cache pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePipelineConfig {
    /// Chunk size of both the cached blob reader and the write-through queue
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Chunks buffered between the client stream and the storage writer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Single wait granted to a full queue before the cache copy is abandoned
    #[serde(with = "duration_serde", default = "default_retry_wait")]
    pub retry_wait: Duration,
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_retry_wait() -> Duration {
    Duration::from_secs(1)
}

impl Default for CachePipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            queue_capacity: default_queue_capacity(),
            retry_wait: default_retry_wait(),
        }
    }
}

impl CachePipelineConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.chunk_size == 0 {
            return Err("cache chunk_size must be greater than zero".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("cache queue_capacity must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling application log; console only when unset
    #[serde(default, deserialize_with = "pathbuf_serde::deserialize_option")]
    pub app_log_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_log_dir: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Load configuration from already parsed CLI arguments
    pub fn from_matches(matches: &clap::ArgMatches) -> Result<Self> {
        let mut config = Self::default();

        // Load from config file if specified
        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        config.apply_env_overrides()?;
        config.apply_cli_overrides(matches)?;
        config.validate()?;

        Ok(config)
    }

    /// Log the effective settings; call once logging is initialized
    pub fn log_summary(&self) {
        info!(
            "Configuration loaded: port={}, storage={}, loopback={:?}, request_timeout={}s",
            self.server.port,
            self.storage.uri,
            self.server.loopback,
            self.server.request_timeout.as_secs_f64()
        );
        debug!("Configuration: {:?}", self);
    }

    /// Build CLI argument parser
    pub fn build_cli() -> Command {
        Command::new("cache-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Caching HTTP/HTTPS forward proxy with TLS interception")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("Proxy listen port (default: 8999)"),
            )
            .arg(
                Arg::new("bind-address")
                    .long("bind-address")
                    .value_name("ADDR")
                    .help("Proxy listen address (default: 0.0.0.0)"),
            )
            .arg(
                Arg::new("storage")
                    .short('s')
                    .long("storage")
                    .value_name("URI")
                    .help("Storage URI: mem or fs://<path>?limit=4GB (default: mem)"),
            )
            .arg(
                Arg::new("tls-cert")
                    .long("tls-cert")
                    .value_name("FILE")
                    .help("PEM certificate chain presented to intercepted clients"),
            )
            .arg(
                Arg::new("tls-key")
                    .long("tls-key")
                    .value_name("FILE")
                    .help("PEM private key matching --tls-cert"),
            )
            .arg(
                Arg::new("loopback")
                    .long("loopback")
                    .value_name("MODE")
                    .help("TLS endpoint transport: unix (default) or memory"),
            )
            .arg(
                Arg::new("loopback-socket")
                    .long("loopback-socket")
                    .value_name("PATH")
                    .help("Unix socket path for the TLS endpoint"),
            )
            .arg(
                Arg::new("request-timeout")
                    .long("request-timeout")
                    .value_name("DURATION")
                    .help("Origin fetch timeout, e.g. 30s or 2m (default: 30s)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level: trace, debug, info, warn, error (default: info)"),
            )
            .arg(
                Arg::new("app-log-dir")
                    .long("app-log-dir")
                    .value_name("DIR")
                    .help("Directory for the rolling application log"),
            )
    }

    /// Load configuration from a YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("PROXY_PORT") {
            self.server.port = parse_port(&port)?;
        }

        if let Ok(uri) = std::env::var("STORAGE_URI") {
            self.storage.uri = uri;
        }

        if let Ok(cert) = std::env::var("TLS_CERT") {
            self.tls.cert_path = Some(pathbuf_serde::expand_tilde(&cert));
        }

        if let Ok(key) = std::env::var("TLS_KEY") {
            self.tls.key_path = Some(pathbuf_serde::expand_tilde(&key));
        }

        if let Ok(loopback) = std::env::var("LOOPBACK") {
            self.server.loopback = loopback.parse()?;
        }

        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            self.logging.log_level = log_level;
        }

        if let Ok(app_log_dir) = std::env::var("APP_LOG_DIR") {
            self.logging.app_log_dir = Some(pathbuf_serde::expand_tilde(&app_log_dir));
        }

        Ok(())
    }

    /// Apply command line argument overrides
    pub fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) -> Result<()> {
        if let Some(port) = matches.get_one::<String>("port") {
            self.server.port = parse_port(port)?;
        }

        if let Some(bind_address) = matches.get_one::<String>("bind-address") {
            self.server.bind_address = bind_address.clone();
        }

        if let Some(uri) = matches.get_one::<String>("storage") {
            self.storage.uri = uri.clone();
        }

        if let Some(cert) = matches.get_one::<String>("tls-cert") {
            self.tls.cert_path = Some(pathbuf_serde::expand_tilde(cert));
        }

        if let Some(key) = matches.get_one::<String>("tls-key") {
            self.tls.key_path = Some(pathbuf_serde::expand_tilde(key));
        }

        if let Some(loopback) = matches.get_one::<String>("loopback") {
            self.server.loopback = loopback.parse()?;
        }

        if let Some(socket) = matches.get_one::<String>("loopback-socket") {
            self.server.loopback_socket = Some(pathbuf_serde::expand_tilde(socket));
        }

        if let Some(timeout) = matches.get_one::<String>("request-timeout") {
            self.server.request_timeout = duration_serde::parse_duration(timeout)
                .map_err(|e| ProxyError::ConfigError(format!("Invalid request timeout: {}", e)))?;
        }

        if let Some(log_level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = log_level.clone();
        }

        if let Some(app_log_dir) = matches.get_one::<String>("app-log-dir") {
            self.logging.app_log_dir = Some(pathbuf_serde::expand_tilde(app_log_dir));
        }

        Ok(())
    }

    /// Check the settings the proxy cannot start without
    pub fn validate(&self) -> Result<()> {
        if self.tls.cert_path.is_none() || self.tls.key_path.is_none() {
            return Err(ProxyError::ConfigError(
                "TLS certificate and key are required (--tls-cert/--tls-key or TLS_CERT/TLS_KEY)"
                    .to_string(),
            ));
        }

        if self.server.request_timeout.is_zero() {
            return Err(ProxyError::ConfigError(
                "server request_timeout must be greater than zero".to_string(),
            ));
        }

        if self.storage.uri.trim().is_empty() {
            return Err(ProxyError::ConfigError("storage uri must not be empty".to_string()));
        }

        self.cache.validate().map_err(|e| {
            ProxyError::ConfigError(format!("Invalid cache configuration: {}", e))
        })?;

        Ok(())
    }

    /// Unix socket path of the TLS endpoint
    pub fn loopback_socket_path(&self) -> PathBuf {
        self.server.loopback_socket.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("cache-proxy_{}.sock", self.server.port))
        })
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|e| ProxyError::ConfigError(format!("Invalid port '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tls_config() -> TlsConfig {
        TlsConfig {
            cert_path: Some(PathBuf::from("/etc/cache-proxy/cert.pem")),
            key_path: Some(PathBuf::from("/etc/cache-proxy/key.pem")),
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8999);
        assert_eq!(config.server.request_timeout, Duration::from_secs(30));
        assert_eq!(config.server.loopback, LoopbackMode::Unix);
        assert_eq!(config.storage.uri, "mem");
        assert_eq!(config.cache.chunk_size, 65536);
        assert_eq!(config.cache.queue_capacity, 1024);
        assert_eq!(config.cache.retry_wait, Duration::from_secs(1));
        assert_eq!(config.logging.log_level, "info");
        assert!(config.logging.app_log_dir.is_none());
    }

    #[test]
    fn test_duration_parsing() {
        use duration_serde::parse_duration;
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10 fortnights").is_err());
    }

    #[test]
    fn test_yaml_parsing_with_partial_sections() {
        let yaml = r#"
server:
  port: 9100
  request_timeout: "2m"
  loopback: "memory"
storage:
  uri: "fs:///var/cache/proxy?limit=10GB"
tls:
  cert_path: "/etc/proxy/cert.pem"
  key_path: "/etc/proxy/key.pem"
cache:
  retry_wait: "250ms"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.request_timeout, Duration::from_secs(120));
        assert_eq!(config.server.loopback, LoopbackMode::Memory);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.storage.uri, "fs:///var/cache/proxy?limit=10GB");
        assert_eq!(config.tls.cert_path, Some(PathBuf::from("/etc/proxy/cert.pem")));
        assert_eq!(config.cache.retry_wait, Duration::from_millis(250));
        assert_eq!(config.cache.queue_capacity, 1024);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  port: 7000\nlogging:\n  log_level: debug").unwrap();

        let config = Config::load_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.logging.log_level, "debug");

        assert!(matches!(
            Config::load_from_file("/nonexistent/cache-proxy.yaml"),
            Err(ProxyError::ConfigError(_))
        ));
    }

    #[test]
    fn test_cli_overrides() {
        let matches = Config::build_cli()
            .try_get_matches_from([
                "cache-proxy",
                "--port",
                "9000",
                "--storage",
                "fs://./cache?limit=1GB",
                "--tls-cert",
                "/tmp/cert.pem",
                "--tls-key",
                "/tmp/key.pem",
                "--loopback",
                "memory",
                "--request-timeout",
                "5s",
            ])
            .unwrap();

        let mut config = Config::default();
        config.apply_cli_overrides(&matches).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.uri, "fs://./cache?limit=1GB");
        assert_eq!(config.tls.cert_path, Some(PathBuf::from("/tmp/cert.pem")));
        assert_eq!(config.server.loopback, LoopbackMode::Memory);
        assert_eq!(config.server.request_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_matches_leaves_logging_to_the_caller() {
        let matches = Config::build_cli()
            .try_get_matches_from([
                "cache-proxy",
                "--tls-cert",
                "/tmp/cert.pem",
                "--tls-key",
                "/tmp/key.pem",
            ])
            .unwrap();

        // Loading works before any subscriber exists
        let config = Config::from_matches(&matches).unwrap();
        assert_eq!(config.tls.key_path, Some(PathBuf::from("/tmp/key.pem")));

        crate::logging::LoggerManager::new(LoggingConfig::default(), "test-host".to_string())
            .initialize()
            .unwrap();
        config.log_summary();
    }

    #[test]
    fn test_cli_rejects_bad_values() {
        for args in [
            ["cache-proxy", "--port", "http"],
            ["cache-proxy", "--loopback", "pipe"],
            ["cache-proxy", "--request-timeout", "soon"],
        ] {
            let matches = Config::build_cli().try_get_matches_from(args).unwrap();
            let mut config = Config::default();
            assert!(
                matches!(
                    config.apply_cli_overrides(&matches),
                    Err(ProxyError::ConfigError(_))
                ),
                "expected {:?} to be rejected",
                args
            );
        }
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("PROXY_PORT", "8123");
        std::env::set_var("STORAGE_URI", "fs:///srv/cache");
        std::env::set_var("LOOPBACK", "memory");

        let mut config = Config::default();
        let result = config.apply_env_overrides();

        std::env::remove_var("PROXY_PORT");
        std::env::remove_var("STORAGE_URI");
        std::env::remove_var("LOOPBACK");

        result.unwrap();
        assert_eq!(config.server.port, 8123);
        assert_eq!(config.storage.uri, "fs:///srv/cache");
        assert_eq!(config.server.loopback, LoopbackMode::Memory);
    }

    #[test]
    fn test_validate_requires_tls_material() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ProxyError::ConfigError(_))));

        let mut config = Config {
            tls: tls_config(),
            ..Config::default()
        };
        assert!(config.validate().is_ok());

        config.cache.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loopback_socket_path() {
        let mut config = Config::default();
        config.server.port = 4321;
        assert_eq!(
            config.loopback_socket_path(),
            std::env::temp_dir().join("cache-proxy_4321.sock")
        );

        config.server.loopback_socket = Some(PathBuf::from("/run/proxy.sock"));
        assert_eq!(config.loopback_socket_path(), PathBuf::from("/run/proxy.sock"));
    }
}
