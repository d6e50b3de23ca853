//! Configuration management for bMINTY services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Bulk import configuration
    #[serde(default)]
    pub import: ImportConfig,

    /// Job status store configuration
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Export configuration
    #[serde(default)]
    pub export: ExportConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds (not applied to uploads and downloads)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Body limit for multipart uploads
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How long a connection waits on a locked database
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Where restore backups are written (defaults to the database directory)
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImportConfig {
    /// Rows between job status updates
    #[serde(default = "default_progress_interval")]
    pub progress_interval_rows: usize,

    /// Rows per multi-row signal INSERT
    #[serde(default = "default_signal_batch_size")]
    pub signal_batch_size: usize,

    /// Parsed batches buffered between the reader thread and the writer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Staging directory for uploaded files
    pub upload_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobsConfig {
    /// Lifetime of a terminal job nobody has polled
    #[serde(default = "default_completed_ttl")]
    pub completed_ttl_secs: u64,

    /// Lifetime of a terminal job after its first terminal read
    #[serde(default = "default_observed_grace")]
    pub observed_grace_secs: u64,

    /// Non-terminal jobs without updates for this long are dropped
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Sweeper period
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExportConfig {
    /// Scratch directory for export artifacts
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_upload_bytes() -> u64 { 20 * 1024 * 1024 * 1024 }
fn default_database_path() -> PathBuf { PathBuf::from("db.sqlite3") }
fn default_max_connections() -> u32 { 16 }
fn default_min_connections() -> u32 { 1 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_busy_timeout() -> u64 { 30_000 }
fn default_progress_interval() -> usize { 5_000 }
fn default_signal_batch_size() -> usize { 500 }
fn default_channel_capacity() -> usize { 8 }
fn default_completed_ttl() -> u64 { 3_600 }
fn default_observed_grace() -> u64 { 300 }
fn default_stale_after() -> u64 { 86_400 }
fn default_sweep_interval() -> u64 { 60 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "bminty".to_string() }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__DATABASE__PATH=/data/db.sqlite3
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Directory for restore backups
    pub fn backup_dir(&self) -> PathBuf {
        match &self.database.backup_dir {
            Some(dir) => dir.clone(),
            None => self
                .database
                .path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Directory for staged uploads
    pub fn upload_dir(&self) -> PathBuf {
        self.import.upload_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Directory for export scratch files
    pub fn export_dir(&self) -> PathBuf {
        self.export.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            busy_timeout_ms: default_busy_timeout(),
            backup_dir: None,
        }
    }
}

impl DatabaseConfig {
    /// Configuration for a database file with every other setting defaulted
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            progress_interval_rows: default_progress_interval(),
            signal_batch_size: default_signal_batch_size(),
            channel_capacity: default_channel_capacity(),
            upload_dir: None,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            completed_ttl_secs: default_completed_ttl(),
            observed_grace_secs: default_observed_grace(),
            stale_after_secs: default_stale_after(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.jobs.completed_ttl_secs, 3600);
        assert_eq!(config.import.signal_batch_size, 500);
    }

    #[test]
    fn test_backup_dir_fallback() {
        let mut config = AppConfig::default();
        assert_eq!(config.backup_dir(), PathBuf::from("."));

        config.database.path = PathBuf::from("/data/bminty/db.sqlite3");
        assert_eq!(config.backup_dir(), PathBuf::from("/data/bminty"));

        config.database.backup_dir = Some(PathBuf::from("/backups"));
        assert_eq!(config.backup_dir(), PathBuf::from("/backups"));
    }

    #[test]
    fn test_empty_sources_deserialize_to_defaults() {
        let config: AppConfig = Config::builder()
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap();
        assert_eq!(config.database.path, PathBuf::from("db.sqlite3"));
        assert_eq!(config.observability.service_name, "bminty");
    }
}
