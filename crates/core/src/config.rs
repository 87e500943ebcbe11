//! Configuration types shared across crates.

use crate::carve::CarverBackend;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum accepted request body, in bytes, after decompression.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// Restrict it to scraper addresses at the network level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Interval between environment snapshot refreshes, in seconds.
    #[serde(default = "default_env_refresh_secs")]
    pub env_refresh_secs: u64,
    /// Secret used to derive node session keys (at least 32 bytes).
    /// When unset a random secret is generated at startup.
    /// Prefer FLEET_SERVER__NODE_KEY_SECRET over storing it in a file.
    #[serde(default)]
    pub node_key_secret: Option<String>,
    /// How long shutdown waits for background tasks, in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_body_size() -> usize {
    32 * 1024 * 1024
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_env_refresh_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_size: default_max_body_size(),
            metrics_enabled: default_metrics_enabled(),
            env_refresh_secs: default_env_refresh_secs(),
            node_key_secret: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ServerConfig {
    pub fn env_refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.env_refresh_secs)
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.env_refresh_secs == 0 {
            return Err("server.env_refresh_secs cannot be 0".to_string());
        }
        if self.max_body_size == 0 {
            return Err("server.max_body_size cannot be 0".to_string());
        }
        if let Some(secret) = &self.node_key_secret
            && secret.len() < crate::node::MIN_NODE_KEY_SECRET_LEN
        {
            return Err(format!(
                "server.node_key_secret must be at least {} bytes",
                crate::node::MIN_NODE_KEY_SECRET_LEN
            ));
        }
        Ok(())
    }
}

/// Object storage configuration (carved blocks and archives).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (testing and small fleets).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds. Advisory only: slow queries are logged,
        /// not cancelled. Use PostgreSQL when a hard limit is required.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over the individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer FLEET_METADATA__PASSWORD over storing it in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    20
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) => Ok(()),
                (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => {
                    Err("postgres config requires either 'url' or 'host' + 'database'".to_string())
                }
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// File carving configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CarverConfig {
    /// Where block bytes are stored.
    #[serde(default)]
    pub backend: CarverBackend,
    /// Largest block size an agent may declare, in bytes.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: u64,
    /// Reassemble the archive in the background once a carve completes.
    #[serde(default = "default_archive_on_complete")]
    pub archive_on_complete: bool,
}

fn default_max_block_size() -> u64 {
    8 * 1024 * 1024
}

fn default_archive_on_complete() -> bool {
    true
}

impl Default for CarverConfig {
    fn default() -> Self {
        Self {
            backend: CarverBackend::default(),
            max_block_size: default_max_block_size(),
            archive_on_complete: default_archive_on_complete(),
        }
    }
}

impl CarverConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_block_size == 0 {
            return Err("carver.max_block_size cannot be 0".to_string());
        }
        if self.max_block_size > i64::MAX as u64 {
            return Err(format!(
                "carver.max_block_size {} exceeds maximum value {}",
                self.max_block_size,
                i64::MAX
            ));
        }
        Ok(())
    }
}

/// Batched metadata writer configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Flush once this many distinct nodes are pending.
    #[serde(default = "default_writer_batch_size")]
    pub batch_size: usize,
    /// Flush at least this often, in seconds.
    #[serde(default = "default_writer_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Capacity of the event queue. Events beyond it are dropped.
    #[serde(default = "default_writer_buffer_size")]
    pub buffer_size: usize,
}

fn default_writer_batch_size() -> usize {
    50
}

fn default_writer_flush_interval_secs() -> u64 {
    60
}

fn default_writer_buffer_size() -> usize {
    2000
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_writer_batch_size(),
            flush_interval_secs: default_writer_flush_interval_secs(),
            buffer_size: default_writer_buffer_size(),
        }
    }
}

impl WriterConfig {
    pub fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.flush_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("writer.batch_size cannot be 0".to_string());
        }
        if self.buffer_size == 0 {
            return Err("writer.buffer_size cannot be 0".to_string());
        }
        // tokio::time::interval panics on a zero period.
        if self.flush_interval_secs == 0 {
            return Err("writer.flush_interval_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Distributed query dispatch configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Nodes not seen for this many hours are not targeted by environment
    /// or platform.
    #[serde(default = "default_inactive_hours")]
    pub inactive_hours: u64,
    /// Interval between expiration sweeps, in seconds.
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

fn default_inactive_hours() -> u64 {
    72
}

fn default_maintenance_interval_secs() -> u64 {
    60
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            inactive_hours: default_inactive_hours(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn inactive_window(&self) -> time::Duration {
        let hours = i64::try_from(self.inactive_hours).unwrap_or(i64::MAX / 3600);
        time::Duration::hours(hours.min(i64::MAX / 3600))
    }

    pub fn maintenance_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.maintenance_interval_secs == 0 {
            return Err("dispatch.maintenance_interval_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Destination for logs pushed by agents.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogSinkConfig {
    /// Discard logs after authentication.
    None,
    /// Write one JSON line per log entry to standard output.
    Stdout,
    /// Store logs in the metadata database.
    #[default]
    Db,
}

/// Rate limiting configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    #[serde(default)]
    pub enabled: bool,
    /// Requests per minute per client IP.
    #[serde(default = "default_ip_requests_per_minute")]
    pub ip_requests_per_minute: u32,
    /// Burst size (allows temporary burst above rate limit).
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Trusted proxy IP addresses/CIDR ranges.
    /// Only requests from these peers have X-Forwarded-For/X-Real-IP honored,
    /// both for limiting and for the node address recorded on check-in.
    /// Use ["*"] to trust all proxies (NOT recommended for production).
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Maximum number of tracked IPs before new ones are rejected.
    #[serde(default = "default_max_entries")]
    pub max_entries: u32,
    /// Interval in seconds between cleanup sweeps of stale entries.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Entries not accessed within this many seconds are evicted.
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,
}

fn default_ip_requests_per_minute() -> u32 {
    600
}

fn default_burst_size() -> u32 {
    50
}

fn default_max_entries() -> u32 {
    100_000
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_entry_ttl_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ip_requests_per_minute: default_ip_requests_per_minute(),
            burst_size: default_burst_size(),
            trusted_proxies: Vec::new(),
            max_entries: default_max_entries(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            entry_ttl_secs: default_entry_ttl_secs(),
        }
    }
}

impl RateLimitConfig {
    /// Validate rate limit configuration.
    /// Returns warnings for insecure-but-allowed settings.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.trusted_proxies.len() == 1 && self.trusted_proxies[0] == "*" {
            warnings.push(
                "rate_limit.trusted_proxies=['*'] trusts ALL forwarded headers. \
                 Clients can spoof the address recorded for their node and bypass limits."
                    .to_string(),
            );
        }

        if !self.enabled {
            return Ok(warnings);
        }

        if self.cleanup_interval_secs == 0 {
            return Err("rate_limit.cleanup_interval_secs cannot be 0".to_string());
        }
        if self.ip_requests_per_minute == 0 {
            return Err("rate_limit.ip_requests_per_minute cannot be 0".to_string());
        }

        if self.entry_ttl_secs < 120 {
            warnings.push(format!(
                "rate_limit.entry_ttl_secs={} is very short; entries may be evicted \
                 before limits reset. Recommended minimum: 120 seconds.",
                self.entry_ttl_secs
            ));
        }

        Ok(warnings)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub carver: CarverConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub log_sink: LogSinkConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage, SQLite metadata and
    /// a fixed node key secret.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig {
                node_key_secret: Some("test-node-key-secret-0123456789abcdef".to_string()),
                ..ServerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate every section, returning rate limit warnings on success.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        self.server.validate()?;
        self.metadata.validate()?;
        self.carver.validate()?;
        self.writer.validate()?;
        self.dispatch.validate()?;
        self.rate_limit.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_defaults() {
        let config = WriterConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.flush_interval_secs, 60);
        assert_eq!(config.buffer_size, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_writer_rejects_zero_interval() {
        let config = WriterConfig {
            flush_interval_secs: 0,
            ..WriterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_sink_tagged() {
        let sink: LogSinkConfig = serde_json::from_str(r#"{"type":"stdout"}"#).unwrap();
        assert_eq!(sink, LogSinkConfig::Stdout);
        assert_eq!(LogSinkConfig::default(), LogSinkConfig::Db);
    }

    #[test]
    fn test_carver_backend_from_json() {
        let config: CarverConfig = serde_json::from_str(r#"{"backend":"storage"}"#).unwrap();
        assert_eq!(config.backend, CarverBackend::Storage);
        assert!(config.archive_on_complete);
    }

    #[test]
    fn test_short_node_key_secret_rejected() {
        let config = ServerConfig {
            node_key_secret: Some("short".to_string()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(AppConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_postgres_requires_location() {
        let config: MetadataConfig = serde_json::from_str(r#"{"type":"postgres"}"#).unwrap();
        assert!(config.validate().is_err());
        let config: MetadataConfig =
            serde_json::from_str(r#"{"type":"postgres","url":"postgres://localhost/fleet"}"#)
                .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inactive_window() {
        let config = DispatchConfig::default();
        assert_eq!(config.inactive_window(), time::Duration::hours(72));
    }
}
