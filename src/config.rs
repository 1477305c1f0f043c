//! Configuration loading and types for the meta service.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every field has a default, so an empty file is a
//! valid single-node configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Meta store and consensus settings.
    #[serde(default)]
    pub meta: MetaConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Meta store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetaConfig {
    /// Root directory for the consensus log, snapshots and `node.json`.
    #[serde(default = "default_dir")]
    pub dir: String,

    /// Consensus transport bind address.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP API bind address.
    #[serde(default = "default_http_bind_address")]
    pub http_bind_address: String,

    /// Use `https://` when talking to other meta servers.
    #[serde(default)]
    pub https_enabled: bool,

    /// Emit store lifecycle logs at info level (debug otherwise).
    #[serde(default = "default_true")]
    pub logging_enabled: bool,

    /// HTTP addresses of existing meta servers to join on first start.
    #[serde(default)]
    pub join_peers: Vec<String>,

    /// How long a fresh consensus node waits before claiming leadership.
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Upper bound on a single `apply` round trip.
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// Log entries between consensus snapshots.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// First delay of the join retry backoff.
    #[serde(default = "default_join_retry_initial_ms")]
    pub join_retry_initial_ms: u64,

    /// Cap of the join retry backoff.
    #[serde(default = "default_join_retry_max_ms")]
    pub join_retry_max_ms: u64,

    /// How long `GET /snapshot?index=N` waits for a change.
    #[serde(default = "default_long_poll_timeout_ms")]
    pub long_poll_timeout_ms: u64,

    /// bcrypt cost for newly hashed passwords.
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
}

impl MetaConfig {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn join_retry_initial(&self) -> Duration {
        Duration::from_millis(self.join_retry_initial_ms)
    }

    pub fn join_retry_max(&self) -> Duration {
        Duration::from_millis(self.join_retry_max_ms)
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            bind_address: default_bind_address(),
            http_bind_address: default_http_bind_address(),
            https_enabled: false,
            logging_enabled: true,
            join_peers: Vec::new(),
            election_timeout_ms: default_election_timeout_ms(),
            apply_timeout_ms: default_apply_timeout_ms(),
            snapshot_threshold: default_snapshot_threshold(),
            join_retry_initial_ms: default_join_retry_initial_ms(),
            join_retry_max_ms: default_join_retry_max_ms(),
            long_poll_timeout_ms: default_long_poll_timeout_ms(),
            bcrypt_cost: default_bcrypt_cost(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_dir() -> String {
    "./data/meta".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:8089".to_string()
}

fn default_http_bind_address() -> String {
    "127.0.0.1:8091".to_string()
}

fn default_election_timeout_ms() -> u64 {
    1000
}

fn default_apply_timeout_ms() -> u64 {
    10_000
}

fn default_snapshot_threshold() -> u64 {
    8192
}

fn default_join_retry_initial_ms() -> u64 {
    100
}

fn default_join_retry_max_ms() -> u64 {
    5000
}

fn default_long_poll_timeout_ms() -> u64 {
    30_000
}

fn default_bcrypt_cost() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.meta.bind_address, "127.0.0.1:8089");
        assert_eq!(config.meta.election_timeout(), Duration::from_secs(1));
        assert!(config.meta.join_peers.is_empty());
        assert!(config.observability.metrics);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_load_config_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("meta.yaml");
        std::fs::write(
            &path,
            "meta:\n  dir: /var/lib/meta\n  join_peers:\n    - 10.0.0.1:8091\n    - 10.0.0.2:8091\n  apply_timeout_ms: 2500\nlogging:\n  format: json\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.meta.dir, "/var/lib/meta");
        assert_eq!(config.meta.join_peers.len(), 2);
        assert_eq!(config.meta.apply_timeout(), Duration::from_millis(2500));
        assert_eq!(config.meta.http_bind_address, "127.0.0.1:8091");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_example_config_parses() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/bleepmeta.example.yaml");
        let config = load_config(path).unwrap();
        assert_eq!(config.meta.http_bind_address, "127.0.0.1:8091");
        assert_eq!(config.meta.bcrypt_cost, 10);
    }
}
