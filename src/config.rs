//! Configuration management for Abuseguard.
//!
//! Sources are layered lowest to highest: built-in defaults, an optional YAML
//! file, then `ABUSEGUARD__SECTION__KEY` environment variables.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::{GuardError, Result};
use crate::identity::ProxyTrust;
use crate::ratelimit::RateLimitConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ABUSEGUARD";

/// Main configuration for the Abuseguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Distributed backend configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Rate limit policy table
    #[serde(default)]
    pub limits: RateLimitConfig,

    /// Requests that skip every check
    #[serde(default)]
    pub whitelist: WhitelistConfig,

    /// Trust placed in reverse-proxy headers
    #[serde(default)]
    pub proxy: ProxyTrust,

    /// Suspicious-pattern thresholds
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Violation record retention
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Background housekeeping intervals
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Development switch that disables all checks
    #[serde(default)]
    pub bypass: bool,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Redis configuration. Without a URL everything runs in process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/`
    #[serde(default)]
    pub url: Option<String>,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Namespace prepended to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_redis_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_redis_timeout_ms() -> u64 {
    250
}

fn default_key_prefix() -> String {
    "abuseguard:".to_string()
}

/// Paths and addresses exempt from rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistConfig {
    /// Exact paths, or prefixes followed by `/`
    #[serde(default = "default_whitelist_paths")]
    pub paths: Vec<String>,

    /// Client addresses
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            paths: default_whitelist_paths(),
            addresses: Vec::new(),
        }
    }
}

impl WhitelistConfig {
    pub fn contains_path(&self, path: &str) -> bool {
        self.paths.iter().any(|allowed| {
            path == allowed
                || path
                    .strip_prefix(allowed.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    pub fn contains_addr(&self, addr: &IpAddr) -> bool {
        self.addresses.contains(addr)
    }
}

fn default_whitelist_paths() -> Vec<String> {
    vec!["/health".to_string(), "/api/health".to_string()]
}

/// Suspicious-pattern thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Largest declared body accepted, in bytes
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,

    /// Requests tolerated inside the burst window
    #[serde(default = "default_rapid_threshold")]
    pub rapid_threshold: u64,

    /// Burst window length in seconds
    #[serde(default = "default_rapid_window_secs")]
    pub rapid_window_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            rapid_threshold: default_rapid_threshold(),
            rapid_window_secs: default_rapid_window_secs(),
        }
    }
}

fn default_max_payload_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_rapid_threshold() -> u64 {
    10
}

fn default_rapid_window_secs() -> u64 {
    1
}

/// Violation record retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Days a record is kept after its last update
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

impl LedgerConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

fn default_retention_days() -> i64 {
    30
}

/// Background housekeeping intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// In-memory counter sweep interval in seconds
    #[serde(default = "default_counter_sweep_secs")]
    pub counter_sweep_secs: u64,

    /// Violation record purge interval in seconds
    #[serde(default = "default_ledger_purge_secs")]
    pub ledger_purge_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            counter_sweep_secs: default_counter_sweep_secs(),
            ledger_purge_secs: default_ledger_purge_secs(),
        }
    }
}

fn default_counter_sweep_secs() -> u64 {
    60
}

fn default_ledger_purge_secs() -> u64 {
    3600
}

impl GuardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GuardConfig =
            serde_yaml::from_str(yaml).map_err(|e| GuardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional YAML file and the environment over the defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::with_name(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("whitelist.paths")
                .with_list_parse_key("whitelist.addresses"),
        );

        let config: GuardConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the gate unusable.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        if self.redis.timeout_ms == 0 {
            return Err(GuardError::Config(
                "redis.timeout_ms must be positive".to_string(),
            ));
        }
        if self.detector.rapid_threshold == 0 || self.detector.rapid_window_secs == 0 {
            return Err(GuardError::Config(
                "detector burst threshold and window must be positive".to_string(),
            ));
        }
        if self.ledger.retention_days <= 0 {
            return Err(GuardError::Config(
                "ledger.retention_days must be positive".to_string(),
            ));
        }
        if self.maintenance.counter_sweep_secs == 0 || self.maintenance.ledger_purge_secs == 0 {
            return Err(GuardError::Config(
                "maintenance intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
