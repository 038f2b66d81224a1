//! Configuration management for Bouncer.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BouncerError, Result};
use crate::ratelimit::{
    CounterMode, LimiterOptions, RetryPolicy, DEFAULT_KEY_PREFIX, DEFAULT_SCAN_PAGE_SIZE,
};

/// Prefix for environment variable overrides, e.g. `BOUNCER__STORE__REDIS_URL`.
pub const ENV_PREFIX: &str = "BOUNCER";

/// Main configuration for the Bouncer service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BouncerConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter behavior and default thresholds
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Per-scope threshold overrides
    #[serde(default)]
    pub scopes: HashMap<String, LimitSettings>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which counter store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; state is lost on restart and not shared
    #[default]
    Memory,
    /// Shared Redis store (requires the `redis-store` feature)
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Deadline for each store call in milliseconds; 0 disables it
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Keys requested per scan round during bulk resets
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,

    /// Retries for idempotent store calls
    #[serde(default)]
    pub max_retries: u32,

    /// Base retry delay in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// How often the memory store drops expired keys, in seconds; 0 disables it
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl StoreConfig {
    /// Interval for the memory store's background purge, if enabled.
    pub fn purge_interval(&self) -> Option<Duration> {
        match self.purge_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            op_timeout_ms: default_op_timeout_ms(),
            scan_page_size: default_scan_page_size(),
            max_retries: 0,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_op_timeout_ms() -> u64 {
    2000
}

fn default_scan_page_size() -> usize {
    DEFAULT_SCAN_PAGE_SIZE
}

fn default_retry_base_delay_ms() -> u64 {
    25
}

fn default_purge_interval_secs() -> u64 {
    60
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Namespace prepended to every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub counter_mode: CounterMode,

    /// Thresholds for scopes without an override
    #[serde(default)]
    pub default: LimitSettings,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            counter_mode: CounterMode::default(),
            default: LimitSettings::default(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Thresholds as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_block_duration_secs")]
    pub block_duration_secs: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
            block_duration_secs: default_block_duration_secs(),
        }
    }
}

fn default_max_attempts() -> u64 {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_block_duration_secs() -> u64 {
    300
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BouncerConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| BouncerError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional YAML file, overlaid with
    /// `BOUNCER__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Limiter options derived from the store and limiter sections.
    pub fn limiter_options(&self) -> LimiterOptions {
        let op_timeout = match self.store.op_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        LimiterOptions {
            key_prefix: self.limiter.key_prefix.clone(),
            counter_mode: self.limiter.counter_mode,
            op_timeout,
            scan_page_size: self.store.scan_page_size.max(1),
            retry: RetryPolicy {
                max_retries: self.store.max_retries,
                base_delay: Duration::from_millis(self.store.retry_base_delay_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BouncerConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.scan_page_size, 100);
        assert_eq!(config.limiter.key_prefix, "rate_limit");
        assert_eq!(config.limiter.default.max_attempts, 5);
        assert_eq!(config.limiter.default.window_secs, 60);
        assert_eq!(config.limiter.default.block_duration_secs, 300);
        assert!(config.scopes.is_empty());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = BouncerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.limiter.counter_mode, CounterMode::Atomic);
        assert_eq!(config.store.op_timeout_ms, 2000);
        assert_eq!(config.store.purge_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_purge_interval_zero_disables() {
        let config = BouncerConfig::from_yaml("store:\n  purge_interval_secs: 0\n").unwrap();
        assert_eq!(config.store.purge_interval(), None);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
store:
  backend: redis
  redis_url: redis://cache:6379
  op_timeout_ms: 0
  max_retries: 2
limiter:
  key_prefix: auth
  counter_mode: read_then_write
  default:
    max_attempts: 10
scopes:
  /api/login:
    max_attempts: 3
    block_duration_secs: 900
logging:
  level: debug
  json: true
"#;
        let config = BouncerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://cache:6379");
        assert_eq!(config.limiter.counter_mode, CounterMode::ReadThenWrite);
        assert_eq!(config.limiter.default.max_attempts, 10);
        assert_eq!(config.limiter.default.window_secs, 60);

        let login = config.scopes["/api/login"];
        assert_eq!(login.max_attempts, 3);
        assert_eq!(login.window_secs, 60);
        assert_eq!(login.block_duration_secs, 900);
        assert!(config.logging.json);

        let options = config.limiter_options();
        assert_eq!(options.key_prefix, "auth");
        assert_eq!(options.op_timeout, None);
        assert_eq!(options.retry.max_retries, 2);
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = BouncerConfig::from_yaml("store: [").unwrap_err();
        assert!(matches!(err, BouncerError::Config(_)));
    }

    #[test]
    fn test_limiter_options_timeout() {
        let config = BouncerConfig::default();
        assert_eq!(
            config.limiter_options().op_timeout,
            Some(Duration::from_millis(2000))
        );
    }
}
