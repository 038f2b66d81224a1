//! Per-scope rate limit configuration.
//!
//! Each scope (typically an endpoint path) may carry its own thresholds. Scopes
//! without an entry fall back to the default configuration supplied when the
//! registry is built.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{BouncerConfig, LimitSettings};
use crate::error::{BouncerError, Result};
use crate::store::MAX_TTL;

/// Scope used by callers that only need a single, global limiter.
pub const DEFAULT_SCOPE: &str = "";

/// Thresholds for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitConfig {
    /// Attempts allowed within the window; the attempt that reaches this
    /// count is denied and trips the block
    pub max_attempts: u64,
    /// Lifetime of an attempt counter, measured from its first attempt
    pub window: Duration,
    /// How long an identifier stays blocked once tripped
    pub block_duration: Duration,
}

impl RateLimitConfig {
    /// Create a validated configuration.
    pub fn new(max_attempts: u64, window: Duration, block_duration: Duration) -> Result<Self> {
        let config = Self {
            max_attempts,
            window,
            block_duration,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject zero attempts, and durations that are zero or longer than
    /// [`MAX_TTL`].
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(BouncerError::ConfigInvalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(BouncerError::ConfigInvalid(
                "window must be greater than zero".to_string(),
            ));
        }
        if self.block_duration.is_zero() {
            return Err(BouncerError::ConfigInvalid(
                "block_duration must be greater than zero".to_string(),
            ));
        }
        let durations = [("window", self.window), ("block_duration", self.block_duration)];
        for (name, duration) in durations {
            if duration > MAX_TTL {
                return Err(BouncerError::ConfigInvalid(format!(
                    "{} must be at most {}s",
                    name,
                    MAX_TTL.as_secs()
                )));
            }
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
        }
    }
}

impl TryFrom<&LimitSettings> for RateLimitConfig {
    type Error = BouncerError;

    fn try_from(settings: &LimitSettings) -> Result<Self> {
        RateLimitConfig::new(
            settings.max_attempts,
            Duration::from_secs(settings.window_secs),
            Duration::from_secs(settings.block_duration_secs),
        )
    }
}

/// Maps scopes to their rate limit configuration.
///
/// Lookups take a shared lock, so the registry can be read concurrently from
/// every request. Registration is expected at setup time but remains safe
/// afterwards.
#[derive(Debug)]
pub struct ScopeRegistry {
    default: RateLimitConfig,
    scopes: RwLock<HashMap<String, RateLimitConfig>>,
}

impl ScopeRegistry {
    /// Create a registry with the given default configuration.
    pub fn new(default: RateLimitConfig) -> Result<Self> {
        default.validate()?;
        Ok(Self {
            default,
            scopes: RwLock::new(HashMap::new()),
        })
    }

    /// Build a registry from loaded configuration, validating every entry.
    pub fn from_config(config: &BouncerConfig) -> Result<Self> {
        let default = RateLimitConfig::try_from(&config.limiter.default)?;
        let registry = Self::new(default)?;

        for (scope, settings) in &config.scopes {
            let scope_config = RateLimitConfig::try_from(settings).map_err(|e| match e {
                BouncerError::ConfigInvalid(msg) => {
                    BouncerError::ConfigInvalid(format!("scope '{}': {}", scope, msg))
                }
                other => other,
            })?;
            registry.register(scope, scope_config)?;
        }

        info!(scopes = registry.len(), "Scope registry built");
        Ok(registry)
    }

    /// Store or overwrite the configuration for `scope`.
    pub fn register(&self, scope: &str, config: RateLimitConfig) -> Result<()> {
        config.validate()?;
        debug!(
            scope = %scope,
            max_attempts = config.max_attempts,
            window = ?config.window,
            block_duration = ?config.block_duration,
            "Registering scope configuration"
        );
        self.scopes.write().insert(scope.to_string(), config);
        Ok(())
    }

    /// Configuration for `scope`, or the default when none is registered.
    pub fn resolve(&self, scope: &str) -> RateLimitConfig {
        self.scopes
            .read()
            .get(scope)
            .copied()
            .unwrap_or(self.default)
    }

    /// The fallback configuration.
    pub fn default_config(&self) -> RateLimitConfig {
        self.default
    }

    /// Number of scope-specific entries.
    pub fn len(&self) -> usize {
        self.scopes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.read().is_empty()
    }
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self {
            default: RateLimitConfig::default(),
            scopes: RwLock::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(max_attempts: u64, window: u64, block: u64) -> RateLimitConfig {
        RateLimitConfig::new(
            max_attempts,
            Duration::from_secs(window),
            Duration::from_secs(block),
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let registry = ScopeRegistry::new(limit(3, 60, 300)).unwrap();
        assert_eq!(registry.resolve("/login"), limit(3, 60, 300));
        assert_eq!(registry.resolve(DEFAULT_SCOPE), limit(3, 60, 300));
    }

    #[test]
    fn test_register_overrides_scope() {
        let registry = ScopeRegistry::new(limit(3, 60, 300)).unwrap();
        registry.register("/login", limit(10, 30, 600)).unwrap();

        assert_eq!(registry.resolve("/login"), limit(10, 30, 600));
        assert_eq!(registry.resolve("/signup"), limit(3, 60, 300));
        assert_eq!(registry.len(), 1);

        // Overwrite
        registry.register("/login", limit(2, 30, 600)).unwrap();
        assert_eq!(registry.resolve("/login").max_attempts, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(matches!(
            RateLimitConfig::new(0, Duration::from_secs(1), Duration::from_secs(1)),
            Err(BouncerError::ConfigInvalid(_))
        ));
        assert!(matches!(
            RateLimitConfig::new(1, Duration::ZERO, Duration::from_secs(1)),
            Err(BouncerError::ConfigInvalid(_))
        ));
        assert!(matches!(
            RateLimitConfig::new(1, Duration::from_secs(1), Duration::ZERO),
            Err(BouncerError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_register_rejects_invalid_and_keeps_previous() {
        let registry = ScopeRegistry::default();
        registry.register("/login", limit(4, 60, 60)).unwrap();

        let invalid = RateLimitConfig {
            max_attempts: 0,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(60),
        };
        assert!(registry.register("/login", invalid).is_err());
        assert_eq!(registry.resolve("/login").max_attempts, 4);
    }

    #[test]
    fn test_from_config() {
        let yaml = r#"
limiter:
  default:
    max_attempts: 5
    window_secs: 60
    block_duration_secs: 300
scopes:
  /api/login:
    max_attempts: 3
    window_secs: 60
    block_duration_secs: 900
"#;
        let config = BouncerConfig::from_yaml(yaml).unwrap();
        let registry = ScopeRegistry::from_config(&config).unwrap();

        assert_eq!(registry.resolve("/api/login"), limit(3, 60, 900));
        assert_eq!(registry.resolve("/api/other"), limit(5, 60, 300));
    }

    #[test]
    fn test_from_config_rejects_invalid_scope() {
        let yaml = r#"
scopes:
  /api/login:
    max_attempts: 0
    window_secs: 60
    block_duration_secs: 900
"#;
        let config = BouncerConfig::from_yaml(yaml).unwrap();
        let err = ScopeRegistry::from_config(&config).unwrap_err();
        match err {
            BouncerError::ConfigInvalid(msg) => {
                assert_eq!(msg, "scope '/api/login': max_attempts must be at least 1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_durations_beyond_max_ttl_rejected() {
        let too_long = MAX_TTL + Duration::from_secs(1);
        assert!(matches!(
            RateLimitConfig::new(1, too_long, Duration::from_secs(1)),
            Err(BouncerError::ConfigInvalid(_))
        ));
        assert!(matches!(
            RateLimitConfig::new(1, Duration::from_secs(1), too_long),
            Err(BouncerError::ConfigInvalid(_))
        ));
        assert!(RateLimitConfig::new(1, MAX_TTL, MAX_TTL).is_ok());
    }

    #[test]
    fn test_from_config_rejects_huge_window() {
        let yaml = r#"
scopes:
  /login:
    max_attempts: 3
    window_secs: 18446744073709551615
"#;
        let config = BouncerConfig::from_yaml(yaml).unwrap();
        let err = ScopeRegistry::from_config(&config).unwrap_err();
        assert!(matches!(err, BouncerError::ConfigInvalid(ref msg) if msg.contains("window")));

        let yaml = r#"
limiter:
  default:
    block_duration_secs: 18446744073709551615
"#;
        let config = BouncerConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            ScopeRegistry::from_config(&config),
            Err(BouncerError::ConfigInvalid(_))
        ));
    }
}
