//! Attempt-counting rate limiter with escalation to a temporary block.
//!
//! For every (scope, identifier) pair the limiter keeps two keys in the
//! counter store: an attempt counter that lives for one window from the first
//! attempt, and a block flag that lives for the block duration once the
//! counter reaches the scope's threshold. Both expire on their own, so an
//! identifier returns to a clean slate without any background sweep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use super::keys::LimitKeys;
use super::registry::{RateLimitConfig, ScopeRegistry};
use crate::error::{BouncerError, Result};
use crate::store::{BatchOp, CounterStore, StoreResult};

/// Default namespace for store keys.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";
/// Keys requested per scan round during bulk resets.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;
/// Deadline applied to each individual store call.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// How an attempt is recorded in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterMode {
    /// One atomic increment-and-get; the returned count decides.
    #[default]
    Atomic,
    /// Read the counter, then create or increment it. Concurrent callers can
    /// lose increments or overshoot the threshold slightly before the block
    /// lands. For stores without an atomic increment-with-expiry.
    ReadThenWrite,
}

/// Bounded retry for idempotent store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failure. Zero disables retrying.
    pub max_retries: u32,
    /// Base delay, doubled per retry, plus up to one base delay of jitter
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// No retries: store failures reach the caller immediately.
    pub const NONE: RetryPolicy = RetryPolicy {
        max_retries: 0,
        base_delay: Duration::ZERO,
    };

    /// Delay before the `retry`-th retry (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let shift = retry.saturating_sub(1).min(16);
        let exponential = base.saturating_mul(1u64 << shift);
        let jitter = if base == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=base)
        };
        Duration::from_millis(exponential.saturating_add(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

/// Tuning for a [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    /// Namespace prepended to every store key
    pub key_prefix: String,
    pub counter_mode: CounterMode,
    /// Deadline for each store call; `None` waits as long as the store does
    pub op_timeout: Option<Duration>,
    /// Keys requested per scan round in [`RateLimiter::reset_all_for_scope`]
    pub scan_page_size: usize,
    pub retry: RetryPolicy,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            counter_mode: CounterMode::default(),
            op_timeout: Some(DEFAULT_OP_TIMEOUT),
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            retry: RetryPolicy::NONE,
        }
    }
}

/// Outcome of a single attempt check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The attempt was counted and may proceed.
    Allowed {
        /// Attempts recorded in the current window, this one included
        attempts: u64,
        /// Attempts left before the block trips
        remaining: u64,
    },
    /// This attempt reached the threshold; the identifier is now blocked.
    Tripped,
    /// The identifier was already blocked. Nothing was counted.
    Blocked,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// The rate limiter: decides whether an identifier may attempt an operation.
///
/// Holds no per-identifier state itself; everything lives in the counter
/// store, so any number of limiters (in one process or many) sharing a store
/// and key prefix enforce the same limits.
pub struct RateLimiter {
    pub(super) store: Arc<dyn CounterStore>,
    pub(super) registry: Arc<ScopeRegistry>,
    pub(super) options: LimiterOptions,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter with default options.
    pub fn new(store: Arc<dyn CounterStore>, registry: Arc<ScopeRegistry>) -> Self {
        Self::with_options(store, registry, LimiterOptions::default())
    }

    /// Create a rate limiter with explicit options.
    pub fn with_options(
        store: Arc<dyn CounterStore>,
        registry: Arc<ScopeRegistry>,
        options: LimiterOptions,
    ) -> Self {
        Self {
            store,
            registry,
            options,
        }
    }

    /// The scope registry consulted for thresholds.
    pub fn registry(&self) -> &Arc<ScopeRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Register or replace the thresholds for `scope`.
    pub fn register_scope(&self, scope: &str, config: RateLimitConfig) -> Result<()> {
        self.registry.register(scope, config)
    }

    /// Whether `identifier` may attempt the operation guarded by `scope` now.
    ///
    /// Counts the attempt when allowed. Fails only when the store does.
    pub async fn is_allowed(&self, scope: &str, identifier: &str) -> Result<bool> {
        Ok(self.check(scope, identifier).await?.is_allowed())
    }

    /// Check and record an attempt, returning the detailed outcome.
    ///
    /// The block flag is consulted first so a blocked identifier never touches
    /// its counter. The attempt that brings the counter to `max_attempts` is
    /// denied and sets the block flag while deleting the counter.
    #[instrument(skip(self))]
    pub async fn check(&self, scope: &str, identifier: &str) -> Result<Decision> {
        let config = self.registry.resolve(scope);
        let keys = self.keys(scope, identifier);

        trace!(
            key = %keys.attempts,
            max_attempts = config.max_attempts,
            "Checking attempt limit"
        );

        let blocked = self
            .retrying("exists", || self.store.exists(&keys.blocked))
            .await?;
        if blocked {
            debug!(key = %keys.blocked, "Attempt denied, identifier is blocked");
            return Ok(Decision::Blocked);
        }

        let attempts = match self.options.counter_mode {
            CounterMode::Atomic => {
                self.once("increment_with_expiry", || {
                    self.store.increment_with_expiry(&keys.attempts, config.window)
                })
                .await?
            }
            CounterMode::ReadThenWrite => self.record_read_then_write(&keys, &config).await?,
        };
        let attempts = u64::try_from(attempts).unwrap_or(0);

        if attempts == 1 {
            debug!(key = %keys.attempts, window = ?config.window, "Started attempt counter");
        }

        if attempts >= config.max_attempts {
            self.trip(&keys, &config).await?;
            return Ok(Decision::Tripped);
        }

        Ok(Decision::Allowed {
            attempts,
            remaining: config.max_attempts - attempts,
        })
    }

    /// The store keys for a scope and identifier.
    pub fn keys(&self, scope: &str, identifier: &str) -> LimitKeys {
        LimitKeys::new(&self.options.key_prefix, scope, identifier)
    }

    /// Record an attempt with separate read and write calls.
    ///
    /// Returns the count this attempt brings the counter to. The counter is
    /// left untouched when that count reaches the threshold, since the caller
    /// deletes it while tripping the block.
    async fn record_read_then_write(
        &self,
        keys: &LimitKeys,
        config: &RateLimitConfig,
    ) -> Result<i64> {
        let current = self
            .retrying("get", || self.store.get(&keys.attempts))
            .await?;
        let next = current.unwrap_or(0).max(0) + 1;
        if u64::try_from(next).unwrap_or(0) >= config.max_attempts {
            return Ok(next);
        }

        match current {
            None => {
                self.retrying("set_with_expiry", || {
                    self.store.set_with_expiry(&keys.attempts, 1, config.window)
                })
                .await?;
                Ok(1)
            }
            Some(_) => {
                let value = self
                    .once("increment", || self.store.increment(&keys.attempts))
                    .await?;
                if value == 1 {
                    // The counter expired between the read and the increment,
                    // which recreated it without an expiry.
                    self.retrying("set_with_expiry", || {
                        self.store.set_with_expiry(&keys.attempts, 1, config.window)
                    })
                    .await?;
                }
                Ok(value)
            }
        }
    }

    /// Block the identifier and drop its counter in one batch.
    async fn trip(&self, keys: &LimitKeys, config: &RateLimitConfig) -> Result<()> {
        let ops = vec![
            BatchOp::set(keys.blocked.as_str(), 1, config.block_duration),
            BatchOp::delete(keys.attempts.as_str()),
        ];
        self.retrying("batch", || self.store.batch(ops.clone()))
            .await?;

        info!(
            key = %keys.blocked,
            max_attempts = config.max_attempts,
            block_duration = ?config.block_duration,
            "Attempt limit reached, identifier blocked"
        );
        Ok(())
    }

    /// Run an idempotent store call under the deadline, retrying per policy.
    pub(super) async fn retrying<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut retry = 0;
        loop {
            match self.with_deadline(call()).await {
                Err(err) if retry < self.options.retry.max_retries => {
                    retry += 1;
                    let delay = self.options.retry.backoff(retry);
                    warn!(
                        op = op,
                        retry = retry,
                        delay = ?delay,
                        error = %err,
                        "Counter store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Run a non-idempotent store call under the deadline, without retrying.
    pub(super) async fn once<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.with_deadline(call()).await.map_err(|err| {
            trace!(op = op, error = %err, "Counter store call failed");
            err
        })
    }

    async fn with_deadline<T, Fut>(&self, call: Fut) -> Result<T>
    where
        Fut: Future<Output = StoreResult<T>>,
    {
        match self.options.op_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome.map_err(BouncerError::from),
                Err(_) => Err(BouncerError::Timeout(limit)),
            },
            None => call.await.map_err(BouncerError::from),
        }
    }
}
