//! Counter store abstraction.
//!
//! The limiter keeps no durable state of its own. Attempt counters and block
//! flags live in a shared, TTL-capable key-value store reachable by every
//! instance of the service. This module defines the operations the limiter
//! needs from such a store and ships an in-process implementation; a Redis
//! implementation is available behind the `redis-store` feature.

mod memory;
#[cfg(feature = "redis-store")]
mod redis;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

/// Result type for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Longest time-to-live a store accepts.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Cursor value that both starts a scan and signals its completion.
pub const SCAN_START: u64 = 0;

/// One page of a keyspace scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Keys matched in this round. May be empty even when the scan is not done.
    pub keys: Vec<String>,
    /// Cursor for the next round; [`SCAN_START`] once the scan is complete.
    pub next_cursor: u64,
}

impl ScanPage {
    /// Whether this was the final round of the scan.
    pub fn is_last(&self) -> bool {
        self.next_cursor == SCAN_START
    }
}

/// A write grouped into a [`CounterStore::batch`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Set `key` to `value`, expiring after `ttl`.
    SetWithExpiry {
        key: String,
        value: i64,
        ttl: Duration,
    },
    /// Delete `key` if present.
    Delete { key: String },
}

impl BatchOp {
    pub fn set(key: impl Into<String>, value: i64, ttl: Duration) -> Self {
        BatchOp::SetWithExpiry {
            key: key.into(),
            value,
            ttl,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        BatchOp::Delete { key: key.into() }
    }
}

/// Trait for shared counter stores.
///
/// Implementations must be safe to call concurrently from many tasks and,
/// for multi-instance deployments, from many processes.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Read the integer stored at `key`, `None` if absent.
    async fn get(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Set `key` to `value` with a fresh time-to-live.
    async fn set_with_expiry(&self, key: &str, value: i64, ttl: Duration) -> StoreResult<()>;

    /// Increment `key` by one and return the new value.
    ///
    /// An existing key keeps its time-to-live. A missing key is created at 1
    /// without an expiry.
    async fn increment(&self, key: &str) -> StoreResult<i64>;

    /// Atomically increment `key` and return the new value, creating it at 1
    /// with `ttl` when absent. An existing key keeps its time-to-live.
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// Remaining time-to-live of `key`.
    ///
    /// Returns `None` when the key is absent or has no expiry.
    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Run one round of an incremental keyspace scan.
    ///
    /// Start with [`SCAN_START`] and feed `next_cursor` back in until it is
    /// [`SCAN_START`] again.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &KeyPattern,
        page_size: usize,
    ) -> StoreResult<ScanPage>;

    /// Apply all `ops` in one round trip. Either every op is applied or none is.
    async fn batch(&self, ops: Vec<BatchOp>) -> StoreResult<()>;
}

/// Keys selected by a scan: every key that starts with a literal prefix.
///
/// Each store renders this in its own matching syntax, so the prefix never
/// needs escaping by callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPattern {
    prefix: String,
}

impl KeyPattern {
    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The literal prefix every matched key starts with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Compile into a shell-style glob with the prefix escaped.
    pub fn to_glob(&self) -> StoreResult<glob::Pattern> {
        let source = format!("{}*", glob::Pattern::escape(&self.prefix));
        glob::Pattern::new(&source)
            .map_err(|e| StoreError::Protocol(format!("bad scan pattern {:?}: {}", source, e)))
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*", self.prefix)
    }
}
