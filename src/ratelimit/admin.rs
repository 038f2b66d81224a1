//! Administrative control: resets and status inspection.
//!
//! These operations work directly against the same store keys the decision
//! path uses and are safe to run alongside live traffic.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::keys::scope_patterns;
use super::limiter::RateLimiter;
use super::registry::RateLimitConfig;
use crate::error::{BouncerError, Result};
use crate::store::{BatchOp, SCAN_START};

/// Whether an identifier is blocked, and for how much longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BlockStatus {
    pub blocked: bool,
    /// Time left on the block; zero when not blocked
    pub remaining: Duration,
}

/// Point-in-time view of one identifier within one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitStatus {
    pub scope: String,
    pub identifier: String,
    pub remaining_attempts: u64,
    pub block: BlockStatus,
    pub limit: RateLimitConfig,
}

impl RateLimiter {
    /// Clear the attempt counter and block flag for one identifier.
    ///
    /// Both keys are deleted in one batch. Resetting a clean identifier is not
    /// an error.
    #[instrument(skip(self))]
    pub async fn reset(&self, scope: &str, identifier: &str) -> Result<()> {
        let keys = self.keys(scope, identifier);
        let ops = vec![
            BatchOp::delete(keys.attempts.as_str()),
            BatchOp::delete(keys.blocked.as_str()),
        ];
        self.retrying("batch", || self.store.batch(ops.clone()))
            .await?;

        info!(scope = %scope, identifier = %identifier, "Rate limit state reset");
        Ok(())
    }

    /// Attempts left before the block trips: the scope's `max_attempts` minus
    /// the current counter, or `max_attempts` when no counter exists.
    ///
    /// Ignores the block flag; see [`RateLimiter::blocked_status`].
    pub async fn remaining_attempts(&self, scope: &str, identifier: &str) -> Result<u64> {
        let config = self.registry.resolve(scope);
        let keys = self.keys(scope, identifier);

        let current = self
            .retrying("get", || self.store.get(&keys.attempts))
            .await?;
        let used = current.map_or(0, |v| u64::try_from(v).unwrap_or(0));
        Ok(config.max_attempts.saturating_sub(used))
    }

    /// Whether the identifier is blocked and the remaining time on the block.
    pub async fn blocked_status(&self, scope: &str, identifier: &str) -> Result<BlockStatus> {
        let keys = self.keys(scope, identifier);

        let exists = self
            .retrying("exists", || self.store.exists(&keys.blocked))
            .await?;
        if !exists {
            return Ok(BlockStatus::default());
        }

        let ttl = self
            .retrying("ttl_remaining", || self.store.ttl_remaining(&keys.blocked))
            .await?;
        match ttl {
            Some(remaining) if !remaining.is_zero() => Ok(BlockStatus {
                blocked: true,
                remaining,
            }),
            _ => {
                // Either the flag expired between the two calls, or something
                // other than this limiter wrote it without an expiry.
                let still_blocked = self
                    .retrying("exists", || self.store.exists(&keys.blocked))
                    .await?;
                Ok(BlockStatus {
                    blocked: still_blocked,
                    remaining: Duration::ZERO,
                })
            }
        }
    }

    /// Remaining attempts and block status together.
    pub async fn status(&self, scope: &str, identifier: &str) -> Result<LimitStatus> {
        let remaining_attempts = self.remaining_attempts(scope, identifier).await?;
        let block = self.blocked_status(scope, identifier).await?;

        Ok(LimitStatus {
            scope: scope.to_string(),
            identifier: identifier.to_string(),
            remaining_attempts,
            block,
            limit: self.registry.resolve(scope),
        })
    }

    /// Delete every attempt counter and block flag belonging to `scope`.
    ///
    /// Walks the keyspace with a resumable scan and deletes each page as it
    /// arrives, returning the number of keys deleted. Keys created after their
    /// page was scanned may survive. If a round fails after earlier rounds
    /// succeeded, the error is a [`BouncerError::PartialBatchFailure`]; keys
    /// already deleted stay deleted and the call can simply be repeated.
    #[instrument(skip(self))]
    pub async fn reset_all_for_scope(&self, scope: &str) -> Result<u64> {
        let page_size = self.options.scan_page_size;
        let mut deleted = 0u64;
        let mut rounds = 0u32;

        for pattern in scope_patterns(&self.options.key_prefix, scope) {
            let mut cursor = SCAN_START;
            loop {
                let page = self
                    .retrying("scan", || self.store.scan(cursor, &pattern, page_size))
                    .await
                    .map_err(|e| partial_failure(scope, deleted, rounds, e))?;

                if !page.keys.is_empty() {
                    let removed = self
                        .retrying("delete", || self.store.delete(&page.keys))
                        .await
                        .map_err(|e| partial_failure(scope, deleted, rounds, e))?;
                    deleted += removed;
                }

                rounds += 1;
                if page.is_last() {
                    break;
                }
                cursor = page.next_cursor;
            }
        }

        info!(scope = %scope, deleted = deleted, rounds = rounds, "Scope rate limit state reset");
        Ok(deleted)
    }
}

/// Wrap a failure from a bulk reset round.
///
/// A failure in the very first round changed nothing, so it is returned as is.
fn partial_failure(scope: &str, deleted: u64, rounds: u32, err: BouncerError) -> BouncerError {
    if rounds == 0 {
        return err;
    }
    warn!(
        scope = %scope,
        deleted = deleted,
        rounds = rounds,
        error = %err,
        "Bulk reset stopped part way"
    );
    BouncerError::PartialBatchFailure {
        scope: scope.to_string(),
        deleted,
        source: Box::new(err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ratelimit::{LimiterOptions, ScopeRegistry};
    use crate::store::{CounterStore, MemoryStore};

    fn limiter(max_attempts: u64) -> (RateLimiter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = RateLimitConfig::new(
            max_attempts,
            Duration::from_secs(60),
            Duration::from_secs(300),
        )
        .unwrap();
        let registry = Arc::new(ScopeRegistry::new(config).unwrap());
        let options = LimiterOptions {
            scan_page_size: 4,
            ..LimiterOptions::default()
        };
        (
            RateLimiter::with_options(store.clone(), registry, options),
            store,
        )
    }

    #[tokio::test]
    async fn test_reset_clears_block() {
        let (limiter, store) = limiter(1);

        assert!(!limiter.is_allowed("/login", "u1").await.unwrap());
        assert!(limiter.blocked_status("/login", "u1").await.unwrap().blocked);

        limiter.reset("/login", "u1").await.unwrap();

        assert!(store.is_empty());
        assert_eq!(
            limiter.blocked_status("/login", "u1").await.unwrap(),
            BlockStatus::default()
        );
    }

    #[tokio::test]
    async fn test_reset_clean_identifier_is_ok() {
        let (limiter, _) = limiter(3);
        limiter.reset("/login", "nobody").await.unwrap();
        limiter.reset("/login", "nobody").await.unwrap();
    }

    #[tokio::test]
    async fn test_remaining_attempts() {
        let (limiter, _) = limiter(5);

        assert_eq!(limiter.remaining_attempts("/login", "u1").await.unwrap(), 5);
        for k in 1..=3 {
            limiter.is_allowed("/login", "u1").await.unwrap();
            assert_eq!(
                limiter.remaining_attempts("/login", "u1").await.unwrap(),
                5 - k
            );
        }
    }

    #[tokio::test]
    async fn test_remaining_attempts_saturates() {
        let (limiter, store) = limiter(2);
        let keys = limiter.keys("/login", "u1");
        store
            .set_with_expiry(&keys.attempts, 9, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(limiter.remaining_attempts("/login", "u1").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_status_reports_remaining_ttl() {
        let (limiter, _) = limiter(1);

        limiter.is_allowed("/login", "u1").await.unwrap();
        tokio::time::advance(Duration::from_secs(100)).await;

        let status = limiter.blocked_status("/login", "u1").await.unwrap();
        assert!(status.blocked);
        assert_eq!(status.remaining, Duration::from_secs(200));
    }

    #[tokio::test]
    async fn test_blocked_status_without_expiry() {
        let (limiter, store) = limiter(1);
        let keys = limiter.keys("/login", "u1");
        store.increment(&keys.blocked).await.unwrap();

        let status = limiter.blocked_status("/login", "u1").await.unwrap();
        assert!(status.blocked);
        assert_eq!(status.remaining, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (limiter, _) = limiter(3);
        limiter.is_allowed("/login", "u1").await.unwrap();

        let status = limiter.status("/login", "u1").await.unwrap();
        assert_eq!(status.scope, "/login");
        assert_eq!(status.identifier, "u1");
        assert_eq!(status.remaining_attempts, 2);
        assert!(!status.block.blocked);
        assert_eq!(status.limit.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_reset_all_for_scope_spans_pages() {
        let (limiter, store) = limiter(2);

        for i in 0..10 {
            let id = format!("user-{}", i);
            limiter.is_allowed("/login", &id).await.unwrap();
            limiter.is_allowed("/signup", &id).await.unwrap();
        }
        // Trip a few so both key kinds exist
        for i in 0..3 {
            limiter.is_allowed("/login", &format!("user-{}", i)).await.unwrap();
        }

        let deleted = limiter.reset_all_for_scope("/login").await.unwrap();
        assert_eq!(deleted, 10);

        for i in 0..10 {
            let id = format!("user-{}", i);
            let keys = limiter.keys("/login", &id);
            assert!(!store.exists(&keys.attempts).await.unwrap());
            assert!(!store.exists(&keys.blocked).await.unwrap());
            assert!(store
                .exists(&limiter.keys("/signup", &id).attempts)
                .await
                .unwrap());
        }
        assert_eq!(store.len(), 10);

        // Repeating is harmless
        assert_eq!(limiter.reset_all_for_scope("/login").await.unwrap(), 0);
    }
}
