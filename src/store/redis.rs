//! Redis-backed counter store.
//!
//! Shares attempt counters and block flags across every instance of the
//! service. Uses a reconnecting connection manager, so a dropped connection
//! surfaces as a failed call rather than a dead store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use tracing::info;

use super::{BatchOp, CounterStore, KeyPattern, ScanPage, StoreError, StoreResult};

/// Increment a key, attaching the expiry only when the increment created it.
const INCREMENT_WITH_EXPIRY: &str = r#"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return value
"#;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// A counter store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    increment_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        info!(url = %url, "Connecting to Redis counter store");
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            increment_script: Script::new(INCREMENT_WITH_EXPIRY),
        })
    }
}

fn millis(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Render `pattern` as a `SCAN ... MATCH` argument, escaping the prefix.
fn match_arg(pattern: &KeyPattern) -> String {
    let mut arg = String::with_capacity(pattern.prefix().len() + 1);
    for c in pattern.prefix().chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            arg.push('\\');
        }
        arg.push(c);
    }
    arg.push('*');
    arg
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_expiry(&self, key: &str, value: i64, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .increment_script
            .key(key)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        // -2: no such key, -1: key without expiry
        let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        if ms < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(ms as u64)))
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &KeyPattern,
        page_size: usize,
    ) -> StoreResult<ScanPage> {
        let mut conn = self.conn.clone();
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(match_arg(pattern))
            .arg("COUNT")
            .arg(page_size.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(ScanPage { keys, next_cursor })
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                BatchOp::SetWithExpiry { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(*value)
                        .arg("PX")
                        .arg(millis(*ttl))
                        .ignore();
                }
                BatchOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }

        let mut conn = self.conn.clone();
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
