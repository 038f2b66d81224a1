//! In-process counter store.
//!
//! Suitable for single-instance deployments and tests. Entries expire lazily:
//! an expired entry is treated as absent on access and physically removed on
//! the next write to it, during scans, or by the background purger started
//! with [`MemoryStore::spawn_purger`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::{
    BatchOp, CounterStore, KeyPattern, ScanPage, StoreError, StoreResult, SCAN_START,
};

/// Absolute expiry for a key written at `now` with `ttl`.
fn expiry(now: Instant, ttl: Duration) -> StoreResult<Instant> {
    now.checked_add(ttl)
        .ok_or_else(|| StoreError::Protocol(format!("expiry {:?} out of range", ttl)))
}

#[derive(Debug, Clone)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
    /// Insertion sequence, used as the scan cursor position
    seq: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug)]
struct State {
    entries: HashMap<String, Entry>,
    /// Keys ordered by insertion sequence. A scan walks this index, so keys
    /// deleted between rounds never shift the position of the rest.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl State {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 1,
        }
    }

    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.is_live(now))
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    /// Drop `key` if it has expired, so the caller sees a clean slot.
    fn evict_if_expired(&mut self, key: &str, now: Instant) {
        if matches!(self.entries.get(key), Some(e) if !e.is_live(now)) {
            self.remove(key);
        }
    }

    fn insert(&mut self, key: &str, value: i64, expires_at: Option<Instant>) {
        self.evict_if_expired(key, Instant::now());
        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = value;
            entry.expires_at = expires_at;
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.to_string());
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                seq,
            },
        );
    }

    fn increment(&mut self, key: &str, ttl: Option<Duration>, now: Instant) -> StoreResult<i64> {
        self.evict_if_expired(key, now);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = entry
                .value
                .checked_add(1)
                .ok_or_else(|| StoreError::Protocol(format!("counter {} overflowed", key)))?;
            return Ok(entry.value);
        }
        let expires_at = ttl.map(|ttl| expiry(now, ttl)).transpose()?;
        self.insert(key, 1, expires_at);
        Ok(1)
    }
}

/// A counter store held entirely in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::new()),
        }
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock();
        state.entries.values().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries held, including expired ones not yet removed.
    pub fn held(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Physically remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| !e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    /// Purge expired entries every `every` on a background task.
    ///
    /// The task holds only a weak reference and exits once the store is
    /// dropped.
    pub fn spawn_purger(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged = purged, held = store.held(), "Purged expired keys");
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let state = self.state.lock();
        Ok(state.live(key, Instant::now()).is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let state = self.state.lock();
        Ok(state.live(key, Instant::now()).map(|e| e.value))
    }

    async fn set_with_expiry(&self, key: &str, value: i64, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let expires_at = expiry(now, ttl)?;
        let mut state = self.state.lock();
        state.insert(key, value, Some(expires_at));
        Ok(())
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut state = self.state.lock();
        state.increment(key, None, Instant::now())
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut state = self.state.lock();
        state.increment(key, Some(ttl), Instant::now())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = state.remove(key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state
            .live(key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &KeyPattern,
        page_size: usize,
    ) -> StoreResult<ScanPage> {
        let glob = pattern.to_glob()?;
        let now = Instant::now();
        let page_size = page_size.max(1);
        let mut state = self.state.lock();

        let examined: Vec<(u64, String)> = state
            .order
            .range(cursor..)
            .take(page_size.saturating_add(1))
            .map(|(seq, key)| (*seq, key.clone()))
            .collect();

        let next_cursor = if examined.len() > page_size {
            examined[page_size].0
        } else {
            SCAN_START
        };

        let mut keys = Vec::new();
        for (_, key) in examined.into_iter().take(page_size) {
            let live = state.entries.get(&key).map_or(false, |e| e.is_live(now));
            if !live {
                state.remove(&key);
                continue;
            }
            if glob.matches(&key) {
                keys.push(key);
            }
        }

        trace!(
            cursor = cursor,
            pattern = %pattern,
            matched = keys.len(),
            next_cursor = next_cursor,
            "Scanned memory store"
        );

        Ok(ScanPage { keys, next_cursor })
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        let now = Instant::now();
        // Resolve every expiry up front so a bad one rejects the whole batch.
        let expiries = ops
            .iter()
            .map(|op| match op {
                BatchOp::SetWithExpiry { ttl, .. } => expiry(now, *ttl).map(Some),
                BatchOp::Delete { .. } => Ok(None),
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let mut state = self.state.lock();
        for (op, expires_at) in ops.into_iter().zip(expiries) {
            match op {
                BatchOp::SetWithExpiry { key, value, .. } => {
                    state.insert(&key, value, expires_at);
                }
                BatchOp::Delete { key } => {
                    state.remove(&key);
                }
            }
        }
        Ok(())
    }
}
