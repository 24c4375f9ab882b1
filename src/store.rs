//! Shared key-value storage for distributed buckets.
//!
//! A logical bucket `K` occupies two plain string keys, `{prefix}:{K}:tokens`
//! and `{prefix}:{K}:ts`, both rewritten with a short expiry whenever a token
//! is taken. Abandoned buckets therefore disappear on their own.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;

pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// Raw bucket fields as found in the store; absent keys read as `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StoredBucket {
    pub tokens: Option<f64>,
    pub last_refill_ms: Option<u64>,
}

/// Store key names for one logical bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    pub tokens: String,
    pub timestamp: String,
}

impl BucketKeys {
    pub fn new(prefix: &str, key: &str) -> Self {
        Self {
            tokens: format!("{}:{}:tokens", prefix, key),
            timestamp: format!("{}:{}:ts", prefix, key),
        }
    }
}

#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Read both fields of a bucket in a single round trip.
    async fn load(&self, keys: &BucketKeys) -> Result<StoredBucket>;

    /// Write both fields, each expiring after `ttl`.
    async fn save(
        &self,
        keys: &BucketKeys,
        tokens: f64,
        last_refill_ms: u64,
        ttl: Duration,
    ) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// In-process [`BucketStore`] with the same expiry semantics as Redis.
///
/// Useful for tests and single-host runs. Values are kept as strings so that
/// parsing behaves the way it does against a real store.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, u64)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of keys that have not yet expired.
    pub fn live_keys(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .lock()
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    fn get(entries: &HashMap<String, (String, u64)>, key: &str, now: u64) -> Option<String> {
        entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn load(&self, keys: &BucketKeys) -> Result<StoredBucket> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock();

        Ok(StoredBucket {
            tokens: Self::get(&entries, &keys.tokens, now).and_then(|v| v.parse().ok()),
            last_refill_ms: Self::get(&entries, &keys.timestamp, now).and_then(|v| v.parse().ok()),
        })
    }

    async fn save(
        &self,
        keys: &BucketKeys,
        tokens: f64,
        last_refill_ms: u64,
        ttl: Duration,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let expires_at = now.saturating_add(ttl_ms);
        let mut entries = self.entries.lock();

        entries.retain(|_, (_, at)| *at > now);
        entries.insert(keys.tokens.clone(), (tokens.to_string(), expires_at));
        entries.insert(keys.timestamp.clone(), (last_refill_ms.to_string(), expires_at));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
