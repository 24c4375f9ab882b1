use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::{BackendKind, BucketBackend};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::token_bucket::{Acquire, BucketLimit, BucketState};

/// In-memory buckets for a single process.
///
/// The map is sharded, so unrelated keys rarely share a lock, and each entry
/// carries its own mutex for the refill math. Checks on an existing key only
/// take the shard's read lock; creating or evicting a key takes its write lock,
/// which keeps a check from ever seeing a half-removed entry.
pub struct LocalBackend {
    buckets: DashMap<String, Mutex<BucketState>>,
    clock: Arc<dyn Clock>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
        }
    }

    pub fn check(&self, key: &str, limit: &BucketLimit) -> bool {
        self.try_acquire(key, limit).is_granted()
    }

    pub fn try_acquire(&self, key: &str, limit: &BucketLimit) -> Acquire {
        let now = self.clock.now_millis();

        if let Some(bucket) = self.buckets.get(key) {
            return bucket.lock().try_acquire(limit, now);
        }

        let bucket = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| Mutex::new(BucketState::full(limit, now)));
        let outcome = bucket.lock().try_acquire(limit, now);
        outcome
    }

    /// Remove every bucket whose last refill is older than `max_idle`.
    ///
    /// Returns how many were removed. A removed key starts full on its next check.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(max_idle.as_millis() as u64);
        let before = self.buckets.len();

        self.buckets
            .retain(|_, bucket| bucket.get_mut().last_refill_ms >= cutoff);

        before.saturating_sub(self.buckets.len())
    }

    pub fn reset(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketBackend for LocalBackend {
    async fn acquire(&self, key: &str, limit: &BucketLimit) -> Result<Acquire> {
        Ok(self.try_acquire(key, limit))
    }

    fn tracked_keys(&self) -> Option<usize> {
        Some(self.len())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}
