use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use super::{BackendKind, BucketBackend};
use crate::clock::{Clock, SystemClock};
use crate::error::{AdmissionError, Result};
use crate::store::{BucketKeys, BucketStore, DEFAULT_KEY_PREFIX};
use crate::token_bucket::{Acquire, BucketLimit, BucketState};

/// Buckets kept in a store shared by all processes.
///
/// Each check reads the bucket, refills it locally and, only when a token is
/// taken, writes it back with a fresh expiry. The read and the write are two
/// separate round trips and are not atomic: two processes checking the same
/// key at the same moment may both read the same count and both admit,
/// over-admitting by one token per concurrent writer. Denials never write.
pub struct DistributedBackend {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    key_ttl: Duration,
    check_timeout: Duration,
}

impl DistributedBackend {
    pub fn new(store: Arc<dyn BucketStore>, key_ttl: Duration, check_timeout: Duration) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            key_ttl,
            check_timeout,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    async fn check(&self, key: &str, limit: &BucketLimit) -> Result<Acquire> {
        let keys = BucketKeys::new(&self.key_prefix, key);
        let stored = self.store.load(&keys).await?;
        let now = self.clock.now_millis();

        let mut state = BucketState {
            tokens: stored.tokens.unwrap_or(limit.capacity()),
            last_refill_ms: stored.last_refill_ms.unwrap_or(now),
        };

        let outcome = state.try_acquire(limit, now);
        if !outcome.is_granted() {
            return Ok(outcome);
        }

        self.store
            .save(&keys, state.tokens, state.last_refill_ms, self.key_ttl)
            .await?;
        Ok(outcome)
    }
}

#[async_trait]
impl BucketBackend for DistributedBackend {
    async fn acquire(&self, key: &str, limit: &BucketLimit) -> Result<Acquire> {
        match timeout(self.check_timeout, self.check(key, limit)).await {
            Ok(result) => result,
            Err(_) => Err(AdmissionError::BackendTimeout(self.check_timeout)),
        }
    }

    fn tracked_keys(&self) -> Option<usize> {
        None
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }
}
