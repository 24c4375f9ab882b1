use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rate and capacity of one logical bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketLimit {
    pub rate_per_second: f64,
    pub burst: u32,
}

impl BucketLimit {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        Self {
            rate_per_second,
            burst,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.burst as f64
    }
}

/// Result of taking a token from a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    Granted,
    Denied { retry_after: Duration },
}

impl Acquire {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquire::Granted)
    }
}

/// Token count and refill timestamp for a single key.
///
/// `tokens` stays within `0..=burst` and `last_refill_ms` never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A freshly created bucket starts full.
    pub fn full(limit: &BucketLimit, now_ms: u64) -> Self {
        Self {
            tokens: limit.capacity(),
            last_refill_ms: now_ms,
        }
    }

    pub fn refill(&mut self, limit: &BucketLimit, now_ms: u64) {
        // A clock that stepped backwards refills nothing.
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        let tokens_to_add = limit.rate_per_second * (elapsed_ms as f64 / 1000.0);

        self.tokens = (self.tokens + tokens_to_add).min(limit.capacity()).max(0.0);
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
    }

    /// Refill, then take one token if there is one.
    pub fn try_consume(&mut self, limit: &BucketLimit, now_ms: u64) -> bool {
        self.refill(limit, now_ms);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Like [`try_consume`](Self::try_consume), but a denial reports how
    /// long the caller should wait for the next token.
    pub fn try_acquire(&mut self, limit: &BucketLimit, now_ms: u64) -> Acquire {
        if self.try_consume(limit, now_ms) {
            return Acquire::Granted;
        }

        Acquire::Denied {
            retry_after: self.time_until_available(limit).unwrap_or_default(),
        }
    }

    /// How long until one token will be available, given the state as of the last refill.
    pub fn time_until_available(&self, limit: &BucketLimit) -> Option<Duration> {
        if self.tokens >= 1.0 {
            return None;
        }
        if limit.rate_per_second <= 0.0 {
            return Some(Duration::MAX);
        }

        let tokens_needed = 1.0 - self.tokens;
        Some(Duration::from_secs_f64(tokens_needed / limit.rate_per_second))
    }
}
