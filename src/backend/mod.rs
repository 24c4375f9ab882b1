//! Token bucket backends.
//!
//! Both backends run the same refill-then-consume algorithm from
//! [`token_bucket`](crate::token_bucket); they differ only in where bucket
//! state lives. [`LocalBackend`] keeps it in process memory, while
//! [`DistributedBackend`] keeps it in a [`BucketStore`](crate::store::BucketStore)
//! shared by every process of a prefork deployment.

pub mod distributed;
pub mod local;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::token_bucket::{Acquire, BucketLimit};

pub use distributed::DistributedBackend;
pub use local::LocalBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Distributed,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Distributed => "distributed",
        }
    }
}

/// A keyed token bucket.
#[async_trait]
pub trait BucketBackend: Send + Sync {
    /// Refill the bucket for `key` and take one token from it.
    ///
    /// An empty bucket is `Acquire::Denied`, carrying the wait until its next
    /// token. Errors are reserved for a backend that could not answer.
    async fn acquire(&self, key: &str, limit: &BucketLimit) -> Result<Acquire>;

    async fn allow(&self, key: &str, limit: &BucketLimit) -> Result<bool> {
        Ok(self.acquire(key, limit).await?.is_granted())
    }

    /// Number of buckets held in memory, if the backend holds any.
    fn tracked_keys(&self) -> Option<usize>;

    fn kind(&self) -> BackendKind;
}
