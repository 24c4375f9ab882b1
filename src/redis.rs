use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::time::Duration;

use crate::error::{AdmissionError, Result};
use crate::store::{BucketKeys, BucketStore, StoredBucket};

/// [`BucketStore`] backed by Redis.
///
/// Holds one multiplexed connection; clones of it share the underlying socket,
/// so concurrent checks pipeline over it instead of queueing on a lock.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            AdmissionError::Configuration(format!("invalid Redis URL '{}': {}", redis_url, e))
        })?;

        let connection = client.get_multiplexed_async_connection().await.map_err(|e| {
            AdmissionError::BackendUnavailable(format!("failed to connect to Redis: {}", e))
        })?;

        tracing::info!(target: "pastegate::redis", redis_url, "connected to Redis");
        Ok(Self { connection })
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn load(&self, keys: &BucketKeys) -> Result<StoredBucket> {
        let mut conn = self.connection.clone();

        let (tokens, last_refill_ms): (Option<f64>, Option<u64>) = redis::pipe()
            .get(&keys.tokens)
            .get(&keys.timestamp)
            .query_async(&mut conn)
            .await?;

        Ok(StoredBucket {
            tokens,
            last_refill_ms,
        })
    }

    async fn save(
        &self,
        keys: &BucketKeys,
        tokens: f64,
        last_refill_ms: u64,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.connection.clone();
        // PX takes a signed 64-bit count.
        let ttl_ms = u64::try_from(ttl.as_millis())
            .unwrap_or(u64::MAX)
            .clamp(1, i64::MAX as u64);

        redis::pipe()
            .cmd("SET")
            .arg(&keys.tokens)
            .arg(tokens)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .cmd("SET")
            .arg(&keys.timestamp)
            .arg(last_refill_ms)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
