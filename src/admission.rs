use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::backend::{BackendKind, BucketBackend, DistributedBackend, LocalBackend};
use crate::clock::{Clock, SystemClock};
use crate::error::{AdmissionError, Result};
use crate::rate_limit_config::{FailurePolicy, RateLimitConfig};
use crate::reclaimer::Reclaimer;
use crate::store::BucketStore;
use crate::token_bucket::{Acquire, BucketLimit};

/// Bucket key shared by every client for the global scope.
pub const GLOBAL_KEY: &str = "global";

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    None,
    GlobalExceeded,
    PerClientExceeded,
}

impl DenyReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            DenyReason::None => "none",
            DenyReason::GlobalExceeded => "global_rate_limit_exceeded",
            DenyReason::PerClientExceeded => "client_rate_limit_exceeded",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::None => "Request admitted",
            DenyReason::GlobalExceeded => {
                "The service is receiving too many requests right now, please retry shortly"
            }
            DenyReason::PerClientExceeded => {
                "Too many requests from this client, please slow down"
            }
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DenyReason,
    /// Time until the exhausted bucket holds a token again; `None` when allowed.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: DenyReason::None,
            retry_after: None,
        }
    }

    pub fn deny(reason: DenyReason, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            reason,
            retry_after: Some(retry_after),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub backend: BackendKind,
    pub global_enabled: bool,
    pub per_client_enabled: bool,
    /// `None` for the distributed backend, whose buckets live in the store.
    pub tracked_buckets: Option<usize>,
}

/// Global and per-client token buckets in front of a single backend.
///
/// Built once at startup and shared with the HTTP layer through an `Arc`.
pub struct AdmissionController {
    global: Option<BucketLimit>,
    per_client: Option<BucketLimit>,
    backend: Arc<dyn BucketBackend>,
    local: Option<Arc<LocalBackend>>,
    failure_policy: FailurePolicy,
    idle_eviction_interval: Duration,
    check_timeout: Duration,
}

impl AdmissionController {
    /// Build a controller from validated settings.
    ///
    /// Fails when the distributed backend is requested without a store.
    pub fn new(config: &RateLimitConfig, store: Option<Arc<dyn BucketStore>>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &RateLimitConfig,
        store: Option<Arc<dyn BucketStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.check()?;

        let (backend, local) = if config.use_distributed_backend {
            let store = store.ok_or_else(|| {
                AdmissionError::Configuration(
                    "distributed rate limiting selected but no store was supplied".to_string(),
                )
            })?;
            let distributed = DistributedBackend::new(store, config.key_ttl, config.check_timeout)
                .with_clock(clock);
            (Arc::new(distributed) as Arc<dyn BucketBackend>, None)
        } else {
            let local = Arc::new(LocalBackend::with_clock(clock));
            (local.clone() as Arc<dyn BucketBackend>, Some(local))
        };

        Ok(Self {
            global: config.global.limit(),
            per_client: config.per_client.limit(),
            backend,
            local,
            failure_policy: config.failure_policy,
            idle_eviction_interval: config.idle_eviction_interval,
            check_timeout: config.check_timeout,
        })
    }

    /// Decide whether a request from `client_id` may proceed.
    ///
    /// The global bucket is consulted first and a denial there skips the
    /// per-client bucket. `trusted` callers are exempt from the per-client
    /// bucket only.
    ///
    /// Both scopes share the backend's key space, so [`GLOBAL_KEY`] is refused
    /// as a client id rather than letting a client drain the global bucket.
    pub async fn check(&self, client_id: &str, trusted: bool) -> Result<Decision> {
        if client_id == GLOBAL_KEY {
            return Err(AdmissionError::InvalidClientId(client_id.to_string()));
        }

        if let Some(limit) = &self.global {
            if let Acquire::Denied { retry_after } = self.backend.acquire(GLOBAL_KEY, limit).await? {
                debug!(client_id, reason = "global", "request denied");
                return Ok(Decision::deny(DenyReason::GlobalExceeded, retry_after));
            }
        }

        if let (Some(limit), false) = (&self.per_client, trusted) {
            if let Acquire::Denied { retry_after } = self.backend.acquire(client_id, limit).await? {
                debug!(client_id, reason = "per_client", "request denied");
                return Ok(Decision::deny(DenyReason::PerClientExceeded, retry_after));
            }
        }

        Ok(Decision::allow())
    }

    /// Bound applied to each round trip to the distributed store.
    pub fn check_timeout(&self) -> Duration {
        self.check_timeout
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// The in-memory backend, when one is in use.
    pub fn local_backend(&self) -> Option<&Arc<LocalBackend>> {
        self.local.as_ref()
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            backend: self.backend.kind(),
            global_enabled: self.global.is_some(),
            per_client_enabled: self.per_client.is_some(),
            tracked_buckets: self.backend.tracked_keys(),
        }
    }

    /// Start sweeping idle local buckets. The distributed backend expires its
    /// keys in the store, so there is nothing to sweep and this returns `None`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_reclaimer(&self) -> Option<Reclaimer> {
        self.local
            .as_ref()
            .map(|local| Reclaimer::spawn(local.clone(), self.idle_eviction_interval))
    }
}
