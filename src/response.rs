use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::admission::{AdmissionStats, Decision, DenyReason};
use crate::backend::BackendKind;

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub client_id: String,
    #[serde(default)]
    pub trusted: bool,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub reason: DenyReason,
    pub message: String,
}

impl From<Decision> for CheckResponse {
    fn from(decision: Decision) -> Self {
        Self {
            allowed: decision.allowed,
            reason: decision.reason,
            message: decision.reason.message().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub backend: BackendKind,
    pub store_reachable: Option<bool>,
}

impl HealthResponse {
    /// `store_reachable` is `None` for the local backend, which has no store.
    pub fn new(backend: BackendKind, store_reachable: Option<bool>) -> Self {
        let status = if store_reachable == Some(false) {
            "degraded"
        } else {
            "healthy"
        };

        Self {
            status: status.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            backend,
            store_reachable,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: AdmissionStats,
    pub failure_policy: crate::rate_limit_config::FailurePolicy,
}
