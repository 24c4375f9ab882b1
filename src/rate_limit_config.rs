use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::AdmissionError;
use crate::token_bucket::BucketLimit;

/// Limits for one scope (global or per-client).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct ScopeConfig {
    pub enabled: bool,
    #[validate(range(exclusive_min = 0.0))]
    pub rate_per_second: f64,
    #[validate(range(min = 1))]
    pub burst: u32,
}

impl ScopeConfig {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        Self {
            enabled: true,
            rate_per_second,
            burst,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(1.0, 1)
        }
    }

    /// The bucket parameters, or `None` when the scope is switched off.
    pub fn limit(&self) -> Option<BucketLimit> {
        self.enabled
            .then(|| BucketLimit::new(self.rate_per_second, self.burst))
    }
}

/// What a check does when the distributed store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through.
    #[default]
    Open,
    /// Reject the request.
    Closed,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(FailurePolicy::Open),
            "closed" => Ok(FailurePolicy::Closed),
            other => Err(format!(
                "unknown failure policy '{}', expected 'open' or 'closed'",
                other
            )),
        }
    }
}

/// Admission control settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitConfig {
    #[validate(nested)]
    pub global: ScopeConfig,
    #[validate(nested)]
    pub per_client: ScopeConfig,
    pub use_distributed_backend: bool,
    /// Local buckets idle for longer than this are dropped; also the sweep period.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub idle_eviction_interval: Duration,
    pub failure_policy: FailurePolicy,
    /// Upper bound on one distributed check, round trips included.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub check_timeout: Duration,
    /// Expiry placed on distributed bucket keys at every write.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub key_ttl: Duration,
}

fn non_zero_duration(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    Ok(())
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: ScopeConfig {
                enabled: false,
                ..ScopeConfig::new(100.0, 200)
            },
            per_client: ScopeConfig::new(2.0, 5),
            use_distributed_backend: false,
            idle_eviction_interval: Duration::from_secs(60),
            failure_policy: FailurePolicy::Open,
            check_timeout: Duration::from_millis(200),
            key_ttl: Duration::from_secs(1),
        }
    }
}

impl RateLimitConfig {
    /// Validate and turn the result into a startup error.
    pub fn check(&self) -> Result<(), AdmissionError> {
        self.validate()
            .map_err(|e| AdmissionError::Configuration(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, AdmissionError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AdmissionError::Configuration(format!("invalid limits: {}", e)))?;
        config.check()?;
        Ok(config)
    }
}
