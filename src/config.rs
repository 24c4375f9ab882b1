use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AdmissionError;
use crate::rate_limit_config::{FailurePolicy, RateLimitConfig, ScopeConfig};

/// Process configuration, from flags or `PASTEGATE_*` environment variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "pastegate", version, about = "Admission control service")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "PASTEGATE_BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL, required for the distributed backend
    #[arg(long, env = "PASTEGATE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Keep bucket state in Redis so every process shares it
    #[arg(long, env = "PASTEGATE_DISTRIBUTED", default_value_t = false)]
    pub distributed: bool,

    #[arg(long, env = "PASTEGATE_GLOBAL_ENABLED", default_value_t = false)]
    pub global_enabled: bool,

    #[arg(long, env = "PASTEGATE_GLOBAL_RATE", default_value_t = 100.0)]
    pub global_rate: f64,

    #[arg(long, env = "PASTEGATE_GLOBAL_BURST", default_value_t = 200)]
    pub global_burst: u32,

    #[arg(long, env = "PASTEGATE_CLIENT_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub client_enabled: bool,

    #[arg(long, env = "PASTEGATE_CLIENT_RATE", default_value_t = 2.0)]
    pub client_rate: f64,

    #[arg(long, env = "PASTEGATE_CLIENT_BURST", default_value_t = 5)]
    pub client_burst: u32,

    /// Idle local buckets are evicted after this many seconds
    #[arg(long, env = "PASTEGATE_IDLE_EVICTION_SECS", default_value_t = 60)]
    pub idle_eviction_secs: u64,

    /// Timeout for one distributed check, in milliseconds
    #[arg(long, env = "PASTEGATE_CHECK_TIMEOUT_MS", default_value_t = 200)]
    pub check_timeout_ms: u64,

    /// Expiry of distributed bucket keys, in milliseconds
    #[arg(long, env = "PASTEGATE_KEY_TTL_MS", default_value_t = 1000)]
    pub key_ttl_ms: u64,

    /// `open` admits requests when the store is unreachable, `closed` rejects them
    #[arg(long, env = "PASTEGATE_FAILURE_POLICY", default_value = "open")]
    pub failure_policy: FailurePolicy,

    /// JSON file with a full rate limit section; replaces the limit flags
    #[arg(long, env = "PASTEGATE_LIMITS_FILE")]
    pub limits_file: Option<PathBuf>,

    /// API keys whose holders skip per-client limits
    #[arg(long, env = "PASTEGATE_TRUSTED_API_KEYS", value_delimiter = ',')]
    pub trusted_api_keys: Vec<String>,

    #[arg(long, env = "PASTEGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Rate limit settings from the limits file if given, otherwise from flags.
    pub fn rate_limits(&self) -> Result<RateLimitConfig, AdmissionError> {
        let limits = match &self.limits_file {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    AdmissionError::Configuration(format!(
                        "cannot read limits file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                RateLimitConfig::from_json(&json)?
            }
            None => RateLimitConfig {
                global: ScopeConfig {
                    enabled: self.global_enabled,
                    rate_per_second: self.global_rate,
                    burst: self.global_burst,
                },
                per_client: ScopeConfig {
                    enabled: self.client_enabled,
                    rate_per_second: self.client_rate,
                    burst: self.client_burst,
                },
                use_distributed_backend: self.distributed,
                idle_eviction_interval: Duration::from_secs(self.idle_eviction_secs),
                failure_policy: self.failure_policy,
                check_timeout: Duration::from_millis(self.check_timeout_ms),
                key_ttl: Duration::from_millis(self.key_ttl_ms),
            },
        };

        if limits.use_distributed_backend {
            let url = self.redis_url.as_deref().unwrap_or_default();
            validate_redis_url(url)?;
        }

        limits.check()?;
        Ok(limits)
    }
}

/// Validates a Redis URL
pub fn validate_redis_url(url: &str) -> Result<(), AdmissionError> {
    if url.is_empty() {
        return Err(AdmissionError::Configuration(
            "Redis URL is required for the distributed backend".to_string(),
        ));
    }

    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(AdmissionError::Configuration(
            "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
        ));
    }

    Ok(())
}
