pub mod admission;
pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod rate_limit_config;
pub mod reclaimer;
pub mod redis;
pub mod response;
pub mod server;
pub mod store;
pub mod token_bucket;
pub mod validation;

pub use admission::{AdmissionController, Decision, DenyReason};
pub use config::Config;
pub use error::{AdmissionError, ApiError, Result};
pub use rate_limit_config::{FailurePolicy, RateLimitConfig, ScopeConfig};
pub use server::{create_app, protect, AppState};
