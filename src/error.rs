use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::admission::DenyReason;

/// Errors raised by the admission controller and its backends.
///
/// Exceeding a limit is not an error; it is reported through
/// [`Decision`](crate::admission::Decision).
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("rate limit backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("rate limit backend did not answer within {0:?}")]
    BackendTimeout(Duration),

    #[error("client id '{0}' is reserved")]
    InvalidClientId(String),
}

impl AdmissionError {
    /// True for failures of the shared store, as opposed to startup misconfiguration.
    pub fn is_backend_error(&self) -> bool {
        matches!(
            self,
            AdmissionError::BackendUnavailable(_) | AdmissionError::BackendTimeout(_)
        )
    }
}

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        AdmissionError::BackendUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

/// Errors surfaced over HTTP.
#[derive(Debug, Clone)]
pub enum ApiError {
    InvalidRequest(String),
    RateLimited {
        reason: DenyReason,
        retry_after: Duration,
    },
    ServiceUnavailable(String),
    Internal(String),
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::InvalidClientId(_) => ApiError::InvalidRequest(err.to_string()),
            _ if err.is_backend_error() => ApiError::ServiceUnavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_api_error(err: &ApiError) -> Self {
        match err {
            ApiError::InvalidRequest(msg) => Self::new("bad_request", msg, 400),
            ApiError::RateLimited { reason, .. } => {
                Self::new(reason.as_code(), reason.message(), 429)
            }
            ApiError::ServiceUnavailable(msg) => Self::new("service_unavailable", msg, 503),
            ApiError::Internal(msg) => Self::new("internal_error", msg, 500),
        }
    }
}

/// Whole seconds for a `Retry-After` header, never less than one.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs_f64().ceil();
    if secs.is_finite() && secs >= 1.0 {
        secs.min(u32::MAX as f64) as u64
    } else {
        1
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_api_error(&self);
        let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(body)).into_response();

        if let ApiError::RateLimited { retry_after, .. } = self {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(retry_after)),
            );
        }

        response
    }
}
