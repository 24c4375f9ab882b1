use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::rate_limit_config::FailurePolicy;
use crate::server::AppState;
use crate::validation::RequestValidator;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const API_KEY_HEADER: &str = "x-api-key";

/// Request extension set by an upstream authentication layer for callers
/// holding a validated credential. Such callers skip the per-client bucket.
#[derive(Debug, Clone, Copy)]
pub struct TrustedClient;

/// Who is asking, as far as admission control is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub trusted: bool,
}

impl ClientIdentity {
    pub fn from_request(request: &Request, state: &AppState) -> Self {
        let trusted = request.extensions().get::<TrustedClient>().is_some()
            || request
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|key| state.trusted_api_keys.contains(key));

        Self {
            client_id: get_client_ip(request),
            trusted,
        }
    }
}

/// Admission control in front of a router.
///
/// Denials become 429 with a `Retry-After` header and a body naming the
/// exhausted scope. When the backend cannot answer, the configured
/// [`FailurePolicy`] decides between letting the request through and a 503.
pub async fn admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let identity = ClientIdentity::from_request(&request, &state);
    let controller = &state.controller;

    match controller.check(&identity.client_id, identity.trusted).await {
        Ok(decision) if decision.allowed => next.run(request).await,
        Ok(decision) => ApiError::RateLimited {
            reason: decision.reason,
            retry_after: decision.retry_after.unwrap_or(Duration::from_secs(1)),
        }
        .into_response(),
        Err(e) if !e.is_backend_error() => ApiError::from(e).into_response(),
        Err(e) => match controller.failure_policy() {
            FailurePolicy::Open => {
                warn!(
                    target: "pastegate::middleware",
                    client_id = %identity.client_id,
                    error = %e,
                    "admission backend failed, failing open"
                );
                next.run(request).await
            }
            FailurePolicy::Closed => {
                warn!(
                    target: "pastegate::middleware",
                    client_id = %identity.client_id,
                    error = %e,
                    "admission backend failed, failing closed"
                );
                ApiError::ServiceUnavailable(
                    "Admission control is temporarily unavailable".to_string(),
                )
                .into_response()
            }
        },
    }
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = get_client_ip(&request);

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        target: "pastegate::middleware",
        %request_id,
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    let status = response.status();
    info!(
        target: "pastegate::middleware",
        %request_id,
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Client address for bucketing and logs.
///
/// Proxy headers are taken only when they carry a well-formed client id, so a
/// forged value such as the global bucket's key falls through to the next source.
pub fn get_client_ip(request: &Request) -> String {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim);
    let real_ip = request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    if let Some(ip) = [forwarded, real_ip]
        .into_iter()
        .flatten()
        .find(|ip| RequestValidator::validate_client_id(ip).is_ok())
    {
        return ip.to_string();
    }

    // Fallback to connection info
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    if let Some(addr) = request.extensions().get::<SocketAddr>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}
