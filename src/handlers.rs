use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use tokio::time::timeout;
use tracing::warn;

use crate::error::ApiError;
use crate::response::{CheckRequest, CheckResponse, HealthResponse, StatsResponse};
use crate::server::AppState;
use crate::validation::RequestValidator;

/// Ask for an admission decision on behalf of another service.
///
/// Backend failures are reported as 503 regardless of the failure policy;
/// the caller owns the decision of what to do with them.
pub async fn check_admission(
    State(state): State<AppState>,
    Json(payload): Json<CheckRequest>,
) -> Result<impl IntoResponse, ApiError> {
    RequestValidator::validate_client_id(&payload.client_id)?;

    let decision = state
        .controller
        .check(&payload.client_id, payload.trusted)
        .await
        .map_err(|e| {
            warn!(client_id = %payload.client_id, error = %e, "admission check failed");
            ApiError::from(e)
        })?;

    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    Ok((status, Json(CheckResponse::from(decision))))
}

/// Health check endpoint
///
/// The store ping is bounded by the same timeout as an admission check, so a
/// stalled store reports as degraded instead of hanging the health check.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_reachable = match &state.store {
        Some(store) => Some(matches!(
            timeout(state.controller.check_timeout(), store.ping()).await,
            Ok(Ok(()))
        )),
        None => None,
    };

    Json(HealthResponse::new(
        state.controller.backend_kind(),
        store_reachable,
    ))
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse {
        stats: state.controller.stats(),
        failure_policy: state.controller.failure_policy(),
    })
}

