use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use tower::ServiceExt;

use pastegate::clock::ManualClock;
use pastegate::middleware::TrustedClient;
use pastegate::store::{BucketKeys, BucketStore, MemoryStore, StoredBucket};
use pastegate::{
    create_app, protect, AdmissionController, AdmissionError, AppState, FailurePolicy,
    RateLimitConfig, ScopeConfig,
};

fn limits(global: ScopeConfig, per_client: ScopeConfig) -> RateLimitConfig {
    RateLimitConfig {
        global,
        per_client,
        ..Default::default()
    }
}

fn local_state(config: &RateLimitConfig) -> (Arc<ManualClock>, AppState) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let controller = AdmissionController::with_clock(config, None, clock.clone()).unwrap();
    (clock, AppState::new(controller, None))
}

fn protected_app(state: AppState) -> Router {
    protect(Router::new().route("/paste", get(|| async { "ok" })), state)
}

fn paste_request(ip: &str) -> Request<Body> {
    Request::builder()
        .uri("/paste")
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

struct UnreachableStore;

#[async_trait]
impl BucketStore for UnreachableStore {
    async fn load(&self, _keys: &BucketKeys) -> pastegate::Result<StoredBucket> {
        Err(AdmissionError::BackendUnavailable("connection refused".into()))
    }

    async fn save(&self, _: &BucketKeys, _: f64, _: u64, _: Duration) -> pastegate::Result<()> {
        Err(AdmissionError::BackendUnavailable("connection refused".into()))
    }

    async fn ping(&self) -> pastegate::Result<()> {
        Err(AdmissionError::BackendUnavailable("connection refused".into()))
    }
}

fn unreachable_state(policy: FailurePolicy) -> AppState {
    let config = RateLimitConfig {
        use_distributed_backend: true,
        failure_policy: policy,
        ..Default::default()
    };
    let store: Arc<dyn BucketStore> = Arc::new(UnreachableStore);
    let controller = AdmissionController::new(&config, Some(store.clone())).unwrap();
    AppState::new(controller, Some(store))
}

#[tokio::test]
async fn test_per_client_limit_returns_429_then_recovers() {
    let config = limits(ScopeConfig::disabled(), ScopeConfig::new(2.0, 5));
    let (clock, state) = local_state(&config);
    let app = protected_app(state);

    for _ in 0..5 {
        let response = app.clone().oneshot(paste_request("10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.clone().oneshot(paste_request("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    let body = json_body(response).await;
    assert_eq!(body["error"], "client_rate_limit_exceeded");
    assert_eq!(body["code"], 429);

    // Another client is unaffected.
    let response = app.clone().oneshot(paste_request("10.0.0.2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    clock.advance(Duration::from_millis(500));
    let response = app.oneshot(paste_request("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_global_limit_rejects_other_clients() {
    let config = limits(ScopeConfig::new(1.0, 1), ScopeConfig::new(100.0, 100));
    let (_clock, state) = local_state(&config);
    let app = protected_app(state);

    let response = app.clone().oneshot(paste_request("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(paste_request("10.0.0.9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["error"], "global_rate_limit_exceeded");
}

#[tokio::test]
async fn test_trusted_callers_skip_per_client_limit() {
    let config = limits(ScopeConfig::disabled(), ScopeConfig::new(1.0, 1));
    let (_clock, state) = local_state(&config);
    let app = protected_app(state.with_trusted_api_keys(["secret-key"]));

    for _ in 0..3 {
        let request = Request::builder()
            .uri("/paste")
            .header("x-forwarded-for", "10.0.0.1")
            .header("x-api-key", "secret-key")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let mut request = paste_request("10.0.0.3");
    request.extensions_mut().insert(TrustedClient);
    assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);
    let mut request = paste_request("10.0.0.3");
    request.extensions_mut().insert(TrustedClient);
    assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);

    // A wrong key is just another client.
    let request = Request::builder()
        .uri("/paste")
        .header("x-forwarded-for", "10.0.0.2")
        .header("x-api-key", "guess")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);
    let response = app.oneshot(paste_request("10.0.0.2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_unreachable_store_fails_open() {
    let app = protected_app(unreachable_state(FailurePolicy::Open));

    let response = app.oneshot(paste_request("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unreachable_store_fails_closed() {
    let app = protected_app(unreachable_state(FailurePolicy::Closed));

    let response = app.oneshot(paste_request("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"], "service_unavailable");
}

#[tokio::test]
async fn test_check_endpoint() {
    let config = limits(ScopeConfig::disabled(), ScopeConfig::new(1.0, 1));
    let (_clock, state) = local_state(&config);
    let app = create_app(state);

    let check = |client_id: &str| {
        Request::builder()
            .method("POST")
            .uri("/admission/check")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "client_id": client_id }).to_string()))
            .unwrap()
    };

    let response = app.clone().oneshot(check("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["reason"], "none");

    let response = app.clone().oneshot(check("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["allowed"], false);
    assert_eq!(body["reason"], "per_client_exceeded");

    let response = app.oneshot(check("not valid!")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_check_endpoint_reports_backend_error() {
    let app = create_app(unreachable_state(FailurePolicy::Open));

    let request = Request::builder()
        .method("POST")
        .uri("/admission/check")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"client_id":"10.0.0.1"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_health_and_stats() {
    let config = limits(ScopeConfig::new(10.0, 10), ScopeConfig::new(1.0, 1));
    let (_clock, state) = local_state(&config);
    let app = create_app(state.clone());

    assert_ok!(state.controller.check("10.0.0.1", false).await);
    assert_ok!(state.controller.check("10.0.0.2", false).await);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["backend"], "local");

    let response = app
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(response).await;
    // "global" plus two clients.
    assert_eq!(body["tracked_buckets"], 3);
    assert_eq!(body["failure_policy"], "open");
}

#[tokio::test]
async fn test_health_degraded_when_store_down() {
    let app = create_app(unreachable_state(FailurePolicy::Open));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["store_reachable"], false);
}

#[tokio::test]
async fn test_prefork_processes_share_distributed_buckets() {
    let clock = Arc::new(ManualClock::new(0));
    let store: Arc<dyn BucketStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
    let config = RateLimitConfig {
        use_distributed_backend: true,
        ..limits(ScopeConfig::disabled(), ScopeConfig::new(1.0, 2))
    };

    let workers: Vec<Router> = (0..2)
        .map(|_| {
            let controller =
                AdmissionController::with_clock(&config, Some(store.clone()), clock.clone())
                    .unwrap();
            protected_app(AppState::new(controller, Some(store.clone())))
        })
        .collect();

    let first = workers[0].clone().oneshot(paste_request("10.0.0.1")).await.unwrap();
    let second = workers[1].clone().oneshot(paste_request("10.0.0.1")).await.unwrap();
    let third = workers[0].clone().oneshot(paste_request("10.0.0.1")).await.unwrap();

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_idle_buckets_are_reclaimed() {
    let config = RateLimitConfig {
        idle_eviction_interval: Duration::from_millis(20),
        ..limits(ScopeConfig::disabled(), ScopeConfig::new(1.0, 1))
    };
    let (clock, state) = local_state(&config);
    let controller = state.controller.clone();
    let reclaimer = controller.spawn_reclaimer().unwrap();

    assert!(controller.check("10.0.0.1", false).await.unwrap().allowed);
    assert!(!controller.check("10.0.0.1", false).await.unwrap().allowed);
    assert_eq!(controller.stats().tracked_buckets, Some(1));

    clock.advance(Duration::from_secs(1));
    let mut waited = 0;
    while controller.stats().tracked_buckets != Some(0) && waited < 100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    reclaimer.shutdown().await;

    assert_eq!(controller.stats().tracked_buckets, Some(0));
    // Back as a full bucket.
    assert!(controller.check("10.0.0.1", false).await.unwrap().allowed);
}

#[tokio::test]
async fn test_forged_global_header_cannot_drain_global_bucket() {
    let config = limits(ScopeConfig::new(100.0, 200), ScopeConfig::new(2.0, 5));
    let (_clock, state) = local_state(&config);
    let app = protected_app(state.clone());

    let response = app.clone().oneshot(paste_request("global")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    for i in 0..20 {
        let ip = format!("10.0.2.{}", i);
        let response = app.clone().oneshot(paste_request(&ip)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "client {} was denied", ip);
    }

    // The forged request was bucketed under the fallback identity instead.
    let local = state.controller.local_backend().unwrap();
    assert!(local.contains("unknown"));
}

#[tokio::test]
async fn test_malformed_forwarded_header_falls_back() {
    let config = limits(ScopeConfig::disabled(), ScopeConfig::new(1.0, 1));
    let (_clock, state) = local_state(&config);
    let app = protected_app(state.clone());

    let request = Request::builder()
        .uri("/paste")
        .header("x-forwarded-for", "not valid!")
        .header("x-real-ip", "203.0.113.5")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);

    let local = state.controller.local_backend().unwrap();
    assert!(local.contains("203.0.113.5"));
    assert!(!local.contains("not valid!"));

    let response = app.oneshot(paste_request("203.0.113.5")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_retry_after_counts_down_with_bucket_state() {
    let config = limits(ScopeConfig::disabled(), ScopeConfig::new(0.25, 1));
    let (clock, state) = local_state(&config);
    let app = protected_app(state);

    let response = app.clone().oneshot(paste_request("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(paste_request("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "4");

    clock.advance(Duration::from_secs(1));
    let response = app.oneshot(paste_request("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "3");
}

struct StalledStore;

#[async_trait]
impl BucketStore for StalledStore {
    async fn load(&self, _keys: &BucketKeys) -> pastegate::Result<StoredBucket> {
        Ok(StoredBucket::default())
    }

    async fn save(&self, _: &BucketKeys, _: f64, _: u64, _: Duration) -> pastegate::Result<()> {
        Ok(())
    }

    async fn ping(&self) -> pastegate::Result<()> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_health_degraded_when_store_stalls() {
    let config = RateLimitConfig {
        use_distributed_backend: true,
        check_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let store: Arc<dyn BucketStore> = Arc::new(StalledStore);
    let controller = AdmissionController::new(&config, Some(store.clone())).unwrap();
    let app = create_app(AppState::new(controller, Some(store)));

    let started = std::time::Instant::now();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let body = json_body(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["store_reachable"], false);
}
