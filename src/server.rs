use axum::routing::{get, post};
use axum::{middleware, Router};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::error::Result;
use crate::handlers::{check_admission, health_check, stats};
use crate::middleware::{admission_middleware, logging_middleware};
use crate::redis::RedisStore;
use crate::store::BucketStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<AdmissionController>,
    pub store: Option<Arc<dyn BucketStore>>,
    pub trusted_api_keys: Arc<HashSet<String>>,
}

impl AppState {
    pub fn new(controller: AdmissionController, store: Option<Arc<dyn BucketStore>>) -> Self {
        Self {
            controller: Arc::new(controller),
            store,
            trusted_api_keys: Arc::new(HashSet::new()),
        }
    }

    pub fn with_trusted_api_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_api_keys = Arc::new(keys.into_iter().map(Into::into).collect());
        self
    }
}

/// Put admission control in front of every route of `router`.
pub fn protect<S>(router: Router<S>, state: AppState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(state, admission_middleware))
}

/// Routes of the standalone decision service.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/admission/check", post(check_admission))
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    config: Config,
    state: AppState,
}

impl Server {
    /// Connect to the store if one is configured and build the controller.
    pub async fn new(config: Config) -> Result<Self> {
        let limits = config.rate_limits()?;

        let store: Option<Arc<dyn BucketStore>> = match &config.redis_url {
            Some(url) if limits.use_distributed_backend => {
                Some(Arc::new(RedisStore::connect(url).await?))
            }
            _ => None,
        };

        let controller = AdmissionController::new(&limits, store.clone())?;
        tracing::info!(
            backend = controller.backend_kind().as_str(),
            global = limits.global.enabled,
            per_client = limits.per_client.enabled,
            failure_policy = ?limits.failure_policy,
            "admission controller ready"
        );

        let state = AppState::new(controller, store)
            .with_trusted_api_keys(config.trusted_api_keys.iter().cloned());

        Ok(Self { config, state })
    }

    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let reclaimer = self.state.controller.spawn_reclaimer();
        let app = create_app(self.state);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        tracing::info!("pastegate listening on {}", self.config.bind_addr);
        tracing::info!("Health check available at /health");

        // Run server with graceful shutdown
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        if let Some(reclaimer) = reclaimer {
            reclaimer.shutdown().await;
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
