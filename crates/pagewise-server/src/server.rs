use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use pagewise_cache::{DisabledStore, RateLimiter, RemoteStore, TieredCache, connect_redis};
use serde_json::Value;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::{config::AppConfig, handlers, middleware as app_middleware};

/// Shared handles for every request.
///
/// Routes added by an embedding application read and fill `cache` with
/// `TieredCache::get`; the built-in routes only observe and invalidate it.
#[derive(Clone)]
pub struct AppState {
    pub cache: TieredCache<Value>,
    pub limiter: RateLimiter,
    pub remote: Arc<dyn RemoteStore>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig, remote: Arc<dyn RemoteStore>) -> anyhow::Result<Self> {
        let cache = TieredCache::new(config.cache.clone(), Arc::clone(&remote))?;
        let limiter = RateLimiter::new(config.rate_limit.limiter_config(), Arc::clone(&remote))?;
        Ok(Self {
            cache,
            limiter,
            remote,
            config: Arc::new(config),
        })
    }

    /// State with no shared tier.
    pub fn local(config: AppConfig) -> anyhow::Result<Self> {
        Self::new(config, Arc::new(DisabledStore))
    }

    /// Start the periodic L1 and rate-limit sweeps.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![self.cache.spawn_sweeper(), self.limiter.spawn_sweeper()]
    }
}

pub fn build_app(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;

    let api = Router::new()
        .route("/cache/invalidate", post(handlers::invalidate_cache))
        .route("/cache/{key}", delete(handlers::delete_cache_key))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::rate_limit,
        ));

    Router::new()
        // Health and observability endpoints
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/health/cache", get(handlers::cache_health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api", api)
        // Middleware stack, outermost last: request id wraps trace so the
        // span can read the id
        .layer(middleware::from_fn(app_middleware::track_metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

pub struct ServerBuilder {
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Connect to Redis (falling back to local-only mode) and assemble the
    /// application state.
    pub async fn build(self) -> anyhow::Result<PagewiseServer> {
        let addr = self.config.addr();
        let remote = connect_redis(&self.config.redis).await;
        let state = AppState::new(self.config, remote)?;

        Ok(PagewiseServer { addr, state })
    }
}

pub struct PagewiseServer {
    addr: SocketAddr,
    state: AppState,
}

impl PagewiseServer {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let background = self.state.spawn_background_tasks();
        let app = build_app(self.state);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        for task in background {
            task.abort();
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
