use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use pagewise_cache::{CacheError, CacheMetrics};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::server::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadyResponse {
    status: &'static str,
    remote: &'static str,
    remote_reachable: bool,
    rate_limit_scope: &'static str,
}

/// Readiness never fails on the shared tier: without it the process runs in
/// local-only mode and reports `degraded`.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let remote_reachable = state.remote.is_enabled() && state.remote.ping().await.is_ok();
    let status = if state.remote.is_enabled() && !remote_reachable {
        "degraded"
    } else {
        "ready"
    };
    let rate_limit_scope = if state.limiter.is_degraded() {
        "local"
    } else {
        "global"
    };

    (
        StatusCode::OK,
        Json(ReadyResponse {
            status,
            remote: state.remote.name(),
            remote_reachable,
            rate_limit_scope,
        }),
    )
}

pub async fn cache_health(State(state): State<AppState>) -> Json<CacheMetrics> {
    Json(state.cache.metrics())
}

pub async fn metrics() -> impl IntoResponse {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

/// Body for `POST /api/cache/invalidate`: exactly one of `key` or `pattern`.
#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub key: Option<String>,
    pub pattern: Option<String>,
}

pub async fn invalidate_cache(
    State(state): State<AppState>,
    Json(body): Json<InvalidateRequest>,
) -> impl IntoResponse {
    match (body.key, body.pattern) {
        (Some(key), None) => match state.cache.delete(&key).await {
            Ok(()) => (
                StatusCode::OK,
                Json(json!({ "invalidated": "key", "key": key })),
            ),
            Err(e) => cache_error(&e),
        },
        (None, Some(pattern)) if !pattern.is_empty() => {
            let removed = state.cache.invalidate_pattern(&pattern);
            (
                StatusCode::OK,
                Json(json!({
                    "invalidated": "pattern",
                    "pattern": pattern,
                    "removed": removed,
                })),
            )
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_request",
                "message": "provide exactly one of `key` or `pattern`",
            })),
        ),
    }
}

pub async fn delete_cache_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.cache.delete(&key).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => cache_error(&e).into_response(),
    }
}

fn cache_error(err: &CacheError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        CacheError::InvalidKey => StatusCode::BAD_REQUEST,
        CacheError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        CacheError::Fetch { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(json!({ "error": "cache_error", "message": err.to_string() })),
    )
}
