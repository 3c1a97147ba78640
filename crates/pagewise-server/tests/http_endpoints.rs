use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
};
use pagewise_cache::{CacheOptions, MemoryStore};
use pagewise_server::{AppConfig, AppState, build_app};
use serde_json::{Value, json};
use tower::ServiceExt; // for `oneshot`

fn app_with(state: &AppState) -> Router {
    build_app(state.clone())
}

async fn body_json(res: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn peer(client: &str) -> ConnectInfo<SocketAddr> {
    let ip: IpAddr = client.parse().expect("client ip");
    ConnectInfo(SocketAddr::new(ip, 40_000))
}

fn delete_key(key: &str, client: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(format!("/api/cache/{key}"))
        .extension(peer(client))
        .body(Body::empty())
        .unwrap()
}

fn delete_key_forwarded(key: &str, client: &str, forwarded_for: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(format!("/api/cache/{key}"))
        .extension(peer(client))
        .header("x-forwarded-for", forwarded_for)
        .body(Body::empty())
        .unwrap()
}

fn invalidate(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/cache/invalidate")
        .header("content-type", "application/json")
        .extension(peer("198.51.100.1"))
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn healthz_returns_ok_with_request_id() {
    let state = AppState::local(AppConfig::default()).unwrap();
    let res = app_with(&state)
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-request-id"));
    assert_eq!(body_json(res).await["status"], "ok");
}

#[tokio::test]
async fn readyz_reports_local_mode_without_redis() {
    let state = AppState::local(AppConfig::default()).unwrap();
    let res = app_with(&state)
        .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["remote"], "disabled");
    assert_eq!(body["rateLimitScope"], "local");
}

#[tokio::test]
async fn readyz_reports_degraded_when_remote_is_down() {
    let store = MemoryStore::new();
    store.set_available(false);
    let state = AppState::new(AppConfig::default(), Arc::new(store)).unwrap();

    let res = app_with(&state)
        .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    // Still serving, just without the shared tier.
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["remoteReachable"], false);
}

#[tokio::test]
async fn cache_health_exposes_metrics() {
    let state = AppState::local(AppConfig::default()).unwrap();
    state
        .cache
        .set("page:home", json!({"title": "Home"}), &CacheOptions::new())
        .await
        .unwrap();

    let res = app_with(&state)
        .oneshot(Request::get("/health/cache").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["l1Entries"], 1);
    assert_eq!(body["l1Pending"], 0);
    assert_eq!(body["remoteEnabled"], false);
    assert!(body["stats"]["totalRequests"].is_number());
}

#[tokio::test]
async fn invalidate_by_pattern_and_key() {
    let state = AppState::local(AppConfig::default()).unwrap();
    let opts = CacheOptions::new();
    for key in ["page:a", "page:b", "qa:a"] {
        state.cache.set(key, json!(key), &opts).await.unwrap();
    }

    let res = app_with(&state)
        .oneshot(invalidate(json!({"pattern": "page:*"})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["removed"], 2);

    let res = app_with(&state)
        .oneshot(invalidate(json!({"key": "qa:a"})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(state.cache.metrics().l1_entries, 0);
}

#[tokio::test]
async fn invalidate_requires_exactly_one_target() {
    let state = AppState::local(AppConfig::default()).unwrap();

    for body in [json!({}), json!({"key": "a", "pattern": "b*"})] {
        let res = app_with(&state).oneshot(invalidate(body)).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn delete_is_idempotent_over_http() {
    let state = AppState::local(AppConfig::default()).unwrap();
    state
        .cache
        .set("page:x", json!(1), &CacheOptions::new())
        .await
        .unwrap();

    for _ in 0..2 {
        let res = app_with(&state)
            .oneshot(delete_key("page:x", "198.51.100.2"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }
    assert_eq!(state.cache.metrics().l1_entries, 0);
}

#[tokio::test]
async fn rate_limit_rejects_with_retry_after() {
    let mut config = AppConfig::default();
    config.rate_limit.limit = 2;
    config.rate_limit.window_seconds = 60;
    let state = AppState::local(config).unwrap();

    let mut statuses = Vec::new();
    let mut last = None;
    for _ in 0..3 {
        let res = app_with(&state)
            .oneshot(delete_key("page:y", "203.0.113.9"))
            .await
            .unwrap();
        statuses.push(res.status());
        last = Some(res);
    }
    assert_eq!(
        statuses,
        vec![
            StatusCode::NO_CONTENT,
            StatusCode::NO_CONTENT,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );

    let rejected = last.unwrap();
    let headers = rejected.headers();
    let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(headers["x-ratelimit-limit"], "2");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    assert_eq!(headers["x-ratelimit-scope"], "local");
    assert_eq!(body_json(rejected).await["error"], "rate_limited");

    // Another client has its own window.
    let other = app_with(&state)
        .oneshot(delete_key("page:y", "203.0.113.10"))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::NO_CONTENT);
    assert_eq!(other.headers()["x-ratelimit-remaining"], "1");
}

#[tokio::test]
async fn rotating_forwarded_for_does_not_escape_the_limit() {
    let mut config = AppConfig::default();
    config.rate_limit.limit = 1;
    let state = AppState::local(config).unwrap();

    let mut statuses = Vec::new();
    for i in 0..5 {
        let res = app_with(&state)
            .oneshot(delete_key_forwarded("k", "198.51.100.7", &format!("spoof-{i}")))
            .await
            .unwrap();
        statuses.push(res.status().as_u16());
    }

    assert_eq!(statuses, vec![204, 429, 429, 429, 429]);
    assert_eq!(state.limiter.local_entries(), 1);
}

#[tokio::test]
async fn trusted_forwarded_for_keys_by_client_ip() {
    let mut config = AppConfig::default();
    config.rate_limit.limit = 1;
    config.rate_limit.trust_forwarded_for = true;
    let state = AppState::local(config).unwrap();

    let first = app_with(&state)
        .oneshot(delete_key_forwarded("k", "10.0.0.2", "203.0.113.20"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::NO_CONTENT);

    // Same forwarded client through another proxy hop.
    let second = app_with(&state)
        .oneshot(delete_key_forwarded("k", "10.0.0.3", "203.0.113.20"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

    // Garbage falls back to the peer address, which is still limited.
    let mut statuses = Vec::new();
    for spoof in ["spoof-a", "spoof-b"] {
        let res = app_with(&state)
            .oneshot(delete_key_forwarded("k", "10.0.0.4", spoof))
            .await
            .unwrap();
        statuses.push(res.status().as_u16());
    }
    assert_eq!(statuses, vec![204, 429]);
    assert_eq!(state.limiter.local_entries(), 2);
}

#[tokio::test]
async fn health_endpoints_are_not_rate_limited() {
    let mut config = AppConfig::default();
    config.rate_limit.limit = 0;
    let state = AppState::local(config).unwrap();

    for _ in 0..3 {
        let res = app_with(&state)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = app_with(&state)
        .oneshot(delete_key("page:z", "203.0.113.11"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn rate_limit_can_be_disabled() {
    let mut config = AppConfig::default();
    config.rate_limit.enabled = false;
    config.rate_limit.limit = 0;
    let state = AppState::local(config).unwrap();

    let res = app_with(&state)
        .oneshot(delete_key("page:z", "203.0.113.12"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert!(!res.headers().contains_key("x-ratelimit-limit"));
}
