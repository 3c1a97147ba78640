use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::extract::{ConnectInfo, MatchedPath, State};
use axum::response::IntoResponse;
use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use pagewise_cache::RateLimitDecision;
use serde_json::json;
use uuid::Uuid;

use crate::metrics;
use crate::server::AppState;

// =============================================================================
// Request ID
// =============================================================================

pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static("x-request-id");

    // If the incoming request already has a request-id, preserve it; otherwise generate one
    let req_id_value = req
        .headers()
        .get(&header_name)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    let Some(req_id_value) = req_id_value else {
        return next.run(req).await;
    };

    // Add to request extensions for downstream usage (e.g., logging)
    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}

// =============================================================================
// HTTP Metrics
// =============================================================================

pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let res = next.run(req).await;
    metrics::record_http_request(&method, &route, res.status().as_u16(), started.elapsed());
    res
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Fixed-window rate limiting keyed by client and route.
///
/// Allowed responses carry `X-RateLimit-*` headers; rejected requests get
/// `429 Too Many Requests` with `Retry-After`.
pub async fn rate_limit(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let settings = &state.config.rate_limit;
    if !settings.enabled {
        return next.run(req).await;
    }

    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let client = client_identity(&req, settings.trust_forwarded_for);
    let identifier = format!("{client}:{route}");

    let decision = state
        .limiter
        .check(&identifier, settings.limit, settings.window_seconds)
        .await;

    if !decision.ok {
        return RateLimited(decision).into_response();
    }

    let mut res = next.run(req).await;
    insert_rate_limit_headers(res.headers_mut(), &decision);
    res
}

/// Client identity for rate limiting.
///
/// The peer address is used unless `trust_forwarded_for` is set, in which
/// case a first `X-Forwarded-For` hop that parses as an IP address wins.
pub fn client_identity<B>(req: &Request<B>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        if let Some(ip) = forwarded_ip(req.headers()) {
            return ip.to_string();
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded_for = headers.get("x-forwarded-for")?.to_str().ok()?;
    // X-Forwarded-For can contain multiple IPs, take the first one
    forwarded_for.split(',').next()?.trim().parse().ok()
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(
        HeaderName::from_static("x-ratelimit-limit"),
        HeaderValue::from(decision.limit),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(decision.remaining),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-reset"),
        HeaderValue::from(decision.reset_seconds),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-scope"),
        HeaderValue::from_static(decision.scope.as_str()),
    );
}

/// A rejected request.
struct RateLimited(RateLimitDecision);

impl IntoResponse for RateLimited {
    fn into_response(self) -> Response {
        let decision = self.0;
        // Minimum 1 second
        let retry_after = decision.reset_seconds.max(1);

        let body = json!({
            "error": "rate_limited",
            "message": format!("Too many requests, retry after {retry_after}s"),
            "retryAfter": retry_after,
        });
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        insert_rate_limit_headers(headers, &decision);
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(retry_after),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_peer(peer: [u8; 4]) -> axum::http::request::Builder {
        Request::builder().extension(ConnectInfo(SocketAddr::from((peer, 4000))))
    }

    #[test]
    fn test_client_identity_ignores_forwarded_for_by_default() {
        let req = from_peer([192, 0, 2, 1])
            .header("x-forwarded-for", "203.0.113.7")
            .body(())
            .unwrap();
        assert_eq!(client_identity(&req, false), "192.0.2.1");
    }

    #[test]
    fn test_client_identity_uses_trusted_forwarded_for() {
        let req = from_peer([192, 0, 2, 1])
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(client_identity(&req, true), "203.0.113.7");
    }

    #[test]
    fn test_client_identity_rejects_non_ip_forwarded_for() {
        for value in ["spoof-1", "", "not an ip, 10.0.0.1"] {
            let req = from_peer([192, 0, 2, 1])
                .header("x-forwarded-for", value)
                .body(())
                .unwrap();
            assert_eq!(client_identity(&req, true), "192.0.2.1", "header {value:?}");
        }
    }

    #[test]
    fn test_client_identity_without_peer() {
        let anonymous = Request::builder().body(()).unwrap();
        assert_eq!(client_identity(&anonymous, false), "unknown");
    }
}
