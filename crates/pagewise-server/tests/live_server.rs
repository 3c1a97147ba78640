use std::net::SocketAddr;

use pagewise_server::{AppConfig, AppState, build_app};
use serde_json::Value;
use tokio::task::JoinHandle;

async fn start_server(
    config: AppConfig,
) -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let app = build_app(AppState::local(config).expect("state"));

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = rx.await;
        })
        .await;
    });

    (format!("http://{}", addr), tx, server)
}

#[tokio::test]
async fn serves_health_over_tcp() {
    let (base, shutdown_tx, handle) = start_server(AppConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/healthz", base))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn rate_limits_by_peer_address_without_proxy_headers() {
    let mut config = AppConfig::default();
    config.rate_limit.limit = 1;
    let (base, shutdown_tx, handle) = start_server(config).await;
    let client = reqwest::Client::new();

    let first = client
        .delete(format!("{}/api/cache/page:home", base))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::NO_CONTENT);

    let second = client
        .delete(format!("{}/api/cache/page:home", base))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}
