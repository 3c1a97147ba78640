use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use pagewise_cache::{
    DisabledStore, LimitScope, MemoryStore, RateLimiter, RateLimiterConfig, RemoteStore,
};

fn limiter_with(store: Arc<dyn RemoteStore>) -> RateLimiter {
    RateLimiter::new(RateLimiterConfig::default(), store).expect("valid config")
}

async fn run_window(limiter: &RateLimiter, expected_scope: LimitScope) {
    let mut ok = Vec::new();
    let mut remaining = Vec::new();
    for _ in 0..3 {
        let decision = limiter.check("10.0.0.1:/api/chat", 2, 60).await;
        assert_eq!(decision.scope, expected_scope);
        assert_eq!(decision.limit, 2);
        ok.push(decision.ok);
        remaining.push(decision.remaining);
    }
    assert_eq!(ok, vec![true, true, false]);
    assert_eq!(remaining, vec![1, 0, 0]);

    tokio::time::advance(Duration::from_secs(61)).await;
    let after = limiter.check("10.0.0.1:/api/chat", 2, 60).await;
    assert!(after.ok);
    assert_eq!(after.remaining, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fixed_window_with_shared_store() {
    let limiter = limiter_with(Arc::new(MemoryStore::new()));
    run_window(&limiter, LimitScope::Global).await;
}

#[tokio::test(start_paused = true)]
async fn test_fixed_window_without_shared_store() {
    let limiter = limiter_with(Arc::new(DisabledStore));
    run_window(&limiter, LimitScope::Local).await;
    assert!(limiter.is_degraded());
}

#[tokio::test]
async fn test_huge_window_is_capped() {
    let stores: [Arc<dyn RemoteStore>; 2] = [Arc::new(MemoryStore::new()), Arc::new(DisabledStore)];
    for store in stores {
        let limiter = limiter_with(store);
        let first = limiter.check("10.0.0.9:/api/chat", 1, u64::MAX).await;
        let second = limiter.check("10.0.0.9:/api/chat", 1, u64::MAX).await;
        assert!(first.ok);
        assert!(!second.ok);
        assert!(second.reset_seconds > 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_outage_falls_back_to_local_enforcement() {
    let store = MemoryStore::new();
    store.set_available(false);
    let limiter = limiter_with(Arc::new(store.clone()));

    // Still enforced, not failing open.
    run_window(&limiter, LimitScope::Local).await;
}

#[tokio::test]
async fn test_rejected_requests_keep_counting() {
    let limiter = limiter_with(Arc::new(MemoryStore::new()));
    for _ in 0..5 {
        limiter.check("abuser", 1, 60).await;
    }
    let decision = limiter.check("abuser", 1, 60).await;
    assert!(!decision.ok);
    assert_eq!(decision.remaining, 0);
    assert!(decision.reset_seconds > 0 && decision.reset_seconds <= 60);
}

#[tokio::test]
async fn test_identifiers_are_independent() {
    let limiter = limiter_with(Arc::new(MemoryStore::new()));
    assert!(limiter.check("a", 1, 60).await.ok);
    assert!(!limiter.check("a", 1, 60).await.ok);
    assert!(limiter.check("b", 1, 60).await.ok);
}

#[tokio::test]
async fn test_instances_share_the_global_count() {
    let store = MemoryStore::new();
    let first = limiter_with(Arc::new(store.clone()));
    let second = limiter_with(Arc::new(store.clone()));

    assert!(first.check("client", 2, 60).await.ok);
    assert!(second.check("client", 2, 60).await.ok);
    assert!(!first.check("client", 2, 60).await.ok);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_local_increments_are_not_lost() {
    let limiter = limiter_with(Arc::new(DisabledStore));

    let decisions = join_all((0..100).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.check("burst", 10, 60).await })
    }))
    .await;

    let allowed = decisions
        .into_iter()
        .map(|joined| joined.unwrap())
        .filter(|d| d.ok)
        .count();
    assert_eq!(allowed, 10);
}
