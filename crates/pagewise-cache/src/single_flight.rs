//! In-flight fetch registry.
//!
//! At most one flight exists per key. A flight is a shared future: the first
//! caller registers it, later callers clone it and await the same outcome.
//! Each flight carries a generation id so that a slot cleared by a timeout
//! or a `delete` is never removed again by a stale completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::error::CacheError;

pub type FlightFuture<V> = Shared<BoxFuture<'static, Result<Arc<V>, CacheError>>>;

struct Flight<V> {
    id: u64,
    future: FlightFuture<V>,
}

/// Result of [`SingleFlight::join_or_start`].
pub enum Joined<V> {
    /// This caller registered the flight.
    Leader { id: u64, future: FlightFuture<V> },
    /// A flight was already running; this caller shares it.
    Follower { id: u64, future: FlightFuture<V> },
}

impl<V> Joined<V> {
    pub fn id(&self) -> u64 {
        match self {
            Self::Leader { id, .. } | Self::Follower { id, .. } => *id,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader { .. })
    }

    pub fn into_future(self) -> FlightFuture<V> {
        match self {
            Self::Leader { future, .. } | Self::Follower { future, .. } => future,
        }
    }
}

pub struct SingleFlight<V> {
    flights: DashMap<String, Flight<V>>,
    next_id: AtomicU64,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            flights: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<V: Send + Sync + 'static> SingleFlight<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, or start one with `start`.
    ///
    /// `start` receives the new flight's id and runs while the registry slot
    /// is locked, so it must not block. Spawning a task from it is fine.
    pub fn join_or_start<F>(&self, key: &str, start: F) -> Joined<V>
    where
        F: FnOnce(u64) -> BoxFuture<'static, Result<Arc<V>, CacheError>>,
    {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let flight = occupied.get();
                Joined::Follower {
                    id: flight.id,
                    future: flight.future.clone(),
                }
            }
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let future = start(id).shared();
                vacant.insert(Flight {
                    id,
                    future: future.clone(),
                });
                Joined::Leader { id, future }
            }
        }
    }

    /// Remove the slot for `key` if it still belongs to flight `id`.
    pub fn complete(&self, key: &str, id: u64) -> bool {
        self.flights.remove_if(key, |_, flight| flight.id == id).is_some()
    }

    /// Drop whatever flight is registered for `key`.
    ///
    /// The underlying work keeps running; callers already waiting on it still
    /// receive its outcome.
    pub fn forget(&self, key: &str) -> bool {
        self.flights.remove(key).is_some()
    }

    /// Await a flight for at most `timeout`.
    ///
    /// On timeout the slot is released (if it is still this flight's) so the
    /// next caller can start fresh, and the caller gets
    /// [`CacheError::Timeout`].
    pub async fn wait(
        &self,
        key: &str,
        id: u64,
        future: FlightFuture<V>,
        timeout: Duration,
    ) -> Result<Arc<V>, CacheError> {
        match tokio::time::timeout(timeout, future).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if self.complete(key, id) {
                    tracing::warn!(
                        key = %key,
                        waited_ms = timeout.as_millis() as u64,
                        "In-flight fetch timed out; slot released"
                    );
                }
                Err(CacheError::timeout(key, timeout))
            }
        }
    }

    /// Number of flights currently registered.
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ready(value: &'static str) -> BoxFuture<'static, Result<Arc<String>, CacheError>> {
        async move { Ok(Arc::new(value.to_string())) }.boxed()
    }

    #[tokio::test]
    async fn test_second_caller_joins_existing_flight() {
        let registry: SingleFlight<String> = SingleFlight::new();
        let starts = AtomicUsize::new(0);

        let first = registry.join_or_start("k", |_| {
            starts.fetch_add(1, Ordering::SeqCst);
            ready("v")
        });
        let second = registry.join_or_start("k", |_| {
            starts.fetch_add(1, Ordering::SeqCst);
            ready("other")
        });

        assert!(first.is_leader());
        assert!(!second.is_leader());
        assert_eq!(first.id(), second.id());
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        let a = first.into_future().await.unwrap();
        let b = second.into_future().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_stale_completion_does_not_remove_newer_flight() {
        let registry: SingleFlight<String> = SingleFlight::new();
        let old = registry.join_or_start("k", |_| ready("old")).id();
        assert!(registry.forget("k"));

        let new = registry.join_or_start("k", |_| ready("new")).id();
        assert_ne!(old, new);
        assert!(!registry.complete("k", old));
        assert_eq!(registry.len(), 1);
        assert!(registry.complete("k", new));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_and_releases_slot() {
        let registry: SingleFlight<String> = SingleFlight::new();
        let joined = registry.join_or_start("slow", |_| {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Arc::new("late".to_string()))
            }
            .boxed()
        });
        let id = joined.id();

        let err = registry
            .wait("slow", id, joined.into_future(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(registry.is_empty());
    }
}
