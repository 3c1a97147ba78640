//! Remote key/value store abstraction for the shared (L2) tier.
//!
//! The cache and the rate limiter only ever talk to a `dyn RemoteStore`.
//! A deployment without a shared store gets a [`DisabledStore`] instead of
//! an `Option`, so the tiers check a capability rather than null.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::RemoteError;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, connect_redis};

/// Longest expiry any store is asked to keep, in seconds (about 68 years).
pub const MAX_TTL_SECS: u64 = i32::MAX as u64;

/// Whole seconds in `duration`, rounded up.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_add(u64::from(duration.subsec_nanos() > 0))
}

/// Result of an atomic window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after the increment.
    pub count: u64,
    /// Seconds until the counter expires and the window resets.
    pub ttl_secs: u64,
}

/// Shared key/value store reached over the network.
///
/// Implementations must be cheap to call concurrently and must never panic
/// on connection loss; every failure is reported as a [`RemoteError`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short backend name for logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Whether this deployment has a shared tier at all.
    ///
    /// `false` means every operation returns [`RemoteError::Disabled`] and
    /// callers should not bother issuing them.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Round-trip check used by readiness probes.
    async fn ping(&self) -> Result<(), RemoteError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    /// Store `value` with a native expiry of `ttl_secs` seconds.
    async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), RemoteError>;

    /// Delete `key`. Deleting an absent key is not an error.
    async fn del(&self, key: &str) -> Result<(), RemoteError>;

    /// Atomically increment the counter at `key`.
    ///
    /// When the increment creates the counter, its expiry is set to
    /// `window_secs`; later increments leave the expiry untouched, so the
    /// window is anchored to the first hit.
    async fn incr_window(&self, key: &str, window_secs: u64) -> Result<WindowCount, RemoteError>;
}

/// Stand-in used when no shared store is configured or reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStore;

#[async_trait]
impl RemoteStore for DisabledStore {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Err(RemoteError::Disabled)
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        Err(RemoteError::Disabled)
    }

    async fn set_ex(&self, _key: &str, _value: &[u8], _ttl_secs: u64) -> Result<(), RemoteError> {
        Err(RemoteError::Disabled)
    }

    async fn del(&self, _key: &str) -> Result<(), RemoteError> {
        Err(RemoteError::Disabled)
    }

    async fn incr_window(&self, _key: &str, _window_secs: u64) -> Result<WindowCount, RemoteError> {
        Err(RemoteError::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::ZERO), 0);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(2000)), 2);
        assert_eq!(ceil_secs(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_disabled_store_reports_capability() {
        let store = DisabledStore;
        assert!(!store.is_enabled());
        assert!(matches!(store.ping().await, Err(RemoteError::Disabled)));
        assert!(matches!(store.get("k").await, Err(RemoteError::Disabled)));
        assert!(matches!(
            store.incr_window("k", 60).await,
            Err(RemoteError::Disabled)
        ));
    }
}
