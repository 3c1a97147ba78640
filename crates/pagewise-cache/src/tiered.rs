//! Two-level read-through cache with single-flight fetches.
//!
//! Reads go L1 → L2 → fetch. L2 hits are promoted into L1 before being
//! returned. Concurrent misses for the same key share one fetch, which runs
//! on its own task: a caller that gives up waiting never cancels it, and a
//! late completion still populates both tiers for whoever asks next.
//!
//! Tier failures are logged and treated as misses. Only fetch failures and
//! the protective wait timeout reach the caller.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::TieredCacheConfig;
use crate::error::{CacheError, ConfigError, RemoteError};
use crate::l1::{L1Table, glob_to_regex};
use crate::metrics;
use crate::remote::{DisabledStore, MAX_TTL_SECS, RemoteStore, ceil_secs};
use crate::single_flight::SingleFlight;
use crate::stats::{CacheStats, StatsSnapshot};

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    L1,
    L2,
    Miss,
}

impl CacheLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::Miss => "miss",
        }
    }
}

impl std::fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call overrides for [`TieredCache::get`] and [`TieredCache::set`].
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// L1 lifetime; falls back to the configured default and is always
    /// clamped to the configured maximum.
    pub l1_ttl: Option<Duration>,
    /// L2 lifetime; falls back to the configured default.
    pub l2_ttl: Option<Duration>,
    /// Skip both read tiers and fetch unconditionally.
    pub force_refresh: bool,
    /// Neither read from nor write to L1.
    pub skip_l1: bool,
    /// Neither read from nor write to L2.
    pub skip_l2: bool,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn l1_ttl(mut self, ttl: Duration) -> Self {
        self.l1_ttl = Some(ttl);
        self
    }

    pub fn l2_ttl(mut self, ttl: Duration) -> Self {
        self.l2_ttl = Some(ttl);
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn skip_l1(mut self) -> Self {
        self.skip_l1 = true;
        self
    }

    pub fn skip_l2(mut self) -> Self {
        self.skip_l2 = true;
        self
    }
}

/// Outcome of [`TieredCache::get`].
#[derive(Debug, Clone)]
pub struct CacheLookup<V> {
    pub data: Arc<V>,
    pub level: CacheLevel,
    /// `true` when a tier answered, `false` when the value was fetched.
    pub hit: bool,
    pub latency: Duration,
}

impl<V> CacheLookup<V> {
    fn new(data: Arc<V>, level: CacheLevel, started: Instant) -> Self {
        Self {
            data,
            level,
            hit: level != CacheLevel::Miss,
            latency: started.elapsed(),
        }
    }
}

/// Diagnostics for health endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub stats: StatsSnapshot,
    pub hit_rate: f64,
    pub l1_entries: usize,
    pub l1_capacity: usize,
    /// Fetches currently in flight.
    pub l1_pending: usize,
    pub remote_enabled: bool,
    pub remote_backend: &'static str,
    pub config: TieredCacheConfig,
}

/// L2 value as stored in the remote tier.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a, V> {
    data: &'a V,
    expires_at: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<V> {
    data: V,
    expires_at: i64,
}

fn unix_millis_now() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Whole seconds for the remote store's native expiry: rounded up, at least 1.
fn remote_ttl_secs(ttl: Duration) -> u64 {
    ceil_secs(ttl).clamp(1, MAX_TTL_SECS)
}

/// Resolved write targets and lifetimes for one fill.
#[derive(Debug, Clone, Copy)]
struct WritePlan {
    l1_ttl: Duration,
    l2_ttl: Duration,
    write_l1: bool,
    write_l2: bool,
}

struct Inner<V> {
    config: TieredCacheConfig,
    l1: L1Table<V>,
    remote: Arc<dyn RemoteStore>,
    flights: SingleFlight<V>,
    stats: CacheStats,
}

/// Tiered cache handle. Clones share the same tiers and statistics.
pub struct TieredCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TieredCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> TieredCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        config: TieredCacheConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        tracing::info!(
            enabled = config.enabled,
            remote = remote.name(),
            l1_max_entries = config.l1_max_entries,
            l1_ttl_ms = config.l1_ttl_ms,
            l2_ttl_ms = config.l2_ttl_ms,
            "Tiered cache initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                l1: L1Table::new(config.l1_max_entries),
                remote,
                flights: SingleFlight::new(),
                stats: CacheStats::new(),
                config,
            }),
        })
    }

    /// A cache with no shared tier.
    pub fn local_only(config: TieredCacheConfig) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(DisabledStore))
    }

    pub fn config(&self) -> &TieredCacheConfig {
        &self.inner.config
    }

    /// Read `key` through L1 and L2, falling back to `fetch`.
    ///
    /// Concurrent callers missing on the same key share a single `fetch`;
    /// every one of them sees its value or its error. A caller that waits
    /// longer than the single-flight timeout gets [`CacheError::Timeout`].
    pub async fn get<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: &CacheOptions,
    ) -> Result<CacheLookup<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        if key.is_empty() {
            return Err(CacheError::InvalidKey);
        }
        let started = Instant::now();
        let inner = &self.inner;

        if !inner.config.enabled {
            inner.stats.record_request();
            inner.stats.record_fetch();
            let data = fetch().await.map_err(|e| {
                inner.stats.record_fetch_error();
                CacheError::fetch(key, e)
            })?;
            return Ok(CacheLookup::new(Arc::new(data), CacheLevel::Miss, started));
        }

        inner.stats.record_request();
        let read_l1 = !options.skip_l1 && !options.force_refresh;
        let read_l2 = !options.skip_l2 && !options.force_refresh && inner.remote.is_enabled();
        if read_l1 || read_l2 {
            inner.stats.record_tier_lookup();
        }

        if read_l1 {
            if let Some(data) = inner.l1.get(key) {
                inner.stats.record_l1_hit();
                metrics::record_cache_hit("l1");
                tracing::debug!(key = %key, "cache hit (L1)");
                return Ok(CacheLookup::new(data, CacheLevel::L1, started));
            }
            inner.stats.record_l1_miss();
            metrics::record_cache_miss("l1");
        }

        if read_l2 {
            if let Some((value, remaining)) = inner.read_l2(key).await {
                inner.stats.record_l2_hit();
                metrics::record_cache_hit("l2");
                tracing::debug!(key = %key, "cache hit (L2)");

                let data = Arc::new(value);
                if !options.skip_l1 {
                    let ttl = inner.l1_ttl(options).min(remaining);
                    inner.write_l1(key, Arc::clone(&data), ttl);
                }
                return Ok(CacheLookup::new(data, CacheLevel::L2, started));
            }
            inner.stats.record_l2_miss();
            metrics::record_cache_miss("l2");
        }

        tracing::debug!(key = %key, "cache miss");
        let data = self.fetch_coalesced(key, fetch, options).await?;
        Ok(CacheLookup::new(data, CacheLevel::Miss, started))
    }

    async fn fetch_coalesced<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: &CacheOptions,
    ) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let inner = &self.inner;
        let plan = inner.write_plan(options);

        let joined = inner.flights.join_or_start(key, |id| {
            let task = Arc::clone(inner).run_fetch(key.to_string(), id, fetch(), plan);
            let handle = tokio::spawn(task);
            let key = key.to_string();
            async move {
                handle.await.unwrap_or_else(|e| {
                    Err(CacheError::fetch(
                        key,
                        anyhow::anyhow!("fetch task did not complete: {e}"),
                    ))
                })
            }
            .boxed()
        });

        if joined.is_leader() {
            inner.stats.record_fetch();
        } else {
            inner.stats.record_stampede_prevented();
            metrics::record_stampede_prevented();
            tracing::debug!(key = %key, "joined in-flight fetch");
        }

        let id = joined.id();
        let outcome = inner
            .flights
            .wait(key, id, joined.into_future(), inner.config.single_flight_timeout())
            .await;
        if matches!(&outcome, Err(e) if e.is_timeout()) {
            inner.stats.record_timeout();
        }
        outcome
    }

    /// Write `data` to L2 then L1, bypassing the single-flight path.
    pub async fn set(&self, key: &str, data: V, options: &CacheOptions) -> Result<(), CacheError> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey);
        }
        let inner = &self.inner;
        if !inner.config.enabled {
            return Ok(());
        }

        let plan = inner.write_plan(options);
        inner.fill(key, Arc::new(data), plan).await;
        Ok(())
    }

    /// Remove `key` from L1, L2 and the in-flight registry.
    ///
    /// Removing an absent key is a no-op. An in-flight fetch is not
    /// cancelled; it just stops being joinable.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey);
        }
        let inner = &self.inner;
        let in_l1 = inner.l1.remove(key);
        inner.flights.forget(key);
        metrics::set_cache_entries(inner.l1.len());

        if inner.remote.is_enabled() {
            match inner.remote.del(&inner.l2_key(key)).await {
                Ok(()) => tracing::debug!(key = %key, in_l1, "cache invalidated (L1+L2)"),
                Err(e) => tracing::warn!(key = %key, error = %e, "L2 delete failed"),
            }
        } else {
            tracing::debug!(key = %key, in_l1, "cache invalidated (local)");
        }
        Ok(())
    }

    /// Drop every L1 entry. The shared tier is left alone.
    pub fn clear(&self) -> usize {
        let removed = self.inner.l1.clear();
        metrics::set_cache_entries(0);
        tracing::info!(removed, "L1 cache cleared");
        removed
    }

    /// Remove L1 keys matching a `*`-wildcard pattern. Returns the count.
    ///
    /// L2 entries are not touched; invalidate them by explicit key.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let matcher = match glob_to_regex(pattern) {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Unusable invalidation pattern");
                return 0;
            }
        };
        let removed = self.inner.l1.remove_matching(&matcher);
        metrics::set_cache_entries(self.inner.l1.len());
        tracing::debug!(
            pattern = %pattern,
            removed,
            "L1 pattern invalidation (L2 pattern invalidation not supported)"
        );
        removed
    }

    pub fn metrics(&self) -> CacheMetrics {
        let inner = &self.inner;
        let stats = inner.stats.snapshot();
        CacheMetrics {
            hit_rate: stats.hit_rate(),
            stats,
            l1_entries: inner.l1.len(),
            l1_capacity: inner.l1.capacity(),
            l1_pending: inner.flights.len(),
            remote_enabled: inner.remote.is_enabled(),
            remote_backend: inner.remote.name(),
            config: inner.config.clone(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    /// Remove expired L1 entries now. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep()
    }

    /// Sweep expired L1 entries every `sweep_interval`.
    ///
    /// The task holds only a weak reference and exits once every
    /// `TieredCache` handle is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    tracing::debug!("Cache dropped, stopping L1 sweeper");
                    break;
                };
                inner.sweep();
            }
        })
    }
}

impl<V> Inner<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn l2_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn l1_ttl(&self, options: &CacheOptions) -> Duration {
        options
            .l1_ttl
            .unwrap_or_else(|| self.config.l1_ttl())
            .min(self.config.l1_max_ttl())
    }

    fn write_plan(&self, options: &CacheOptions) -> WritePlan {
        WritePlan {
            l1_ttl: self.l1_ttl(options),
            l2_ttl: options
                .l2_ttl
                .unwrap_or_else(|| self.config.l2_ttl())
                .min(Duration::from_secs(MAX_TTL_SECS)),
            write_l1: !options.skip_l1,
            write_l2: !options.skip_l2,
        }
    }

    /// Fetch, then fill both tiers on success. Runs on its own task.
    async fn run_fetch<Fut>(
        self: Arc<Self>,
        key: String,
        id: u64,
        fetch: Fut,
        plan: WritePlan,
    ) -> Result<Arc<V>, CacheError>
    where
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        // Releases the slot after the fill, or if the fetch panics.
        let _slot = FlightSlot {
            flights: &self.flights,
            key: &key,
            id,
        };

        match fetch.await {
            Ok(value) => {
                let data = Arc::new(value);
                self.fill(&key, Arc::clone(&data), plan).await;
                Ok(data)
            }
            Err(e) => {
                self.stats.record_fetch_error();
                metrics::record_fetch_error();
                tracing::warn!(key = %key, error = %e, "fetch failed; nothing cached");
                Err(CacheError::fetch(key.as_str(), e))
            }
        }
    }

    async fn fill(&self, key: &str, data: Arc<V>, plan: WritePlan) {
        if plan.write_l2 {
            self.write_l2(key, &data, plan.l2_ttl).await;
        }
        if plan.write_l1 {
            self.write_l1(key, data, plan.l1_ttl);
        }
    }

    fn write_l1(&self, key: &str, data: Arc<V>, ttl: Duration) {
        let outcome = self.l1.insert(key.to_string(), data, ttl);
        if outcome.evicted > 0 {
            self.stats.record_evictions(outcome.evicted);
            tracing::debug!(evicted = outcome.evicted, "L1 at capacity, evicted LRU entries");
        }
        metrics::set_cache_entries(self.l1.len());
    }

    async fn write_l2(&self, key: &str, data: &V, ttl: Duration) {
        if !self.remote.is_enabled() {
            return;
        }

        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let envelope = EnvelopeRef {
            data,
            expires_at: unix_millis_now().saturating_add(ttl_ms),
        };
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to encode L2 envelope");
                return;
            }
        };

        let ttl_secs = remote_ttl_secs(ttl);
        match self.remote.set_ex(&self.l2_key(key), &bytes, ttl_secs).await {
            Ok(()) => tracing::debug!(key = %key, ttl_secs, "cache set (L1+L2)"),
            Err(e) => tracing::warn!(key = %key, error = %e, "L2 SET error"),
        }
    }

    /// A live L2 value and its remaining lifetime, or `None` on any miss,
    /// expiry, decode failure or store error.
    async fn read_l2(&self, key: &str) -> Option<(V, Duration)> {
        let bytes = match self.remote.get(&self.l2_key(key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(RemoteError::Disabled) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "L2 GET error");
                return None;
            }
        };

        let envelope: Envelope<V> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable L2 envelope, treating as miss");
                return None;
            }
        };

        let remaining_ms = envelope.expires_at.saturating_sub(unix_millis_now());
        if remaining_ms <= 0 {
            tracing::debug!(key = %key, "L2 envelope expired");
            return None;
        }
        Some((envelope.data, Duration::from_millis(remaining_ms as u64)))
    }

    fn sweep(&self) -> usize {
        let removed = self.l1.sweep_expired();
        if removed > 0 {
            tracing::debug!(removed, "swept expired L1 entries");
        }
        metrics::set_cache_entries(self.l1.len());
        removed
    }
}

struct FlightSlot<'a, V: Send + Sync + 'static> {
    flights: &'a SingleFlight<V>,
    key: &'a str,
    id: u64,
}

impl<V: Send + Sync + 'static> Drop for FlightSlot<'_, V> {
    fn drop(&mut self) {
        self.flights.complete(self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_ttl_rounds_up() {
        assert_eq!(remote_ttl_secs(Duration::from_millis(1)), 1);
        assert_eq!(remote_ttl_secs(Duration::ZERO), 1);
        assert_eq!(remote_ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(remote_ttl_secs(Duration::from_secs(3600)), 3600);
        assert_eq!(remote_ttl_secs(Duration::MAX), MAX_TTL_SECS);
    }

    #[test]
    fn test_level_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&CacheLevel::L2).unwrap(), r#""l2""#);
        assert_eq!(CacheLevel::Miss.to_string(), "miss");
    }

    #[test]
    fn test_envelope_shape() {
        let value = serde_json::json!({"title": "home"});
        let envelope = EnvelopeRef {
            data: &value,
            expires_at: 42,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["expiresAt"], 42);
        assert_eq!(json["data"]["title"], "home");
    }

    #[tokio::test]
    async fn test_l1_ttl_is_clamped_to_max() {
        let cache: TieredCache<String> = TieredCache::local_only(TieredCacheConfig {
            l1_ttl_ms: 1_000,
            l1_max_ttl_ms: 2_000,
            l2_ttl_ms: 2_000,
            ..Default::default()
        })
        .unwrap();

        let options = CacheOptions::new().l1_ttl(Duration::from_secs(3600));
        cache.set("k", "v".to_string(), &options).await.unwrap();

        let remaining = cache.inner.l1.ttl_remaining("k").unwrap();
        assert!(remaining <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let cache: TieredCache<String> =
            TieredCache::local_only(TieredCacheConfig::default()).unwrap();
        let err = cache
            .get("", || async { Ok("v".to_string()) }, &CacheOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey));
    }
}
