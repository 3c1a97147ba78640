//! Fixed-window rate limiter.
//!
//! Each identifier gets its own window, anchored to the first request seen
//! in it. Counters live in the shared store when one is reachable, so the
//! limit holds across every instance. When the store is disabled or failing,
//! the limiter falls back to a per-process table and says so through
//! [`LimitScope::Local`] on every decision.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::RateLimiterConfig;
use crate::error::{ConfigError, RemoteError};
use crate::metrics;
use crate::remote::{MAX_TTL_SECS, RemoteStore, WindowCount, ceil_secs};

/// Where a decision was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    /// Shared counter: the limit holds across all instances.
    Global,
    /// Per-process fallback: each instance enforces the limit on its own.
    Local,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub ok: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until this identifier's window resets.
    pub reset_seconds: u64,
    pub scope: LimitScope,
}

impl RateLimitDecision {
    fn from_count(limit: u32, count: u64, reset_seconds: u64, scope: LimitScope) -> Self {
        let ok = count <= u64::from(limit);
        let remaining = if ok {
            // count <= limit, so this fits in u32
            (u64::from(limit) - count) as u32
        } else {
            0
        };
        Self {
            ok,
            limit,
            remaining,
            reset_seconds,
            scope,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: u64,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    remote: Arc<dyn RemoteStore>,
    local: Arc<DashMap<String, LocalWindow>>,
    degraded: Arc<AtomicBool>,
}

impl RateLimiter {
    pub fn new(
        config: RateLimiterConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        if remote.is_enabled() {
            tracing::info!(remote = remote.name(), "Rate limiter using shared counters");
        } else {
            tracing::info!("Rate limiter using process-local counters");
        }

        Ok(Self {
            config,
            remote,
            local: Arc::new(DashMap::new()),
            degraded: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Count one request for `identifier` and decide whether it may proceed.
    ///
    /// Rejected requests are counted too, so a client that keeps hammering
    /// stays rejected until its window runs out. A `limit` of 0 rejects
    /// everything; a `window_seconds` of 0 is treated as 1.
    pub async fn check(&self, identifier: &str, limit: u32, window_seconds: u64) -> RateLimitDecision {
        let window_seconds = window_seconds.clamp(1, MAX_TTL_SECS);

        let decision = match self.check_remote(identifier, window_seconds).await {
            Some(WindowCount { count, ttl_secs }) => {
                RateLimitDecision::from_count(limit, count, ttl_secs, LimitScope::Global)
            }
            None => {
                let (count, reset_seconds) = self.check_local(identifier, window_seconds);
                RateLimitDecision::from_count(limit, count, reset_seconds, LimitScope::Local)
            }
        };

        metrics::record_rate_limit_decision(decision.ok, decision.scope.as_str());
        if !decision.ok {
            tracing::debug!(
                identifier = %identifier,
                limit,
                reset_seconds = decision.reset_seconds,
                scope = decision.scope.as_str(),
                "rate limit exceeded"
            );
        }
        decision
    }

    /// Whether the limiter is currently counting per process only.
    pub fn is_degraded(&self) -> bool {
        !self.remote.is_enabled() || self.degraded.load(Ordering::Relaxed)
    }

    async fn check_remote(&self, identifier: &str, window_seconds: u64) -> Option<WindowCount> {
        if !self.remote.is_enabled() {
            return None;
        }

        let key = format!("{}{}", self.config.key_prefix, identifier);
        match self.remote.incr_window(&key, window_seconds).await {
            Ok(window) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!("Shared rate-limit store recovered; limits are global again");
                }
                Some(window)
            }
            Err(e) => {
                self.mark_degraded(&e);
                None
            }
        }
    }

    fn mark_degraded(&self, error: &RemoteError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                error = %error,
                "Shared rate-limit store unavailable; enforcing limits per process"
            );
        }
    }

    /// Increment the local window for `identifier`. The entry guard holds the
    /// shard lock, so concurrent increments are never lost.
    fn check_local(&self, identifier: &str, window_seconds: u64) -> (u64, u64) {
        let now = Instant::now();
        let window = Duration::from_secs(window_seconds);

        let mut entry = self
            .local
            .entry(identifier.to_string())
            .or_insert(LocalWindow {
                count: 0,
                expires_at: now + window,
            });

        if now >= entry.expires_at {
            *entry = LocalWindow {
                count: 0,
                expires_at: now + window,
            };
        }
        entry.count += 1;

        let remaining = entry.expires_at.saturating_duration_since(now);
        (entry.count, ceil_secs(remaining))
    }

    /// Drop local windows that have run out. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len();
        self.local.retain(|_, window| now < window.expires_at);
        before.saturating_sub(self.local.len())
    }

    /// Number of identifiers tracked locally.
    pub fn local_entries(&self) -> usize {
        self.local.len()
    }

    /// Purge expired local windows every `sweep_interval`.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let local = Arc::downgrade(&self.local);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(local) = local.upgrade() else {
                    break;
                };
                let now = Instant::now();
                local.retain(|_, window| now < window.expires_at);
            }
        })
    }
}
