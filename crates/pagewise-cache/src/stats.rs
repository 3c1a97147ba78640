//! Process-wide cache counters.
//!
//! Counters only ever move forward until [`CacheStats::reset`]. They are
//! updated with relaxed atomics: each counter is individually exact, but a
//! snapshot taken during heavy traffic is not a consistent cut across all of
//! them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct CacheStats {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    fetches: AtomicU64,
    fetch_errors: AtomicU64,
    stampede_prevented: AtomicU64,
    total_requests: AtomicU64,
    tier_lookups: AtomicU64,
    l1_evictions: AtomicU64,
    timeouts: AtomicU64,
}

macro_rules! counter_fns {
    ($($record:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $record(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter_fns! {
        record_l1_hit => l1_hits,
        record_l1_miss => l1_misses,
        record_l2_hit => l2_hits,
        record_l2_miss => l2_misses,
        record_fetch => fetches,
        record_fetch_error => fetch_errors,
        record_stampede_prevented => stampede_prevented,
        record_request => total_requests,
        record_tier_lookup => tier_lookups,
        record_timeout => timeouts,
    }

    pub fn record_evictions(&self, count: usize) {
        if count > 0 {
            self.l1_evictions.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            l1_hits: load(&self.l1_hits),
            l1_misses: load(&self.l1_misses),
            l2_hits: load(&self.l2_hits),
            l2_misses: load(&self.l2_misses),
            fetches: load(&self.fetches),
            fetch_errors: load(&self.fetch_errors),
            stampede_prevented: load(&self.stampede_prevented),
            total_requests: load(&self.total_requests),
            tier_lookups: load(&self.tier_lookups),
            l1_evictions: load(&self.l1_evictions),
            timeouts: load(&self.timeouts),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.l1_hits,
            &self.l1_misses,
            &self.l2_hits,
            &self.l2_misses,
            &self.fetches,
            &self.fetch_errors,
            &self.stampede_prevented,
            &self.total_requests,
            &self.tier_lookups,
            &self.l1_evictions,
            &self.timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    /// Fetches actually started (one per coalesced group).
    pub fetches: u64,
    pub fetch_errors: u64,
    /// Callers that joined an in-flight fetch instead of starting their own.
    pub stampede_prevented: u64,
    pub total_requests: u64,
    /// `get` calls that consulted at least one tier.
    pub tier_lookups: u64,
    pub l1_evictions: u64,
    pub timeouts: u64,
}

impl StatsSnapshot {
    /// Share of tier lookups answered by L1 or L2, as a percentage.
    ///
    /// A lookup that fell through to the fetch path counts as a miss even if
    /// the fetch succeeded.
    pub fn hit_rate(&self) -> f64 {
        if self.tier_lookups == 0 {
            0.0
        } else {
            (self.l1_hits + self.l2_hits) as f64 / self.tier_lookups as f64 * 100.0
        }
    }
}
