//! Metric emission through the `metrics` facade.
//!
//! The library never installs a recorder. Whatever the host process installs
//! (the server installs Prometheus) receives these; without one they are
//! no-ops.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "pagewise_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "pagewise_cache_misses_total";
    pub const CACHE_STAMPEDE_PREVENTED_TOTAL: &str = "pagewise_cache_stampede_prevented_total";
    pub const CACHE_FETCH_ERRORS_TOTAL: &str = "pagewise_cache_fetch_errors_total";
    pub const CACHE_ENTRIES: &str = "pagewise_cache_entries";

    // Rate limit metrics
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "pagewise_rate_limit_decisions_total";
}

/// Record a cache hit.
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss(tier: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "tier" => tier).increment(1);
}

pub fn record_stampede_prevented() {
    counter!(names::CACHE_STAMPEDE_PREVENTED_TOTAL).increment(1);
}

pub fn record_fetch_error() {
    counter!(names::CACHE_FETCH_ERRORS_TOTAL).increment(1);
}

/// Set the number of L1 entries.
pub fn set_cache_entries(count: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => "l1").set(count as f64);
}

pub fn record_rate_limit_decision(allowed: bool, scope: &'static str) {
    let outcome = if allowed { "allowed" } else { "rejected" };
    counter!(
        names::RATE_LIMIT_DECISIONS_TOTAL,
        "outcome" => outcome,
        "scope" => scope
    )
    .increment(1);
}
