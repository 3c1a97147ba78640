//! Tiered caching and rate limiting for Pagewise.
//!
//! - [`TieredCache`]: in-process L1 in front of a shared L2, with
//!   single-flight fetches so a burst of misses on one key runs the loader
//!   once.
//! - [`RateLimiter`]: fixed-window counters per identifier, global when the
//!   shared store is up and per-process when it is not.
//!
//! Both talk to the shared tier through [`RemoteStore`]. Without Redis they
//! keep working in local-only mode.

pub mod config;
pub mod error;
pub mod l1;
pub mod metrics;
pub mod rate_limit;
pub mod remote;
pub mod single_flight;
pub mod stats;
pub mod tiered;

pub use config::{RateLimiterConfig, RedisConfig, TieredCacheConfig};
pub use error::{CacheError, ConfigError, RemoteError};
pub use rate_limit::{LimitScope, RateLimitDecision, RateLimiter};
pub use remote::{DisabledStore, MemoryStore, RedisStore, RemoteStore, WindowCount, connect_redis};
pub use stats::StatsSnapshot;
pub use tiered::{CacheLevel, CacheLookup, CacheMetrics, CacheOptions, TieredCache};
