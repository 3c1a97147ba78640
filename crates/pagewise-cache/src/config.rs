//! Typed configuration for the cache, the rate limiter and the Redis tier.
//!
//! Every field has a default so partial config files deserialize cleanly.
//! Invariants are checked once by `validate()` when a component is built.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::remote::MAX_TTL_SECS;

/// Tiered cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredCacheConfig {
    /// Disable to turn `get` into a pass-through fetch with no caching
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Default L1 TTL in milliseconds
    #[serde(default = "default_l1_ttl_ms")]
    pub l1_ttl_ms: u64,

    /// Hard ceiling for any L1 TTL, including caller-supplied ones
    #[serde(default = "default_l1_max_ttl_ms")]
    pub l1_max_ttl_ms: u64,

    /// Default L2 TTL in milliseconds
    #[serde(default = "default_l2_ttl_ms")]
    pub l2_ttl_ms: u64,

    /// Maximum number of L1 entries before LRU eviction
    #[serde(default = "default_l1_max_entries")]
    pub l1_max_entries: usize,

    /// Interval between L1 expiry sweeps
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// How long a caller waits on an in-flight fetch before giving up
    #[serde(default = "default_single_flight_timeout_ms")]
    pub single_flight_timeout_ms: u64,

    /// Namespace prepended to every L2 key
    #[serde(default = "default_cache_key_prefix")]
    pub key_prefix: String,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_l1_ttl_ms() -> u64 {
    60_000
}

fn default_l1_max_ttl_ms() -> u64 {
    300_000
}

fn default_l2_ttl_ms() -> u64 {
    3_600_000
}

fn default_l1_max_entries() -> usize {
    1_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_single_flight_timeout_ms() -> u64 {
    10_000
}

fn default_cache_key_prefix() -> String {
    "pagewise:cache:".to_string()
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            l1_ttl_ms: default_l1_ttl_ms(),
            l1_max_ttl_ms: default_l1_max_ttl_ms(),
            l2_ttl_ms: default_l2_ttl_ms(),
            l1_max_entries: default_l1_max_entries(),
            sweep_interval_ms: default_sweep_interval_ms(),
            single_flight_timeout_ms: default_single_flight_timeout_ms(),
            key_prefix: default_cache_key_prefix(),
        }
    }
}

impl TieredCacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.l1_ttl_ms == 0 {
            return Err(ConfigError::invalid("cache.l1_ttl_ms", "must be > 0"));
        }
        if self.l1_max_ttl_ms == 0 {
            return Err(ConfigError::invalid("cache.l1_max_ttl_ms", "must be > 0"));
        }
        if self.l1_ttl_ms > self.l1_max_ttl_ms {
            return Err(ConfigError::invalid(
                "cache.l1_ttl_ms",
                format!(
                    "default L1 TTL ({}ms) exceeds cache.l1_max_ttl_ms ({}ms)",
                    self.l1_ttl_ms, self.l1_max_ttl_ms
                ),
            ));
        }
        let max_ttl_ms = MAX_TTL_SECS * 1000;
        if self.l1_max_ttl_ms > max_ttl_ms {
            return Err(ConfigError::invalid(
                "cache.l1_max_ttl_ms",
                format!("must be <= {max_ttl_ms}"),
            ));
        }
        if self.l2_ttl_ms > max_ttl_ms {
            return Err(ConfigError::invalid(
                "cache.l2_ttl_ms",
                format!("must be <= {max_ttl_ms}"),
            ));
        }
        if self.l2_ttl_ms < self.l1_ttl_ms {
            return Err(ConfigError::invalid(
                "cache.l2_ttl_ms",
                "must be >= cache.l1_ttl_ms",
            ));
        }
        if self.l1_max_entries == 0 {
            return Err(ConfigError::invalid("cache.l1_max_entries", "must be > 0"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::invalid("cache.sweep_interval_ms", "must be > 0"));
        }
        if self.single_flight_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "cache.single_flight_timeout_ms",
                "must be > 0",
            ));
        }
        Ok(())
    }

    pub fn l1_ttl(&self) -> Duration {
        Duration::from_millis(self.l1_ttl_ms)
    }

    pub fn l1_max_ttl(&self) -> Duration {
        Duration::from_millis(self.l1_max_ttl_ms)
    }

    pub fn l2_ttl(&self) -> Duration {
        Duration::from_millis(self.l2_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn single_flight_timeout(&self) -> Duration {
        Duration::from_millis(self.single_flight_timeout_ms)
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Namespace prepended to every counter key in the remote store
    #[serde(default = "default_rate_limit_key_prefix")]
    pub key_prefix: String,

    /// Interval between purges of expired local (fallback) windows
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_rate_limit_key_prefix() -> String {
    "pagewise:ratelimit:".to_string()
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_rate_limit_key_prefix(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "rate_limit.sweep_interval_ms",
                "must be > 0",
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Redis configuration for the shared tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (single-instance deployments need no shared tier)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.url.trim().is_empty() {
            return Err(ConfigError::invalid(
                "redis.url",
                "must be set when redis.enabled=true",
            ));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::invalid("redis.pool_size", "must be > 0"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("redis.timeout_ms", "must be > 0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
