use std::net::SocketAddr;

use pagewise_cache::{RateLimiterConfig, RedisConfig, TieredCacheConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Redis configuration (shared L2 tier and global rate-limit counters)
    #[serde(default)]
    pub redis: RedisConfig,
    /// Tiered cache configuration
    #[serde(default)]
    pub cache: TieredCacheConfig,
    /// Rate limiting for `/api/*`
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Cache and Redis validations
        self.redis.validate().map_err(|e| e.to_string())?;
        self.cache.validate().map_err(|e| e.to_string())?;
        // Rate limit validations
        if self.rate_limit.enabled && self.rate_limit.window_seconds == 0 {
            return Err("rate_limit.window_seconds must be > 0".into());
        }
        self.rate_limit
            .limiter_config()
            .validate()
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    64 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Rate limiting applied to every `/api/*` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    /// Requests allowed per client and route within one window
    #[serde(default = "default_rate_limit_limit")]
    pub limit: u32,
    #[serde(default = "default_rate_limit_window_seconds")]
    pub window_seconds: u64,
    /// Namespace for counters in Redis
    #[serde(default = "default_rate_limit_key_prefix")]
    pub key_prefix: String,
    /// Interval between purges of expired process-local windows
    #[serde(default = "default_rate_limit_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Key clients by the first `X-Forwarded-For` hop instead of the peer
    /// address. Only enable behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

fn default_rate_limit_enabled() -> bool {
    true
}
fn default_rate_limit_limit() -> u32 {
    60
}
fn default_rate_limit_window_seconds() -> u64 {
    60
}
fn default_rate_limit_key_prefix() -> String {
    RateLimiterConfig::default().key_prefix
}
fn default_rate_limit_sweep_interval_ms() -> u64 {
    RateLimiterConfig::default().sweep_interval_ms
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            limit: default_rate_limit_limit(),
            window_seconds: default_rate_limit_window_seconds(),
            key_prefix: default_rate_limit_key_prefix(),
            sweep_interval_ms: default_rate_limit_sweep_interval_ms(),
            trust_forwarded_for: false,
        }
    }
}

impl RateLimitSettings {
    pub fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            key_prefix: self.key_prefix.clone(),
            sweep_interval_ms: self.sweep_interval_ms,
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from("pagewise.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., PAGEWISE__CACHE__L1_TTL_MS=5000
        builder = builder.add_source(
            Environment::with_prefix("PAGEWISE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        // Validate
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().unwrap_err().contains("logging.level"));
    }

    #[test]
    fn test_cache_errors_surface_through_app_config() {
        let mut cfg = AppConfig::default();
        cfg.cache.l1_max_entries = 0;
        assert!(cfg.validate().unwrap_err().contains("cache.l1_max_entries"));
    }

    #[test]
    fn test_limiter_config_carries_prefix() {
        let settings = RateLimitSettings {
            key_prefix: "custom:".into(),
            ..Default::default()
        };
        assert_eq!(settings.limiter_config().key_prefix, "custom:");
    }
}
