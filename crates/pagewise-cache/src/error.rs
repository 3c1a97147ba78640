use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`crate::TieredCache`].
///
/// Tier failures (L1/L2) never show up here: they are logged and treated as
/// misses. Only the unit of work itself (the fetch) and the protective
/// single-flight timeout reach the caller.
///
/// The type is `Clone` because one fetch outcome is delivered to every
/// coalesced waiter.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache key must not be empty")]
    InvalidKey,

    #[error("fetch failed for key `{key}`: {cause}")]
    Fetch {
        key: String,
        cause: Arc<anyhow::Error>,
    },

    #[error("timed out after {waited:?} waiting for in-flight fetch of key `{key}`")]
    Timeout { key: String, waited: Duration },
}

impl CacheError {
    /// Create a new Fetch error
    pub fn fetch(key: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Fetch {
            key: key.into(),
            cause: Arc::new(cause),
        }
    }

    /// Create a new Timeout error
    pub fn timeout(key: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            key: key.into(),
            waited,
        }
    }

    /// Whether this is the protective single-flight timeout rather than a
    /// genuine fetch failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The underlying fetch error, if this is a fetch failure.
    pub fn fetch_cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Fetch { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

/// Errors from a remote key/value store.
///
/// Callers inside this crate never propagate these; they degrade the
/// affected tier instead.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("remote store is disabled")]
    Disabled,

    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("remote store command failed: {0}")]
    Command(String),
}

impl RemoteError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::Command(message.into())
    }
}

/// Configuration rejected at construction time.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}
