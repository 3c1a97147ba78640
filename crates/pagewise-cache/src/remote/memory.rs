//! In-process [`RemoteStore`] with native expiry.
//!
//! Several cache instances can share one `MemoryStore` to behave like
//! separate processes pointed at the same Redis. `set_available(false)`
//! simulates an outage: every call then fails with
//! [`RemoteError::Unavailable`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{MAX_TTL_SECS, RemoteStore, WindowCount, ceil_secs};
use crate::error::RemoteError;

#[derive(Debug, Clone)]
enum StoredValue {
    Bytes(Vec<u8>),
    Counter(u64),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Instant,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredEntry>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is present and unexpired, bypassing the outage switch.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RemoteError::unavailable("memory store marked unavailable"))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.check_available()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.check_available()?;
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return match &entry.value {
                    StoredValue::Bytes(bytes) => Ok(Some(bytes.clone())),
                    StoredValue::Counter(n) => Ok(Some(n.to_string().into_bytes())),
                };
            }
            drop(entry);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), RemoteError> {
        self.check_available()?;
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Bytes(value.to_vec()),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs.clamp(1, MAX_TTL_SECS)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), RemoteError> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn incr_window(&self, key: &str, window_secs: u64) -> Result<WindowCount, RemoteError> {
        self.check_available()?;
        let now = Instant::now();
        let window = Duration::from_secs(window_secs.clamp(1, MAX_TTL_SECS));

        // The entry guard holds the shard lock, so read-modify-write is atomic.
        let (count, expires_at) = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let live = !entry.is_expired(now);
                match (&entry.value, live) {
                    (StoredValue::Counter(n), true) => {
                        let next = n + 1;
                        entry.value = StoredValue::Counter(next);
                        (next, entry.expires_at)
                    }
                    (StoredValue::Bytes(_), true) => {
                        return Err(RemoteError::command(format!(
                            "value at `{key}` is not an integer"
                        )));
                    }
                    (_, false) => {
                        *entry = StoredEntry {
                            value: StoredValue::Counter(1),
                            expires_at: now + window,
                        };
                        (1, entry.expires_at)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(StoredEntry {
                    value: StoredValue::Counter(1),
                    expires_at: now + window,
                });
                (1, entry.expires_at)
            }
        };

        let remaining = expires_at.saturating_duration_since(now);
        Ok(WindowCount {
            count,
            ttl_secs: ceil_secs(remaining),
        })
    }
}
