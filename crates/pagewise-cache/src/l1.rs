//! In-process L1 tier: a bounded LRU table with per-entry TTL.
//!
//! Every operation takes the table lock for its whole duration and never
//! awaits while holding it, so lookups, inserts, evictions and sweeps are
//! atomic with respect to each other.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use tokio::time::Instant;

/// A cached L1 value.
///
/// The payload is wrapped in `Arc` so hits hand out a reference count, not a
/// copy of the value.
#[derive(Debug)]
pub struct L1Entry<V> {
    pub data: Arc<V>,
    pub expires_at: Instant,
    pub hits: u64,
    pub last_accessed: Instant,
}

impl<V> L1Entry<V> {
    fn new(data: Arc<V>, ttl: Duration, now: Instant) -> Self {
        Self {
            data,
            expires_at: now + ttl,
            hits: 0,
            last_accessed: now,
        }
    }

    /// Entries are logically absent once `now` is past `expires_at`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Outcome of an [`L1Table::insert`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Number of other entries evicted to stay within capacity.
    pub evicted: usize,
}

pub struct L1Table<V> {
    entries: Mutex<LruCache<String, L1Entry<V>>>,
    capacity: NonZeroUsize,
}

impl<V> L1Table<V> {
    /// A zero capacity is clamped to one entry.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live entry, bumping its recency and hit count.
    ///
    /// An expired entry is removed on the spot and reported as absent.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hits += 1;
                entry.last_accessed = now;
                return Some(Arc::clone(&entry.data));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
        }
        None
    }

    /// Remaining lifetime of a live entry, without touching recency.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.expires_at.saturating_duration_since(now))
    }

    /// Hit count of a live entry, without touching recency.
    pub fn hits(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.hits)
    }

    /// Insert or replace `key`. When the table is full, the least recently
    /// accessed entry makes room.
    pub fn insert(&self, key: String, data: Arc<V>, ttl: Duration) -> InsertOutcome {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let mut evicted = 0;
        // `push` hands back either the replaced value for the same key or the
        // LRU victim; only the latter is an eviction.
        if let Some((old_key, _)) = entries.push(key.clone(), L1Entry::new(data, ttl, now)) {
            if old_key != key {
                evicted += 1;
            }
        }

        InsertOutcome { evicted }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Remove every key matched by `matcher`. Returns the number removed.
    pub fn remove_matching(&self, matcher: &Regex) -> usize {
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| matcher.is_match(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Keys ordered from most to least recently accessed.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Compile a `*`-wildcard glob into an anchored regex.
///
/// Everything except `*` is matched literally; `*` also spans newlines.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    Regex::new(&format!("(?s)^{body}$"))
}
