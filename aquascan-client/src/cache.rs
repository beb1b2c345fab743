//! Time-bounded result cache
//!
//! Maps a caller-chosen resource key to its last known value and fetch time.
//! Freshness is evaluated lazily on `get`; there is no background sweeper.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Default freshness window
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
}

/// Result cache with a single TTL for every key
///
/// Last write wins: `set` replaces the value and restarts its freshness
/// window. Callers that need real-time data for a key must bypass the cache.
#[derive(Debug)]
pub struct ResultCache<V = Value> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Fresh value for `key`, if any
    ///
    /// An expired entry is removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = match entries.get(key) {
            None => return None,
            Some(entry) => entry.fetched_at.elapsed() < self.ttl,
        };
        if fresh {
            entries.get(key).map(|entry| entry.value.clone())
        } else {
            entries.remove(key);
            None
        }
    }

    pub fn delete(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Remove every key starting with `prefix`; returns how many were removed
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Whether any fresh entry under `prefix` satisfies `predicate`
    pub fn any_fresh(&self, prefix: &str, predicate: impl Fn(&V) -> bool) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().any(|(key, entry)| {
            key.starts_with(prefix) && entry.fetched_at.elapsed() < self.ttl && predicate(&entry.value)
        })
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    /// Number of stored entries, expired ones included until next touched
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
