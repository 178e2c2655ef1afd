//! In-process TTL cache
//!
//! Shared by the artifact loader and the rules manager:
//! - Per-entry expiry, expired entries are dropped on read
//! - Hit/miss counters updated atomically
//! - Predicate-based invalidation returning the number of dropped keys
//! - Reader-preferring lock so parallel `get` calls don't serialize

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default TTL values
pub mod ttl {
    use std::time::Duration;

    pub const MANIFEST: Duration = Duration::from_secs(30);
    pub const ARTIFACT: Duration = Duration::from_secs(300);
    pub const RULES: Duration = Duration::from_secs(2);
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the value iff a non-expired entry exists.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired: re-check under the write lock, another writer may have refreshed it.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores `value` for `ttl`. A zero ttl deletes the key.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        if ttl.is_zero() {
            self.entries.write().remove(&key);
            return;
        }
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .insert(key, Entry { value, expires_at });
    }

    pub fn delete(&self, key: &K) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Drops every entry whose key matches `pred`.
    pub fn invalidate<F>(&self, pred: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !pred(k));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "ttl cache invalidated");
        }
        removed
    }

    pub fn clear(&self) -> usize {
        self.invalidate(|_| true)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
