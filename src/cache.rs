//! TTL cache
//!
//! Process-local key→value store where every entry carries its own expiry.
//! Reads ignore expired entries; a periodic `sweep` deletes them. Entries are
//! replaced whole, so concurrent writers of the same key simply race and the
//! last write wins.

use dashmap::DashMap;
use std::hash::Hash;
use std::time::Duration;

use crate::clock::SharedClock;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at_ms: i64,
}

pub struct TtlCache<K, V> {
    name: &'static str,
    entries: DashMap<K, CacheEntry<V>>,
    ttl: Duration,
    clock: SharedClock,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, ttl: Duration, clock: SharedClock) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_ms();
        let entry = self.entries.get(key)?;
        if entry.expires_at_ms > now {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn set(&self, key: K, value: V) {
        let expires_at_ms = self.clock.now_ms() + self.ttl.as_millis() as i64;
        self.entries.insert(key, CacheEntry { value, expires_at_ms });
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Delete every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at_ms > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            crate::metrics::CACHE_EVICTIONS
                .with_label_values(&[self.name])
                .inc_by(removed as u64);
            tracing::debug!(cache = self.name, removed, "Swept expired cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
