//! Memory tier using moka with least-recently-used eviction.
//!
//! Entries carry the timestamp of the original write so the two-tier cache
//! can apply its TTL at read time. moka's own expiry is not used.

use chrono::{DateTime, Utc};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;

#[derive(Debug, Clone)]
pub struct MemoryEntry<V> {
    pub value: V,
    pub created_at: DateTime<Utc>,
}

pub struct MemoryTier<V> {
    cache: Cache<String, MemoryEntry<V>>,
}

impl<V> MemoryTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self { cache }
    }

    /// Reading an entry refreshes its recency.
    pub fn get(&self, key: &str) -> Option<MemoryEntry<V>> {
        self.cache.get(key)
    }

    pub fn insert(&self, key: String, entry: MemoryEntry<V>) {
        self.cache.insert(key, entry);
    }

    pub fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }

    /// Approximate; moka applies evictions lazily.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Applies pending evictions so `len` is exact.
    pub fn sync(&self) {
        self.cache.run_pending_tasks();
    }
}
