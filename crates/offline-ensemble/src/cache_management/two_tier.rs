//! Two-tier cache: bounded LRU memory tier in front of the SQLite store.
//!
//! Reads check memory first, then the persistent tier, restoring hits into
//! memory with their original write time. TTL is evaluated at read time
//! only; an expired entry is removed from the tier it was found in.

use super::cache_config::CacheConfig;
use super::clock::{Clock, SystemClock};
use super::memory_tier::{MemoryEntry, MemoryTier};
use crate::metrics;
use crate::storage::PersistentStore;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Memoised embedding vectors, keyed by content hash.
pub type EmbeddingCache = TwoTierCache<Vec<f32>>;

/// Memoised answers, keyed by normalised question hash.
pub type ExplanationCache = TwoTierCache<String>;

/// Stable cache key for arbitrary text.
pub fn content_key(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

#[derive(Default)]
struct CacheCounters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    expired: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub name: String,
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub expired_evictions: u64,
    pub memory_entries: u64,
    pub persistent_entries: Option<usize>,
    pub hit_rate: f64,
}

pub struct TwoTierCache<V> {
    name: String,
    config: CacheConfig,
    memory: MemoryTier<V>,
    persistent: Option<PersistentStore>,
    clock: Arc<dyn Clock>,
    counters: CacheCounters,
}

impl<V> TwoTierCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        config: CacheConfig,
        persistent: Option<PersistentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            memory: MemoryTier::new(config.max_memory_entries),
            config,
            persistent,
            clock,
            counters: CacheCounters::default(),
        }
    }

    /// Memory-only cache on the system clock.
    pub fn in_memory(name: impl Into<String>, config: CacheConfig) -> Self {
        Self::new(name, config, None, Arc::new(SystemClock))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn store(&self) -> Option<&PersistentStore> {
        self.persistent.as_ref().filter(|_| self.config.persist_enabled)
    }

    fn is_expired(&self, created_at: DateTime<Utc>) -> bool {
        // An entry stamped in the future (clock moved back) counts as fresh.
        match self.clock.now().signed_duration_since(created_at).to_std() {
            Ok(age) => age > self.config.ttl,
            Err(_) => false,
        }
    }

    fn record(&self, outcome: &str) {
        metrics::record_cache_lookup(&self.name, outcome);
    }

    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(entry) = self.memory.get(key) {
            if !self.is_expired(entry.created_at) {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                self.record("memory_hit");
                return Some(entry.value);
            }
            self.memory.remove(key);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(value) = self.get_persistent(key) {
            self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
            self.record("persistent_hit");
            return Some(value);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.record("miss");
        None
    }

    fn get_persistent(&self, key: &str) -> Option<V> {
        let store = self.store()?;
        let stored = match store.get(key) {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!(cache = %self.name, "Persistent cache read failed: {}", e);
                return None;
            }
        };

        if self.is_expired(stored.created_at) {
            debug!(cache = %self.name, "Purging expired persistent entry");
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.remove_persistent(store, key);
            return None;
        }

        match bincode::deserialize::<V>(&stored.value) {
            Ok(value) => {
                self.memory.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: value.clone(),
                        created_at: stored.created_at,
                    },
                );
                Some(value)
            }
            Err(e) => {
                warn!(cache = %self.name, "Dropping undecodable cache entry: {}", e);
                self.remove_persistent(store, key);
                None
            }
        }
    }

    fn remove_persistent(&self, store: &PersistentStore, key: &str) {
        if let Err(e) = store.remove(key) {
            warn!(cache = %self.name, "Persistent cache delete failed: {}", e);
        }
    }

    /// Writes both tiers, stamped with the current time. When persistence is
    /// on and the persistent write fails, the memory tier drops the key so it
    /// never holds a value the store does not.
    pub fn put(&self, key: &str, value: V) {
        let created_at = self.clock.now();

        if let Some(store) = self.store() {
            if !self.put_persistent(store, key, &value, created_at) {
                self.memory.remove(key);
                return;
            }
        }

        self.memory
            .insert(key.to_string(), MemoryEntry { value, created_at });
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn put_persistent(&self, store: &PersistentStore, key: &str, value: &V, created_at: DateTime<Utc>) -> bool {
        let bytes = match bincode::serialize(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(cache = %self.name, "Failed to encode cache entry: {}", e);
                return false;
            }
        };
        match store.put(key, &bytes, created_at) {
            Ok(()) => true,
            Err(e) => {
                warn!(cache = %self.name, "Persistent cache write failed: {}", e);
                false
            }
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.memory.remove(key);
        if let Some(store) = self.store() {
            self.remove_persistent(store, key);
        }
    }

    /// Empties both tiers. Rows left by an earlier run are removed even when
    /// persistence is currently switched off.
    pub fn clear(&self) {
        self.memory.clear();
        if let Some(store) = &self.persistent {
            if let Err(e) = store.clear() {
                warn!(cache = %self.name, "Persistent cache clear failed: {}", e);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.memory.sync();
        let memory_hits = self.counters.memory_hits.load(Ordering::Relaxed);
        let persistent_hits = self.counters.persistent_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = memory_hits + persistent_hits + misses;

        CacheStats {
            name: self.name.clone(),
            memory_hits,
            persistent_hits,
            misses,
            writes: self.counters.writes.load(Ordering::Relaxed),
            expired_evictions: self.counters.expired.load(Ordering::Relaxed),
            memory_entries: self.memory.len(),
            persistent_entries: self.store().and_then(|s| s.len().ok()),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (memory_hits + persistent_hits) as f64 / lookups as f64
            },
        }
    }
}
