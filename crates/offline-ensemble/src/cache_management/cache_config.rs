use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by the two-tier caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on memory-tier entries; least recently used go first
    pub max_memory_entries: u64,

    /// Age after which an entry is treated as absent in both tiers
    pub ttl: Duration,

    /// Whether writes reach the persistent tier at all
    pub persist_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_entries: 100,
            ttl: Duration::from_secs(24 * 60 * 60),
            persist_enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_entries(mut self, max_memory_entries: u64) -> Self {
        self.max_memory_entries = max_memory_entries.max(1);
        self
    }

    pub fn with_persistence(mut self, persist_enabled: bool) -> Self {
        self.persist_enabled = persist_enabled;
        self
    }
}
