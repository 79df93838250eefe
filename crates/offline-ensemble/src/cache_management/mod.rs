//! Two-tier caches memoising embeddings and answers

pub mod cache_config;
pub mod clock;
pub mod memory_tier;
pub mod two_tier;

pub use cache_config::CacheConfig;
pub use clock::{Clock, ManualClock, SystemClock};
pub use memory_tier::{MemoryEntry, MemoryTier};
pub use two_tier::{content_key, CacheStats, EmbeddingCache, ExplanationCache, TwoTierCache};
