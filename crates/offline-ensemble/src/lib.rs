// crates/offline-ensemble/src/lib.rs

pub mod cache_management;
pub mod cancellation;
pub mod config;
pub mod ensemble;
pub mod knowledge;
pub mod metrics;
pub mod model_runtime;
pub mod model_state;
pub mod shared_state;
pub mod single_flight;
pub mod storage;
pub mod telemetry;
pub mod thread_pool;

// Public API exports
pub use cancellation::CancellationToken;
pub use config::Config;
pub use ensemble::{AnswerService, EnsembleComponents, EnsembleConfig, EnsembleOrchestrator};
pub use knowledge::{InMemoryKnowledgeBase, JsonKnowledgeBase, KnowledgeBase, KnowledgeEntry};
pub use model_state::{
    EnsembleHealth, GenerationResult, HealthStatus, InitializationError, ModelKind, ModelState,
};
pub use shared_state::{EnsembleServices, SharedEnsemble};
