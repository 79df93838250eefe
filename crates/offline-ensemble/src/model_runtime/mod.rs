//! Model backends and their lifecycle.
//!
//! - `runtime_trait`: the contracts every backend and loader implements
//! - `runtime_manager`: per-component slot holding one loaded backend
//! - `artifact_store`: which artifacts exist and the state that implies
//! - `lexical`: deterministic reference backends
pub mod runtime_trait;
pub mod format_detector;
pub mod runtime_manager;
pub mod artifact_store;
pub mod lexical;

pub use runtime_trait::{
    BackendLoader, BackendMetadata, EmbeddingBackend, IntentBackend, IntentScore, ModelBackend,
    ModelFormat, QaBackend, QaCandidate,
};
pub use format_detector::FormatDetector;
pub use runtime_manager::{BackendSlot, BackendUnavailable};
pub use artifact_store::{derive_model_state, ArtifactPresence, ArtifactStore, DirectoryArtifactStore};
pub use lexical::LexicalBackendLoader;
