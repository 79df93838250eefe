//! Backend contracts the ensemble depends on.
//!
//! The ensemble never sees an inference runtime directly. A `BackendLoader`
//! turns an artifact file into one of the three backend handles below, and
//! each handle is treated as an opaque blocking function plus `close`.

use crate::model_state::ModelKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// On-disk artifact formats a loader may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFormat {
    TFLite,
    ONNX,
    /// Raw weights blob
    Binary,
    /// Declarative model description, used by the lexical backends
    Json,
}

impl ModelFormat {
    pub const ALL: [ModelFormat; 4] = [
        ModelFormat::TFLite,
        ModelFormat::ONNX,
        ModelFormat::Binary,
        ModelFormat::Json,
    ];

    pub fn extensions(&self) -> &[&str] {
        match self {
            ModelFormat::TFLite => &["tflite"],
            ModelFormat::ONNX => &["onnx"],
            ModelFormat::Binary => &["bin"],
            ModelFormat::Json => &["json"],
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ModelFormat::TFLite => "TensorFlow Lite",
            ModelFormat::ONNX => "ONNX",
            ModelFormat::Binary => "Raw binary",
            ModelFormat::Json => "JSON descriptor",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMetadata {
    pub kind: ModelKind,
    pub format: ModelFormat,
    pub backend_name: String,
    pub artifact_path: PathBuf,
}

/// Lifecycle shared by every backend handle. Calls are blocking and may be
/// made from any worker thread.
pub trait ModelBackend: Send + Sync {
    fn metadata(&self) -> BackendMetadata;

    /// Releases native resources. Must tolerate being called more than once.
    fn close(&self) {}
}

/// `token ids -> raw embedding vector`. Normalization is the caller's job.
pub trait EmbeddingBackend: ModelBackend {
    fn dimensions(&self) -> usize;

    fn embed(&self, token_ids: &[u32]) -> anyhow::Result<Vec<f32>>;
}

/// A span extracted from the context, with the backend's score for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaCandidate {
    pub text: String,
    pub score: f32,
}

/// `(context, question) -> candidates`, best first.
pub trait QaBackend: ModelBackend {
    fn answer(&self, context: &str, question: &str) -> anyhow::Result<Vec<QaCandidate>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentScore {
    pub label: String,
    pub score: f32,
}

/// `text -> label scores`, best first.
pub trait IntentBackend: ModelBackend {
    fn classify(&self, text: &str) -> anyhow::Result<Vec<IntentScore>>;
}

/// Turns artifact files into backend handles. Loads are blocking and run on
/// the inference pool.
pub trait BackendLoader: Send + Sync {
    fn load_embedding(&self, artifact: &Path) -> anyhow::Result<Arc<dyn EmbeddingBackend>>;

    fn load_qa(&self, artifact: &Path) -> anyhow::Result<Arc<dyn QaBackend>>;

    fn load_intent(&self, artifact: &Path) -> anyhow::Result<Arc<dyn IntentBackend>>;
}
