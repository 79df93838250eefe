//! Lifecycle states, initialization errors and generation results shared by
//! every stateful component of the ensemble.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifies one of the three backends that make up the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelKind {
    /// Sentence embedding model behind the retriever (required)
    SentenceEmbeddings,
    /// Extractive question answering model (required)
    ExtractiveQa,
    /// Intent classification model (optional)
    IntentClassifier,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::SentenceEmbeddings,
        ModelKind::ExtractiveQa,
        ModelKind::IntentClassifier,
    ];

    /// Backends that must be present before the ensemble can load.
    pub const REQUIRED: [ModelKind; 2] = [ModelKind::SentenceEmbeddings, ModelKind::ExtractiveQa];

    pub fn is_required(&self) -> bool {
        !matches!(self, ModelKind::IntentClassifier)
    }

    /// File stem the artifact is expected under inside the models directory.
    pub fn file_stem(&self) -> &'static str {
        match self {
            ModelKind::SentenceEmbeddings => "sentence_embeddings",
            ModelKind::ExtractiveQa => "mobilebert_qa_squad",
            ModelKind::IntentClassifier => "intent_classifier",
        }
    }

    /// Canonical artifact file name reported to users when it is missing.
    pub fn artifact_name(&self) -> String {
        format!("{}.tflite", self.file_stem())
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ModelKind::SentenceEmbeddings => "Embeddings retriever",
            ModelKind::ExtractiveQa => "Extractive Q&A",
            ModelKind::IntentClassifier => "Intent classifier",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Lifecycle state of the ensemble. Exactly one holds at a time per
/// orchestrator; it decides whether `generate` may proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelState {
    NotDownloaded,
    PartiallyDownloaded {
        imported: usize,
        total: usize,
        imported_set: BTreeSet<ModelKind>,
    },
    Downloaded,
    Loading,
    Ready,
    Generating,
    Error {
        message: String,
        recoverable: bool,
    },
}

impl ModelState {
    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        ModelState::Error {
            message: message.into(),
            recoverable,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ModelState::Ready)
    }

    /// Short reason string used when `generate` cannot run in this state.
    pub fn unavailable_reason(&self) -> String {
        match self {
            ModelState::NotDownloaded => "Ensemble models not downloaded".to_string(),
            ModelState::PartiallyDownloaded { imported, total, .. } => {
                format!("Only {}/{} required models imported", imported, total)
            }
            ModelState::Downloaded => "Models not loaded into memory".to_string(),
            ModelState::Loading => "Models currently loading".to_string(),
            ModelState::Error { message, .. } => format!("Model error: {}", message),
            ModelState::Ready | ModelState::Generating => "Models not ready".to_string(),
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelState::NotDownloaded => write!(f, "NotDownloaded"),
            ModelState::PartiallyDownloaded { imported, total, .. } => {
                write!(f, "PartiallyDownloaded({}/{})", imported, total)
            }
            ModelState::Downloaded => write!(f, "Downloaded"),
            ModelState::Loading => write!(f, "Loading"),
            ModelState::Ready => write!(f, "Ready"),
            ModelState::Generating => write!(f, "Generating"),
            ModelState::Error { message, recoverable } => {
                write!(f, "Error({}, recoverable={})", message, recoverable)
            }
        }
    }
}

/// Why `initialize` failed. Returned as a value so callers can tell "no
/// models at all" from "some models missing" from "models present but broken".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitializationError {
    #[error("{0}")]
    ModelNotFound(String),

    #[error("Only {imported}/{total} required models available. Missing: {}", missing.join(", "))]
    PartialModels {
        imported: usize,
        total: usize,
        missing: Vec<String>,
    },

    #[error("Failed to load AI models: {cause}")]
    LoadFailed { cause: String },

    #[error("{0}")]
    LoaderNotImplemented(String),
}

impl InitializationError {
    pub fn load_failed(cause: impl fmt::Display) -> Self {
        InitializationError::LoadFailed {
            cause: cause.to_string(),
        }
    }

    /// Missing-artifact errors need user action; load failures may be retried.
    pub fn is_missing_artifact(&self) -> bool {
        matches!(
            self,
            InitializationError::ModelNotFound(_) | InitializationError::PartialModels { .. }
        )
    }
}

/// Outcome of a `generate` call. Every variant carries text the caller can
/// show, so the ensemble never answers with nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GenerationResult {
    Success {
        text: String,
        tokens_generated: usize,
        inference_time_ms: u64,
        from_cache: bool,
    },
    Failure {
        error: String,
        fallback_text: Option<String>,
    },
    Unavailable {
        reason: String,
        fallback_text: String,
    },
}

const GENERIC_FAILURE_TEXT: &str =
    "Something went wrong while answering. Please try again in a moment.";

impl GenerationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, GenerationResult::Success { .. })
    }

    /// Text to display: the answer, or the fallback for non-success results.
    pub fn display_text(&self) -> &str {
        match self {
            GenerationResult::Success { text, .. } => text,
            GenerationResult::Failure { fallback_text, .. } => {
                fallback_text.as_deref().unwrap_or(GENERIC_FAILURE_TEXT)
            }
            GenerationResult::Unavailable { fallback_text, .. } => fallback_text,
        }
    }
}

/// Coarse health of the ensemble for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Retriever and extractive QA loaded
    Healthy,
    /// Running in retrieval-only mode
    Degraded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleHealth {
    pub status: HealthStatus,
    pub message: String,
    pub models_loaded: Vec<ModelKind>,
}
