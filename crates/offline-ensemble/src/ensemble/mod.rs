//! The ensemble: three swappable backends behind one orchestrator

pub mod context_builder;
pub mod explainer;
pub mod extractive_qa;
pub mod fallback;
pub mod intent;
pub mod orchestrator;
pub mod retriever;
pub mod tokenizer;

pub use explainer::AnswerService;
pub use extractive_qa::{ExtractiveQa, QaError, QaResult};
pub use intent::{Intent, IntentClassifier, IntentResult};
pub use orchestrator::{EnsembleComponents, EnsembleConfig, EnsembleOrchestrator, DEFAULT_MAX_TOKENS};
pub use retriever::{RetrievalOutcome, RetrievalResult, Retriever, RetrieverError};
