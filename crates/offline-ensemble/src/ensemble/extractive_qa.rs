//! Extractive question answering over a context string, gated by a minimum
//! confidence.

use crate::model_runtime::{BackendLoader, BackendSlot, BackendUnavailable, QaBackend, QaCandidate};
use crate::model_state::ModelKind;
use crate::thread_pool::{InferencePool, PoolError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const MIN_CONFIDENCE: f32 = 0.3;
pub const BLANK_QUESTION_ANSWER: &str = "Please ask a specific question.";
pub const DEFAULT_ANSWER: &str = "I don't have enough information to answer that question.";

const HIGH_CONFIDENCE: f32 = 0.7;
const MODERATE_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaResult {
    pub answer: String,
    pub confidence: f32,
    /// False when the answer is a placeholder rather than backend output
    pub from_model: bool,
}

impl QaResult {
    fn placeholder(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            confidence: 0.0,
            from_model: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QaError {
    #[error("extractive QA backend not loaded")]
    NotLoaded,
    #[error("extractive QA inference failed: {0}")]
    Inference(String),
    #[error(transparent)]
    Worker(#[from] PoolError),
}

pub struct ExtractiveQa {
    slot: BackendSlot<dyn QaBackend>,
    loader: Arc<dyn BackendLoader>,
    pool: Arc<InferencePool>,
    min_confidence: f32,
}

impl ExtractiveQa {
    pub fn new(loader: Arc<dyn BackendLoader>, pool: Arc<InferencePool>) -> Self {
        Self {
            slot: BackendSlot::new(ModelKind::ExtractiveQa),
            loader,
            pool,
            min_confidence: MIN_CONFIDENCE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub async fn initialize(&self, artifact: &Path) -> Result<(), BackendUnavailable> {
        let loader = self.loader.clone();
        let artifact = artifact.to_path_buf();
        self.slot
            .ensure_loaded(&self.pool, move || loader.load_qa(&artifact))
            .await
            .map(|_| ())
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_loaded()
    }

    pub async fn answer(&self, context: &str, question: &str) -> Result<QaResult, QaError> {
        if question.trim().is_empty() {
            return Ok(QaResult::placeholder(BLANK_QUESTION_ANSWER));
        }
        if context.trim().is_empty() {
            return Ok(QaResult::placeholder(DEFAULT_ANSWER));
        }

        let candidates = self.run_backend(context, question).await?;
        let Some(top) = candidates.into_iter().next() else {
            debug!("Extractive QA produced no candidates");
            return Ok(QaResult::placeholder(DEFAULT_ANSWER));
        };

        if top.score < self.min_confidence || top.text.trim().is_empty() {
            debug!("Extractive QA answer below gate (score {:.3})", top.score);
            return Ok(QaResult {
                answer: DEFAULT_ANSWER.to_string(),
                confidence: top.score,
                from_model: true,
            });
        }

        Ok(QaResult {
            answer: format_answer(&top.text, top.score),
            confidence: top.score,
            from_model: true,
        })
    }

    /// Answers against several passages joined into one context. Blank
    /// passages are skipped.
    pub async fn answer_with_contexts(
        &self,
        contexts: &[&str],
        question: &str,
    ) -> Result<QaResult, QaError> {
        let combined = contexts
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        self.answer(&combined, question).await
    }

    /// Up to `max` raw candidates, best first, without gating.
    pub async fn answer_candidates(
        &self,
        context: &str,
        question: &str,
        max: usize,
    ) -> Result<Vec<QaCandidate>, QaError> {
        if question.trim().is_empty() || context.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut candidates = self.run_backend(context, question).await?;
        candidates.truncate(max);
        Ok(candidates)
    }

    async fn run_backend(&self, context: &str, question: &str) -> Result<Vec<QaCandidate>, QaError> {
        let backend = self.slot.get().ok_or(QaError::NotLoaded)?;
        let context = context.to_string();
        let question = question.to_string();
        self.pool
            .run(move || backend.answer(&context, &question))
            .await?
            .map_err(|e| QaError::Inference(e.to_string()))
    }

    pub fn close(&self) -> bool {
        self.slot.close()
    }
}

/// Appends a visible caveat to answers below the high-confidence band.
pub fn format_answer(text: &str, score: f32) -> String {
    let text = text.trim();
    if score >= HIGH_CONFIDENCE {
        text.to_string()
    } else if score >= MODERATE_CONFIDENCE {
        format!("{} (Moderate confidence)", text)
    } else {
        format!("{} (Low confidence - verify this information)", text)
    }
}
