//! Answer service: the explanation cache in front of the orchestrator.
//!
//! Answers are cached by the hash of the normalised question. Template
//! fallbacks are cached too, so a question the ensemble cannot answer does
//! not run the pipeline again until the entry expires or is invalidated.

use super::fallback;
use super::orchestrator::EnsembleOrchestrator;
use crate::cache_management::{content_key, CacheStats, ExplanationCache};
use crate::model_state::GenerationResult;
use std::sync::Arc;
use tracing::{debug, warn};

pub const FALLBACK_REASON: &str = "Model not available";

/// Lowercased, with whitespace runs collapsed to one space.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn question_key(question: &str) -> String {
    content_key(&normalize_question(question))
}

pub struct AnswerService {
    orchestrator: Arc<EnsembleOrchestrator>,
    cache: Arc<ExplanationCache>,
}

impl AnswerService {
    pub fn new(orchestrator: Arc<EnsembleOrchestrator>, cache: Arc<ExplanationCache>) -> Self {
        Self { orchestrator, cache }
    }

    pub fn orchestrator(&self) -> &Arc<EnsembleOrchestrator> {
        &self.orchestrator
    }

    pub async fn answer_question(&self, question: &str) -> GenerationResult {
        let max_tokens = self.orchestrator.config().default_max_tokens;
        self.answer_question_with_limit(question, max_tokens).await
    }

    pub async fn answer_question_with_limit(&self, question: &str, max_tokens: usize) -> GenerationResult {
        let key = question_key(question);
        let lookup = key.clone();
        let cached = self
            .with_cache(move |cache| cache.get(&lookup))
            .await
            .flatten();
        if let Some(text) = cached {
            debug!("Answer served from explanation cache");
            return GenerationResult::Success {
                tokens_generated: 0,
                text,
                inference_time_ms: 0,
                from_cache: true,
            };
        }

        match self.orchestrator.generate(question, max_tokens).await {
            GenerationResult::Success {
                text,
                tokens_generated,
                inference_time_ms,
                from_cache,
            } => {
                self.store(key, text.clone()).await;
                GenerationResult::Success {
                    text,
                    tokens_generated,
                    inference_time_ms,
                    from_cache,
                }
            }
            GenerationResult::Failure { error, .. } => {
                warn!("Ensemble generation failed, using template answer: {}", error);
                self.template_answer(key, question).await
            }
            GenerationResult::Unavailable { reason, .. } => {
                debug!("Ensemble unavailable ({}), using template answer", reason);
                self.template_answer(key, question).await
            }
        }
    }

    async fn template_answer(&self, key: String, question: &str) -> GenerationResult {
        let text = fallback::educational_answer(question).to_string();
        self.store(key, text.clone()).await;
        GenerationResult::Unavailable {
            reason: FALLBACK_REASON.to_string(),
            fallback_text: text,
        }
    }

    async fn store(&self, key: String, text: String) {
        self.with_cache(move |cache| cache.put(&key, text)).await;
    }

    pub async fn invalidate(&self, question: &str) {
        let key = question_key(question);
        self.with_cache(move |cache| cache.invalidate(&key)).await;
    }

    pub async fn clear_cache(&self) {
        self.with_cache(|cache| cache.clear()).await;
    }

    pub async fn cache_stats(&self) -> Option<CacheStats> {
        self.with_cache(|cache| cache.stats()).await
    }

    /// Runs a cache operation off the async workers; the persistent tier does
    /// blocking SQLite I/O. `None` if the task died.
    async fn with_cache<F, R>(&self, job: F) -> Option<R>
    where
        F: FnOnce(&ExplanationCache) -> R + Send + 'static,
        R: Send + 'static,
    {
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || job(cache.as_ref())).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Explanation cache task failed: {}", e);
                None
            }
        }
    }
}
