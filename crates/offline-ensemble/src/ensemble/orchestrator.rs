//! Ensemble orchestrator: lifecycle state machine and answer routing.
//!
//! `initialize` derives the lifecycle state from artifact presence and loads
//! the backends. The retriever is required; extractive QA and the intent
//! classifier are optional, and without QA the ensemble runs retrieval-only.
//!
//! `generate` routes a question through the backends:
//! 1. confident retrieval match (fast path)
//! 2. extractive QA over a context built from retrieval and intent
//! 3. the best retrieval match, however weak
//! 4. an "unavailable" result with fallback text
//!
//! Every call yields displayable text, and the `Generating` state it sets
//! is always cleared before it returns.

use super::context_builder;
use super::extractive_qa::ExtractiveQa;
use super::intent::{IntentClassifier, IntentResult};
use super::retriever::{RetrievalOutcome, Retriever, RetrieverError, RETRIEVAL_CONFIDENCE_THRESHOLD};
use crate::cache_management::EmbeddingCache;
use crate::cancellation::CancellationToken;
use crate::knowledge::KnowledgeBase;
use crate::metrics;
use crate::model_runtime::{derive_model_state, ArtifactPresence, ArtifactStore, BackendLoader};
use crate::model_state::{
    EnsembleHealth, GenerationResult, HealthStatus, InitializationError, ModelKind, ModelState,
};
use crate::single_flight::SingleFlight;
use crate::thread_pool::InferencePool;
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_TOKENS: usize = 512;

pub const MODELS_UNAVAILABLE_FALLBACK: &str = "Models not available. Using template response.";
pub const NO_MATCH_REASON: &str = "No matching answer found in knowledge base";
pub const NO_MATCH_FALLBACK: &str = "I don't have information about that specific topic. \
     Try asking about chart patterns, technical indicators, or trading strategies.";
pub const CANCELLED_ERROR: &str = "generation cancelled";

#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleConfig {
    pub retrieval_threshold: f32,
    pub qa_min_confidence: f32,
    pub default_max_tokens: usize,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            retrieval_threshold: RETRIEVAL_CONFIDENCE_THRESHOLD,
            qa_min_confidence: super::extractive_qa::MIN_CONFIDENCE,
            default_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Collaborators the orchestrator is built from.
pub struct EnsembleComponents {
    pub loader: Arc<dyn BackendLoader>,
    pub knowledge: Arc<dyn KnowledgeBase>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub pool: Arc<InferencePool>,
    pub embedding_cache: Option<Arc<EmbeddingCache>>,
}

impl EnsembleComponents {
    pub fn new(
        loader: Arc<dyn BackendLoader>,
        knowledge: Arc<dyn KnowledgeBase>,
        artifacts: Arc<dyn ArtifactStore>,
        pool: Arc<InferencePool>,
    ) -> Self {
        Self {
            loader,
            knowledge,
            artifacts,
            pool,
            embedding_cache: None,
        }
    }

    pub fn with_embedding_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.embedding_cache = Some(cache);
        self
    }
}

/// Backends usable by `generate`. `None` means absent for routing purposes.
#[derive(Default)]
struct LoadedBackends {
    retriever: Option<Arc<Retriever>>,
    qa: Option<Arc<ExtractiveQa>>,
    intent: Option<Arc<IntentClassifier>>,
}

impl LoadedBackends {
    fn kinds(&self) -> Vec<ModelKind> {
        let mut kinds = Vec::new();
        if self.retriever.is_some() {
            kinds.push(ModelKind::SentenceEmbeddings);
        }
        if self.qa.is_some() {
            kinds.push(ModelKind::ExtractiveQa);
        }
        if self.intent.is_some() {
            kinds.push(ModelKind::IntentClassifier);
        }
        kinds
    }
}

/// Concurrent `generate` calls share one `Generating` episode.
#[derive(Default)]
struct GenerationTracker {
    in_flight: usize,
    resume_state: Option<ModelState>,
    failure: Option<String>,
}

pub struct EnsembleOrchestrator {
    config: EnsembleConfig,
    artifacts: Arc<dyn ArtifactStore>,
    retriever: Arc<Retriever>,
    qa: Arc<ExtractiveQa>,
    intent: Arc<IntentClassifier>,
    loaded: ArcSwap<LoadedBackends>,
    state: ArcSwap<ModelState>,
    init: SingleFlight<Result<(), InitializationError>>,
    lifecycle: tokio::sync::Mutex<()>,
    generation: Mutex<GenerationTracker>,
}

impl EnsembleOrchestrator {
    pub fn new(components: EnsembleComponents, config: EnsembleConfig) -> Self {
        let EnsembleComponents {
            loader,
            knowledge,
            artifacts,
            pool,
            embedding_cache,
        } = components;

        let mut retriever = Retriever::new(loader.clone(), knowledge, pool.clone())
            .with_threshold(config.retrieval_threshold);
        if let Some(cache) = embedding_cache {
            retriever = retriever.with_cache(cache);
        }
        let qa = ExtractiveQa::new(loader.clone(), pool.clone())
            .with_min_confidence(config.qa_min_confidence);
        let intent = IntentClassifier::new(loader, pool);

        let initial_state = derive_model_state(&artifacts.scan());
        info!("Ensemble orchestrator created in state {}", initial_state);

        Self {
            config,
            artifacts,
            retriever: Arc::new(retriever),
            qa: Arc::new(qa),
            intent: Arc::new(intent),
            loaded: ArcSwap::from_pointee(LoadedBackends::default()),
            state: ArcSwap::from_pointee(initial_state),
            init: SingleFlight::new(),
            lifecycle: tokio::sync::Mutex::new(()),
            generation: Mutex::new(GenerationTracker::default()),
        }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn state(&self) -> ModelState {
        (**self.state.load()).clone()
    }

    fn set_state(&self, state: ModelState) {
        debug!("Ensemble state -> {}", state);
        self.state.store(Arc::new(state));
    }

    /// `Generating` only ever happens on top of `Ready`.
    fn is_serving_state(state: &ModelState) -> bool {
        matches!(state, ModelState::Ready | ModelState::Generating)
    }

    /// Ready with both required backends loaded.
    pub fn is_ready(&self) -> bool {
        let loaded = self.loaded.load();
        Self::is_serving_state(&self.state.load())
            && loaded.retriever.is_some()
            && loaded.qa.is_some()
    }

    pub fn retriever(&self) -> &Arc<Retriever> {
        &self.retriever
    }

    /// Re-reads artifact presence unless backends are loaded or loading.
    pub fn refresh_state(&self) -> ModelState {
        let current = self.state();
        if !Self::is_serving_state(&current) && current != ModelState::Loading {
            self.set_state(derive_model_state(&self.artifacts.scan()));
        }
        self.state()
    }

    pub fn health(&self) -> EnsembleHealth {
        let state = self.state();
        let loaded = self.loaded.load();
        let models_loaded = loaded.kinds();

        let (status, message) = match &state {
            s if Self::is_serving_state(s) && loaded.retriever.is_some() && loaded.qa.is_some() => {
                (HealthStatus::Healthy, "All models loaded".to_string())
            }
            s if Self::is_serving_state(s) && loaded.retriever.is_some() => (
                HealthStatus::Degraded,
                "Extractive QA unavailable - retrieval only".to_string(),
            ),
            ModelState::Error { .. }
            | ModelState::NotDownloaded
            | ModelState::PartiallyDownloaded { .. } => {
                (HealthStatus::Failed, state.unavailable_reason())
            }
            _ => (HealthStatus::Unknown, "Models not initialized".to_string()),
        };

        EnsembleHealth {
            status,
            message,
            models_loaded,
        }
    }

    /// Loads the backends if they are not loaded yet. Concurrent callers
    /// share a single attempt and its outcome.
    pub async fn initialize(&self) -> Result<(), InitializationError> {
        if self.is_ready() {
            return Ok(());
        }

        let outcome = self
            .init
            .run(|| async {
                let _lifecycle = self.lifecycle.lock().await;
                self.initialize_locked().await
            })
            .await;

        metrics::record_initialize(match &outcome {
            Ok(()) => "success",
            Err(e) if e.is_missing_artifact() => "missing_artifacts",
            Err(_) => "failure",
        });
        outcome
    }

    async fn initialize_locked(&self) -> Result<(), InitializationError> {
        let mut healed = false;
        loop {
            if self.is_ready() {
                return Ok(());
            }

            let presence = self.artifacts.scan();
            let observed = if Self::is_serving_state(&self.state.load()) {
                ModelState::Ready
            } else {
                let derived = derive_model_state(&presence);
                self.set_state(derived.clone());
                derived
            };

            match observed {
                ModelState::NotDownloaded => {
                    return Err(InitializationError::ModelNotFound(format!(
                        "No ensemble model files downloaded. Import {} and {} to enable AI answers.",
                        ModelKind::SentenceEmbeddings.artifact_name(),
                        ModelKind::ExtractiveQa.artifact_name()
                    )));
                }
                ModelState::PartiallyDownloaded { imported, total, .. } => {
                    let missing: Vec<String> = presence
                        .missing_required()
                        .iter()
                        .map(ModelKind::artifact_name)
                        .collect();
                    warn!("Ensemble artifacts incomplete, missing: {}", missing.join(", "));
                    return Err(InitializationError::PartialModels {
                        imported,
                        total,
                        missing,
                    });
                }
                ModelState::Downloaded => return self.load_backends(&presence).await,
                ModelState::Ready if self.loaded.load().retriever.is_some() => {
                    // Retrieval-only mode is a complete initialization.
                    return Ok(());
                }
                ModelState::Ready if !healed => {
                    warn!("State is Ready without a retriever; reloading");
                    healed = true;
                    self.set_state(ModelState::Downloaded);
                }
                other => {
                    return Err(InitializationError::LoaderNotImplemented(format!(
                        "Cannot initialize from state {}",
                        other
                    )));
                }
            }
        }
    }

    async fn load_backends(&self, presence: &ArtifactPresence) -> Result<(), InitializationError> {
        self.set_state(ModelState::Loading);
        info!("Loading ensemble backends");

        let retriever_loaded = match presence.path(ModelKind::SentenceEmbeddings) {
            Some(path) => self
                .retriever
                .initialize(path)
                .await
                .map_err(InitializationError::load_failed),
            None => Err(InitializationError::load_failed("sentence embedding artifact missing")),
        };
        if let Err(e) = retriever_loaded {
            error!("Required retriever failed to load: {}", e);
            self.close_backends();
            let cause = match &e {
                InitializationError::LoadFailed { cause } => cause.clone(),
                other => other.to_string(),
            };
            self.set_state(ModelState::error(cause, true));
            return Err(e);
        }

        let qa = match presence.path(ModelKind::ExtractiveQa) {
            Some(path) => match self.qa.initialize(path).await {
                Ok(()) => Some(self.qa.clone()),
                Err(e) => {
                    warn!("Extractive QA failed to load, continuing retrieval-only: {}", e);
                    None
                }
            },
            None => None,
        };

        let intent = match presence.path(ModelKind::IntentClassifier) {
            Some(path) => match self.intent.initialize(path).await {
                Ok(()) => Some(self.intent.clone()),
                Err(e) => {
                    warn!("Intent classifier failed to load, continuing without it: {}", e);
                    None
                }
            },
            None => {
                debug!("No intent classifier artifact; every question is general");
                None
            }
        };

        let loaded = LoadedBackends {
            retriever: Some(self.retriever.clone()),
            qa,
            intent,
        };
        let names: Vec<&str> = loaded.kinds().iter().map(ModelKind::display_name).collect();
        self.loaded.store(Arc::new(loaded));
        self.set_state(ModelState::Ready);

        info!("Ensemble ready: {}", names.join(" + "));
        Ok(())
    }

    fn close_backends(&self) {
        self.loaded.store(Arc::new(LoadedBackends::default()));
        self.retriever.close();
        self.qa.close();
        self.intent.close();
    }

    /// Closes every backend and re-derives state from the artifacts on disk.
    /// Calling it again is a no-op.
    pub async fn unload(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let had_backends = !self.loaded.load().kinds().is_empty();
        self.close_backends();
        self.set_state(derive_model_state(&self.artifacts.scan()));
        if had_backends {
            info!("Ensemble backends unloaded");
        }
    }

    pub async fn generate(&self, question: &str, max_tokens: usize) -> GenerationResult {
        self.generate_with_cancel(question, max_tokens, &CancellationToken::new())
            .await
    }

    /// `generate` with a token checked between pipeline stages.
    pub async fn generate_with_cancel(
        &self,
        question: &str,
        max_tokens: usize,
        cancel: &CancellationToken,
    ) -> GenerationResult {
        let started = Instant::now();
        let loaded = self.loaded.load_full();

        let Some(retriever) = loaded.retriever.clone() else {
            return self.models_unavailable();
        };
        let Some(mut guard) = self.begin_generation() else {
            return self.models_unavailable();
        };

        let (route, result) = self
            .route(question, max_tokens, cancel, &loaded, &retriever, &mut guard, started)
            .await;
        drop(guard);

        metrics::record_generate(route);
        metrics::observe_generate_seconds(started.elapsed().as_secs_f64());
        result
    }

    fn models_unavailable(&self) -> GenerationResult {
        metrics::record_generate("unavailable");
        GenerationResult::Unavailable {
            reason: self.state().unavailable_reason(),
            fallback_text: MODELS_UNAVAILABLE_FALLBACK.to_string(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn route(
        &self,
        question: &str,
        max_tokens: usize,
        cancel: &CancellationToken,
        loaded: &LoadedBackends,
        retriever: &Retriever,
        guard: &mut GenerationGuard<'_>,
        started: Instant,
    ) -> (&'static str, GenerationResult) {
        if cancel.is_cancelled() {
            return ("cancelled", cancelled());
        }

        let intent: Option<IntentResult> = match &loaded.intent {
            Some(classifier) => Some(classifier.classify(question).await),
            None => None,
        };
        if let Some(intent) = &intent {
            debug!(intent = %intent.intent, confidence = intent.confidence, "Classified question");
        }
        if cancel.is_cancelled() {
            return ("cancelled", cancelled());
        }

        let retrieval = match retriever.query(question).await {
            Ok(outcome) => outcome,
            Err(RetrieverError::Worker(e)) => {
                error!("Retrieval job failed: {}", e);
                guard.fail(e.to_string());
                return (
                    "failure",
                    GenerationResult::Failure {
                        error: e.to_string(),
                        fallback_text: Some(MODELS_UNAVAILABLE_FALLBACK.to_string()),
                    },
                );
            }
            Err(e) => {
                warn!("Retrieval failed, continuing without a match: {}", e);
                RetrievalOutcome {
                    best: None,
                    threshold: retriever.threshold(),
                }
            }
        };

        if let Some(hit) = retrieval.qualifying() {
            debug!(
                confidence = hit.confidence,
                matched = %hit.matched_question,
                "Confident retrieval match"
            );
            return ("fast_path", success(&hit.answer, max_tokens, true, started));
        }
        if cancel.is_cancelled() {
            return ("cancelled", cancelled());
        }

        if let Some(qa) = &loaded.qa {
            let context = context_builder::build(question, retrieval.best.as_ref(), intent.as_ref());
            match qa.answer(&context, question).await {
                Ok(answer) => {
                    debug!(confidence = answer.confidence, from_model = answer.from_model, "Extractive answer");
                    return ("extractive_qa", success(&answer.answer, max_tokens, false, started));
                }
                Err(e) => warn!("Extractive QA failed, falling back to retrieval: {}", e),
            }
        }

        if let Some(best) = &retrieval.best {
            debug!(confidence = best.confidence, "Using best-effort retrieval match");
            return ("best_effort_retrieval", success(&best.answer, max_tokens, true, started));
        }

        (
            "no_match",
            GenerationResult::Unavailable {
                reason: NO_MATCH_REASON.to_string(),
                fallback_text: NO_MATCH_FALLBACK.to_string(),
            },
        )
    }

    fn tracker(&self) -> MutexGuard<'_, GenerationTracker> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins or opens the `Generating` episode if the ensemble is serving.
    fn begin_generation(&self) -> Option<GenerationGuard<'_>> {
        let mut tracker = self.tracker();
        let current = self.state.load_full();

        let serving = match &*current {
            ModelState::Ready => true,
            ModelState::Generating => tracker.in_flight > 0,
            _ => false,
        };
        if !serving {
            return None;
        }

        if tracker.in_flight == 0 {
            tracker.resume_state = Some((*current).clone());
            tracker.failure = None;
            self.state.store(Arc::new(ModelState::Generating));
        }
        tracker.in_flight += 1;
        Some(GenerationGuard {
            orchestrator: self,
            failure: None,
        })
    }

    fn end_generation(&self, failure: Option<String>) {
        let mut tracker = self.tracker();
        tracker.in_flight = tracker.in_flight.saturating_sub(1);
        if failure.is_some() {
            tracker.failure = failure;
        }
        if tracker.in_flight > 0 {
            return;
        }

        let resume = tracker.resume_state.take().unwrap_or(ModelState::Ready);
        let next = match tracker.failure.take() {
            Some(message) => ModelState::error(message, true),
            None => resume,
        };

        // Leave alone any state written by unload/initialize meanwhile.
        let current = self.state.load();
        if matches!(**current, ModelState::Generating) {
            self.state.compare_and_swap(&*current, Arc::new(next));
        }
    }
}

/// Releases one call's share of the `Generating` episode on drop, on every
/// exit path.
struct GenerationGuard<'a> {
    orchestrator: &'a EnsembleOrchestrator,
    failure: Option<String>,
}

impl GenerationGuard<'_> {
    fn fail(&mut self, message: String) {
        self.failure = Some(message);
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.end_generation(self.failure.take());
    }
}

fn cancelled() -> GenerationResult {
    GenerationResult::Failure {
        error: CANCELLED_ERROR.to_string(),
        fallback_text: Some(MODELS_UNAVAILABLE_FALLBACK.to_string()),
    }
}

/// Keeps at most `max_tokens` whitespace-separated words.
pub fn limit_tokens(text: &str, max_tokens: usize) -> String {
    let max_tokens = max_tokens.max(1);
    if text.split_whitespace().count() <= max_tokens {
        return text.to_string();
    }
    text.split_whitespace()
        .take(max_tokens)
        .collect::<Vec<_>>()
        .join(" ")
}

fn success(text: &str, max_tokens: usize, from_cache: bool, started: Instant) -> GenerationResult {
    let text = limit_tokens(text, max_tokens);
    GenerationResult::Success {
        tokens_generated: text.split_whitespace().count(),
        text,
        inference_time_ms: started.elapsed().as_millis() as u64,
        from_cache,
    }
}
