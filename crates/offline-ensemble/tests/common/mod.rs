//! Scripted backends for driving the orchestrator through exact scenarios.

#![allow(dead_code)]

use offline_ensemble::ensemble::tokenizer::{self, MAX_SEQUENCE_LENGTH};
use offline_ensemble::model_runtime::{
    ArtifactPresence, ArtifactStore, BackendLoader, BackendMetadata, EmbeddingBackend,
    IntentBackend, IntentScore, ModelBackend, ModelFormat, QaBackend, QaCandidate,
};
use offline_ensemble::thread_pool::InferencePool;
use offline_ensemble::{
    EnsembleComponents, EnsembleConfig, EnsembleOrchestrator, InMemoryKnowledgeBase,
    KnowledgeEntry, ModelKind,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DIMS: usize = 4;

pub const RSI_ANSWER: &str = "RSI is a momentum oscillator.";
pub const MACD_ANSWER: &str = "MACD compares two moving averages.";

fn metadata(kind: ModelKind) -> BackendMetadata {
    BackendMetadata {
        kind,
        format: ModelFormat::Json,
        backend_name: "scripted".to_string(),
        artifact_path: PathBuf::from(format!("{}.json", kind.file_stem())),
    }
}

/// Fixed vectors per text; any other text embeds to zero, or panics while
/// `panic_on_unknown` is set.
pub struct ScriptedEmbedder {
    vectors: HashMap<Vec<u32>, Vec<f32>>,
    panic_on_unknown: Arc<AtomicBool>,
    pub closed: Arc<AtomicUsize>,
}

impl ModelBackend for ScriptedEmbedder {
    fn metadata(&self) -> BackendMetadata {
        metadata(ModelKind::SentenceEmbeddings)
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl EmbeddingBackend for ScriptedEmbedder {
    fn dimensions(&self) -> usize {
        DIMS
    }

    fn embed(&self, token_ids: &[u32]) -> anyhow::Result<Vec<f32>> {
        match self.vectors.get(token_ids) {
            Some(v) => Ok(v.clone()),
            None if self.panic_on_unknown.load(Ordering::SeqCst) => {
                panic!("embedding kernel crashed")
            }
            None => Ok(vec![0.0; DIMS]),
        }
    }
}

pub struct ScriptedQa {
    candidates: Vec<QaCandidate>,
    fail: bool,
    panics: bool,
    contexts: Arc<Mutex<Vec<String>>>,
}

impl ModelBackend for ScriptedQa {
    fn metadata(&self) -> BackendMetadata {
        metadata(ModelKind::ExtractiveQa)
    }
}

impl QaBackend for ScriptedQa {
    fn answer(&self, context: &str, _question: &str) -> anyhow::Result<Vec<QaCandidate>> {
        self.contexts.lock().unwrap().push(context.to_string());
        if self.panics {
            panic!("QA kernel crashed");
        }
        if self.fail {
            anyhow::bail!("QA interpreter failed");
        }
        Ok(self.candidates.clone())
    }
}

pub struct ScriptedIntent(String, f32);

impl ModelBackend for ScriptedIntent {
    fn metadata(&self) -> BackendMetadata {
        metadata(ModelKind::IntentClassifier)
    }
}

impl IntentBackend for ScriptedIntent {
    fn classify(&self, _text: &str) -> anyhow::Result<Vec<IntentScore>> {
        Ok(vec![IntentScore {
            label: self.0.clone(),
            score: self.1,
        }])
    }
}

/// Loader with per-kind load counters and switchable failures.
#[derive(Default)]
pub struct ScriptedLoader {
    pub vectors: HashMap<Vec<u32>, Vec<f32>>,
    pub qa_candidates: Vec<QaCandidate>,
    pub qa_fails_inference: bool,
    pub qa_panics: bool,
    pub embedder_panics_on_query: Arc<AtomicBool>,
    pub intent: Option<(String, f32)>,
    pub embedding_load_fails: AtomicBool,
    pub qa_load_fails: AtomicBool,
    pub load_delay: Duration,
    pub embedding_loads: AtomicUsize,
    pub qa_loads: AtomicUsize,
    pub intent_loads: AtomicUsize,
    pub embedder_closes: Arc<AtomicUsize>,
    pub qa_contexts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        let mut loader = Self::default();
        loader.vector("What is RSI?", [1.0, 0.0, 0.0, 0.0]);
        loader.vector("What is MACD?", [0.0, 1.0, 0.0, 0.0]);
        loader
    }

    pub fn vector(&mut self, text: &str, v: [f32; DIMS]) -> &mut Self {
        self.vectors
            .insert(tokenizer::encode(text, MAX_SEQUENCE_LENGTH), v.to_vec());
        self
    }

    pub fn qa_answer(mut self, text: &str, score: f32) -> Self {
        self.qa_candidates = vec![QaCandidate {
            text: text.to_string(),
            score,
        }];
        self
    }

    pub fn with_intent(mut self, label: &str, score: f32) -> Self {
        self.intent = Some((label.to_string(), score));
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn qa_contexts(&self) -> Vec<String> {
        self.qa_contexts.lock().unwrap().clone()
    }
}

impl BackendLoader for ScriptedLoader {
    fn load_embedding(&self, _: &Path) -> anyhow::Result<Arc<dyn EmbeddingBackend>> {
        self.embedding_loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.load_delay);
        if self.embedding_load_fails.load(Ordering::SeqCst) {
            anyhow::bail!("corrupt embedding model");
        }
        Ok(Arc::new(ScriptedEmbedder {
            vectors: self.vectors.clone(),
            panic_on_unknown: self.embedder_panics_on_query.clone(),
            closed: self.embedder_closes.clone(),
        }))
    }

    fn load_qa(&self, _: &Path) -> anyhow::Result<Arc<dyn QaBackend>> {
        self.qa_loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.load_delay);
        if self.qa_load_fails.load(Ordering::SeqCst) {
            anyhow::bail!("incompatible QA model");
        }
        Ok(Arc::new(ScriptedQa {
            candidates: self.qa_candidates.clone(),
            fail: self.qa_fails_inference,
            panics: self.qa_panics,
            contexts: self.qa_contexts.clone(),
        }))
    }

    fn load_intent(&self, _: &Path) -> anyhow::Result<Arc<dyn IntentBackend>> {
        self.intent_loads.fetch_add(1, Ordering::SeqCst);
        match &self.intent {
            Some((label, score)) => Ok(Arc::new(ScriptedIntent(label.clone(), *score))),
            None => anyhow::bail!("no intent model scripted"),
        }
    }
}

/// Artifact presence that tests can change between calls.
#[derive(Default)]
pub struct ScriptedArtifacts(Mutex<ArtifactPresence>);

impl ScriptedArtifacts {
    pub fn with(kinds: &[ModelKind]) -> Self {
        let store = Self::default();
        store.set(kinds);
        store
    }

    pub fn set(&self, kinds: &[ModelKind]) {
        let presence = kinds.iter().fold(ArtifactPresence::default(), |p, kind| {
            p.with(*kind, format!("/models/{}", kind.artifact_name()))
        });
        *self.0.lock().unwrap() = presence;
    }
}

impl ArtifactStore for ScriptedArtifacts {
    fn scan(&self) -> ArtifactPresence {
        self.0.lock().unwrap().clone()
    }
}

pub fn knowledge() -> InMemoryKnowledgeBase {
    InMemoryKnowledgeBase::new(vec![
        KnowledgeEntry::new("What is RSI?", RSI_ANSWER),
        KnowledgeEntry::new("What is MACD?", MACD_ANSWER),
    ])
}

pub struct Harness {
    pub orchestrator: Arc<EnsembleOrchestrator>,
    pub loader: Arc<ScriptedLoader>,
    pub artifacts: Arc<ScriptedArtifacts>,
}

pub fn harness(loader: ScriptedLoader, kinds: &[ModelKind]) -> Harness {
    harness_with_config(loader, kinds, EnsembleConfig::default())
}

pub fn harness_with_config(loader: ScriptedLoader, kinds: &[ModelKind], config: EnsembleConfig) -> Harness {
    let loader = Arc::new(loader);
    let artifacts = Arc::new(ScriptedArtifacts::with(kinds));
    let components = EnsembleComponents::new(
        loader.clone(),
        Arc::new(knowledge()),
        artifacts.clone(),
        Arc::new(InferencePool::new(2).unwrap()),
    );
    Harness {
        orchestrator: Arc::new(EnsembleOrchestrator::new(components, config)),
        loader,
        artifacts,
    }
}
