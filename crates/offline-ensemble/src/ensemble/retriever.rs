//! Semantic retriever over the knowledge base.
//!
//! Initialization embeds every knowledge-base question once and keeps the
//! unit-normalized vectors in an index. Queries embed the question and scan
//! the index linearly for the most similar entry.
//!
//! A missing or broken embedding model leaves the retriever unavailable
//! until it is closed. An empty knowledge base, or one where no entry could
//! be embedded, is retriable: the next `initialize` tries again.

use super::tokenizer::{self, MAX_SEQUENCE_LENGTH};
use crate::cache_management::{content_key, EmbeddingCache};
use crate::knowledge::{KnowledgeBase, KnowledgeEntry};
use crate::model_runtime::{BackendLoader, BackendSlot, EmbeddingBackend};
use crate::model_state::ModelKind;
use crate::single_flight::SingleFlight;
use crate::thread_pool::{InferencePool, PoolError};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const EMBEDDING_DIM: usize = 384;
pub const RETRIEVAL_CONFIDENCE_THRESHOLD: f32 = 0.75;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub answer: String,
    /// Cosine similarity in [0, 1]
    pub confidence: f32,
    pub matched_question: String,
}

/// Best match of one query, whether or not it clears the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalOutcome {
    pub best: Option<RetrievalResult>,
    pub threshold: f32,
}

impl RetrievalOutcome {
    /// The best match if its similarity reaches the threshold (inclusive).
    pub fn qualifying(&self) -> Option<&RetrievalResult> {
        self.best.as_ref().filter(|r| r.confidence >= self.threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetrieverError {
    #[error("retriever not initialized")]
    NotReady,
    #[error("retriever unavailable: {reason}")]
    Unavailable { reason: String, retriable: bool },
    #[error("embedding inference failed: {0}")]
    Inference(String),
    #[error(transparent)]
    Worker(#[from] PoolError),
}

impl RetrieverError {
    pub fn is_retriable(&self) -> bool {
        match self {
            RetrieverError::Unavailable { retriable, .. } => *retriable,
            RetrieverError::NotReady => true,
            _ => false,
        }
    }
}

struct IndexedEntry {
    question: String,
    answer: String,
    vector: Vec<f32>,
}

/// Question to vector, in knowledge-base order. Built whole, never patched.
struct EmbeddingIndex {
    entries: Vec<IndexedEntry>,
}

impl EmbeddingIndex {
    /// Strict `>` from zero: ties keep the earlier entry, and an entry with
    /// zero similarity never matches.
    fn best_match(&self, query: &[f32]) -> Option<RetrievalResult> {
        let mut best: Option<(&IndexedEntry, f32)> = None;
        let mut best_similarity = 0.0f32;

        for entry in &self.entries {
            let similarity = cosine_similarity(query, &entry.vector);
            if similarity > best_similarity {
                best_similarity = similarity;
                best = Some((entry, similarity));
            }
        }

        best.map(|(entry, similarity)| RetrievalResult {
            answer: entry.answer.clone(),
            confidence: similarity,
            matched_question: entry.question.clone(),
        })
    }
}

enum RetrieverState {
    Uninitialized,
    Ready(Arc<EmbeddingIndex>),
    Unavailable { reason: String, retriable: bool },
}

/// Scales `vector` to unit length in place. A zero vector stays zero.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Dot product of two unit vectors, clamped to [0, 1].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot.clamp(0.0, 1.0)
}

fn embed_text(
    backend: &dyn EmbeddingBackend,
    cache: Option<&EmbeddingCache>,
    text: &str,
) -> anyhow::Result<Vec<f32>> {
    let key = cache.map(|_| content_key(&format!("{}\u{0}{}", backend.metadata().backend_name, text)));
    if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
        if let Some(vector) = cache.get(key) {
            return Ok(vector);
        }
    }

    let token_ids = tokenizer::encode(text, MAX_SEQUENCE_LENGTH);
    let mut vector = backend.embed(&token_ids)?;
    if vector.len() != backend.dimensions() {
        anyhow::bail!(
            "embedding has {} dimensions, backend declares {}",
            vector.len(),
            backend.dimensions()
        );
    }
    normalize(&mut vector);

    if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
        cache.put(key, vector.clone());
    }
    Ok(vector)
}

pub struct Retriever {
    model: BackendSlot<dyn EmbeddingBackend>,
    loader: Arc<dyn BackendLoader>,
    knowledge: Arc<dyn KnowledgeBase>,
    pool: Arc<InferencePool>,
    cache: Option<Arc<EmbeddingCache>>,
    threshold: f32,
    state: ArcSwap<RetrieverState>,
    init: SingleFlight<Result<(), RetrieverError>>,
}

impl Retriever {
    pub fn new(
        loader: Arc<dyn BackendLoader>,
        knowledge: Arc<dyn KnowledgeBase>,
        pool: Arc<InferencePool>,
    ) -> Self {
        Self {
            model: BackendSlot::new(ModelKind::SentenceEmbeddings),
            loader,
            knowledge,
            pool,
            cache: None,
            threshold: RETRIEVAL_CONFIDENCE_THRESHOLD,
            state: ArcSwap::from_pointee(RetrieverState::Uninitialized),
            init: SingleFlight::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Loads the embedding model and indexes the knowledge base. Concurrent
    /// callers share one attempt and its outcome.
    pub async fn initialize(&self, artifact: &Path) -> Result<(), RetrieverError> {
        if let Some(outcome) = self.settled() {
            return outcome;
        }

        self.init
            .run(|| async {
                if let Some(outcome) = self.settled() {
                    return outcome;
                }
                let outcome = self.build(artifact).await;
                if let Err(RetrieverError::Unavailable { reason, retriable }) = &outcome {
                    warn!(retriable = *retriable, "Retriever unavailable: {}", reason);
                    self.state.store(Arc::new(RetrieverState::Unavailable {
                        reason: reason.clone(),
                        retriable: *retriable,
                    }));
                }
                outcome
            })
            .await
    }

    /// Outcome to return without running initialization, if any.
    fn settled(&self) -> Option<Result<(), RetrieverError>> {
        match &**self.state.load() {
            RetrieverState::Ready(_) => Some(Ok(())),
            RetrieverState::Unavailable {
                reason,
                retriable: false,
            } => Some(Err(RetrieverError::Unavailable {
                reason: reason.clone(),
                retriable: false,
            })),
            _ => None,
        }
    }

    async fn build(&self, artifact: &Path) -> Result<(), RetrieverError> {
        let loader = self.loader.clone();
        let path = artifact.to_path_buf();
        let backend = self
            .model
            .ensure_loaded(&self.pool, move || loader.load_embedding(&path))
            .await
            .map_err(|e| RetrieverError::Unavailable {
                reason: e.to_string(),
                retriable: false,
            })?;

        let entries = match self.knowledge.load_all().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to load knowledge base: {}", e);
                Arc::new(Vec::new())
            }
        };
        if entries.is_empty() {
            return Err(RetrieverError::Unavailable {
                reason: "Knowledge base is empty".to_string(),
                retriable: true,
            });
        }

        let cache = self.cache.clone();
        let total = entries.len();
        let index = self
            .pool
            .run(move || build_index(backend.as_ref(), cache.as_deref(), &entries))
            .await
            .map_err(|e| RetrieverError::Unavailable {
                reason: format!("Indexing failed: {}", e),
                retriable: true,
            })?;

        if index.entries.is_empty() {
            return Err(RetrieverError::Unavailable {
                reason: "No knowledge base entries could be embedded".to_string(),
                retriable: true,
            });
        }

        info!(
            "Retriever ready: {}/{} knowledge base entries embedded",
            index.entries.len(),
            total
        );
        self.state.store(Arc::new(RetrieverState::Ready(Arc::new(index))));
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        matches!(&**self.state.load(), RetrieverState::Ready(_))
    }

    pub fn cached_embeddings_count(&self) -> usize {
        match &**self.state.load() {
            RetrieverState::Ready(index) => index.entries.len(),
            _ => 0,
        }
    }

    /// Reason recorded by the last failed initialization, if unavailable.
    pub fn unavailable_reason(&self) -> Option<(String, bool)> {
        match &**self.state.load() {
            RetrieverState::Unavailable { reason, retriable } => Some((reason.clone(), *retriable)),
            _ => None,
        }
    }

    /// Closest entry regardless of threshold; `None` when nothing is similar
    /// at all.
    pub async fn best_candidate(&self, question: &str) -> Result<Option<RetrievalResult>, RetrieverError> {
        let index = match &**self.state.load() {
            RetrieverState::Ready(index) => index.clone(),
            _ => return Err(RetrieverError::NotReady),
        };
        let backend = self.model.get().ok_or(RetrieverError::NotReady)?;
        let cache = self.cache.clone();
        let question = question.to_string();

        self.pool
            .run(move || -> anyhow::Result<Option<RetrievalResult>> {
                let vector = embed_text(backend.as_ref(), cache.as_deref(), &question)?;
                Ok(index.best_match(&vector))
            })
            .await?
            .map_err(|e| RetrieverError::Inference(e.to_string()))
    }

    pub async fn query(&self, question: &str) -> Result<RetrievalOutcome, RetrieverError> {
        let best = self.best_candidate(question).await?;
        Ok(RetrievalOutcome {
            best,
            threshold: self.threshold,
        })
    }

    /// Best match only if it reaches the confidence threshold.
    pub async fn find_best_match(&self, question: &str) -> Result<Option<RetrievalResult>, RetrieverError> {
        let outcome = self.query(question).await?;
        Ok(outcome.qualifying().cloned())
    }

    /// Drops the index and closes the model. The next `initialize` rebuilds
    /// from scratch.
    pub fn close(&self) -> bool {
        let previous = self.state.swap(Arc::new(RetrieverState::Uninitialized));
        let had_index = matches!(&*previous, RetrieverState::Ready(_));
        let closed_model = self.model.close();
        if had_index {
            debug!("Retriever closed");
        }
        had_index || closed_model
    }
}

fn build_index(
    backend: &dyn EmbeddingBackend,
    cache: Option<&EmbeddingCache>,
    entries: &[KnowledgeEntry],
) -> EmbeddingIndex {
    let mut seen = HashSet::new();
    let mut indexed = Vec::with_capacity(entries.len());

    for entry in entries {
        if !seen.insert(entry.question.as_str()) {
            debug!("Skipping duplicate knowledge base question: {}", entry.question);
            continue;
        }
        match embed_text(backend, cache, &entry.question) {
            Ok(vector) => indexed.push(IndexedEntry {
                question: entry.question.clone(),
                answer: entry.answer.clone(),
                vector,
            }),
            Err(e) => warn!("Failed to embed knowledge base entry '{}': {}", entry.question, e),
        }
    }

    EmbeddingIndex { entries: indexed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_management::{CacheConfig, TwoTierCache};
    use crate::knowledge::InMemoryKnowledgeBase;
    use crate::model_runtime::lexical::HashedEmbeddingBackend;
    use crate::model_runtime::{IntentBackend, LexicalBackendLoader, QaBackend};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn entries() -> Vec<KnowledgeEntry> {
        vec![
            KnowledgeEntry::new("What is RSI?", "RSI is a momentum oscillator."),
            KnowledgeEntry::new("What is a head and shoulders pattern?", "A reversal pattern."),
            KnowledgeEntry::new("How does volume confirm a breakout?", "Rising volume confirms it."),
        ]
    }

    fn artifact() -> (TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentence_embeddings.tflite");
        std::fs::write(&path, b"weights").unwrap();
        (dir, path)
    }

    fn retriever(kb: Arc<dyn KnowledgeBase>) -> Retriever {
        let pool = Arc::new(InferencePool::new(2).unwrap());
        Retriever::new(Arc::new(LexicalBackendLoader), kb, pool)
    }

    /// Counts embedding loads; fails every embed when `broken`.
    struct CountingLoader {
        loads: AtomicUsize,
        broken: bool,
    }

    struct BrokenEmbedder;

    impl crate::model_runtime::ModelBackend for BrokenEmbedder {
        fn metadata(&self) -> crate::model_runtime::BackendMetadata {
            HashedEmbeddingBackend::new(4, "broken.json").metadata()
        }
    }

    impl EmbeddingBackend for BrokenEmbedder {
        fn dimensions(&self) -> usize {
            4
        }
        fn embed(&self, _: &[u32]) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("delegate failed")
        }
    }

    impl BackendLoader for CountingLoader {
        fn load_embedding(&self, _: &Path) -> anyhow::Result<Arc<dyn EmbeddingBackend>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            if self.broken {
                Ok(Arc::new(BrokenEmbedder))
            } else {
                Ok(Arc::new(HashedEmbeddingBackend::new(EMBEDDING_DIM, "e.json")))
            }
        }
        fn load_qa(&self, _: &Path) -> anyhow::Result<Arc<dyn QaBackend>> {
            anyhow::bail!("not used")
        }
        fn load_intent(&self, _: &Path) -> anyhow::Result<Arc<dyn IntentBackend>> {
            anyhow::bail!("not used")
        }
    }

    #[test]
    fn test_normalize_zero_vector_stays_zero() {
        let mut v = vec![0.0f32; 8];
        normalize(&mut v);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_negative_similarity_clamped() {
        let mut a = vec![1.0, 0.0];
        let mut b = vec![-1.0, 0.0];
        normalize(&mut a);
        normalize(&mut b);
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let outcome = RetrievalOutcome {
            best: Some(RetrievalResult {
                answer: "a".to_string(),
                confidence: 0.75,
                matched_question: "q".to_string(),
            }),
            threshold: RETRIEVAL_CONFIDENCE_THRESHOLD,
        };
        assert!(outcome.qualifying().is_some());

        let below = RetrievalOutcome {
            best: outcome.best.clone().map(|mut r| {
                r.confidence = 0.7499;
                r
            }),
            threshold: RETRIEVAL_CONFIDENCE_THRESHOLD,
        };
        assert!(below.qualifying().is_none());
        assert!(below.best.is_some());
    }

    #[test]
    fn test_ties_keep_first_entry() {
        let index = EmbeddingIndex {
            entries: vec![
                IndexedEntry {
                    question: "first".to_string(),
                    answer: "1".to_string(),
                    vector: vec![1.0, 0.0],
                },
                IndexedEntry {
                    question: "second".to_string(),
                    answer: "2".to_string(),
                    vector: vec![1.0, 0.0],
                },
            ],
        };
        let best = index.best_match(&[1.0, 0.0]).unwrap();
        assert_eq!(best.matched_question, "first");
        assert!(index.best_match(&[0.0, 1.0]).is_none());
    }

    proptest! {
        #[test]
        fn prop_similarity_symmetric_and_self_is_one(
            a in proptest::collection::vec(-10.0f32..10.0, 16),
            b in proptest::collection::vec(-10.0f32..10.0, 16),
        ) {
            let mut a = a;
            let mut b = b;
            normalize(&mut a);
            normalize(&mut b);

            prop_assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
            let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.5 {
                prop_assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-4);
            }
        }
    }

    #[tokio::test]
    async fn test_self_match_for_every_entry() {
        let (_dir, path) = artifact();
        let retriever = retriever(Arc::new(InMemoryKnowledgeBase::new(entries())));
        retriever.initialize(&path).await.unwrap();
        assert_eq!(retriever.cached_embeddings_count(), 3);

        for entry in entries() {
            let result = retriever.find_best_match(&entry.question).await.unwrap().unwrap();
            assert_eq!(result.answer, entry.answer);
            assert!(result.confidence >= RETRIEVAL_CONFIDENCE_THRESHOLD);
        }
    }

    #[tokio::test]
    async fn test_unrelated_query_has_candidate_but_no_qualifying_match() {
        let (_dir, path) = artifact();
        let retriever = retriever(Arc::new(InMemoryKnowledgeBase::new(entries())));
        retriever.initialize(&path).await.unwrap();

        let outcome = retriever.query("what is the weather like").await.unwrap();
        assert!(outcome.best.is_some());
        assert!(outcome.qualifying().is_none());
    }

    #[tokio::test]
    async fn test_empty_knowledge_base_is_retriable() {
        let (_dir, path) = artifact();
        let kb = Arc::new(InMemoryKnowledgeBase::default());
        let retriever = retriever(kb.clone());

        let err = retriever.initialize(&path).await.unwrap_err();
        assert!(err.is_retriable());
        assert!(!retriever.is_ready());

        kb.replace(entries()).await;
        retriever.initialize(&path).await.unwrap();
        assert!(retriever.is_ready());
    }

    #[tokio::test]
    async fn test_missing_model_is_terminal_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentence_embeddings.tflite");
        let retriever = retriever(Arc::new(InMemoryKnowledgeBase::new(entries())));

        let err = retriever.initialize(&path).await.unwrap_err();
        assert!(!err.is_retriable());

        // The file appearing does not help until the retriever is reset.
        std::fs::write(&path, b"weights").unwrap();
        assert!(retriever.initialize(&path).await.is_err());

        retriever.close();
        assert!(retriever.initialize(&path).await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_successful_embeddings_is_retriable() {
        let (_dir, path) = artifact();
        let pool = Arc::new(InferencePool::new(1).unwrap());
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
            broken: true,
        });
        let retriever = Retriever::new(loader, Arc::new(InMemoryKnowledgeBase::new(entries())), pool);

        let err = retriever.initialize(&path).await.unwrap_err();
        assert!(err.is_retriable());
        assert!(retriever.unavailable_reason().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_initialize_loads_once() {
        let (_dir, path) = artifact();
        let pool = Arc::new(InferencePool::new(2).unwrap());
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
            broken: false,
        });
        let retriever = Retriever::new(
            loader.clone(),
            Arc::new(InMemoryKnowledgeBase::new(entries())),
            pool,
        );

        let calls = (0..10).map(|_| retriever.initialize(&path));
        let outcomes = futures::future::join_all(calls).await;

        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(retriever.init.completed_attempts(), 1);
    }

    #[tokio::test]
    async fn test_query_before_initialize_is_not_ready() {
        let retriever = retriever(Arc::new(InMemoryKnowledgeBase::new(entries())));
        assert_eq!(
            retriever.query("What is RSI?").await.unwrap_err(),
            RetrieverError::NotReady
        );
    }

    #[tokio::test]
    async fn test_embedding_cache_reused_after_close() {
        let (_dir, path) = artifact();
        let cache = Arc::new(TwoTierCache::in_memory("embeddings", CacheConfig::default()));
        let pool = Arc::new(InferencePool::new(1).unwrap());
        let retriever = Retriever::new(
            Arc::new(LexicalBackendLoader),
            Arc::new(InMemoryKnowledgeBase::new(entries())),
            pool,
        )
        .with_cache(cache.clone());

        retriever.initialize(&path).await.unwrap();
        assert_eq!(cache.stats().writes, 3);

        retriever.close();
        assert_eq!(retriever.cached_embeddings_count(), 0);
        retriever.initialize(&path).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.writes, 3);
        assert_eq!(stats.memory_hits, 3);
    }
}
