//! Lexical reference backends.
//!
//! Deterministic stand-ins for the neural backends: a hashed bag-of-tokens
//! embedder, a sentence-overlap extractive reader and a keyword intent
//! classifier. They let the ensemble run end to end without an inference
//! runtime. Quality is lexical, not semantic.

use super::format_detector::FormatDetector;
use super::runtime_trait::{
    BackendLoader, BackendMetadata, EmbeddingBackend, IntentBackend, IntentScore, ModelBackend,
    ModelFormat, QaBackend, QaCandidate,
};
use crate::ensemble::tokenizer::FIRST_WORD_TOKEN;
use crate::model_state::ModelKind;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LEXICAL_EMBEDDING_DIM: usize = 384;
const MAX_QA_CANDIDATES: usize = 5;

lazy_static! {
    static ref SENTENCE_SPLIT: Regex = Regex::new(r"[.!?\n]+").expect("valid sentence regex");
    static ref LABEL_PREFIX: Regex =
        Regex::new(r"^\s*[A-Za-z]+(?: [A-Za-z]+)?:\s*").expect("valid label regex");
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "what", "how", "does", "this", "that", "with", "about",
    "can", "you", "your", "tell", "why", "when", "which", "who", "its", "from", "into",
];

fn metadata(kind: ModelKind, name: &str, path: &Path) -> BackendMetadata {
    BackendMetadata {
        kind,
        format: FormatDetector::detect_from_path(path).unwrap_or(ModelFormat::Json),
        backend_name: name.to_string(),
        artifact_path: path.to_path_buf(),
    }
}

/// Lowercase alphanumeric terms of at least three characters, minus stopwords.
fn content_terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.len() >= 3)
        .map(str::to_lowercase)
        .filter(|s| !STOPWORDS.contains(&s.as_str()))
        .collect()
}

/// FNV-1a over the little-endian bytes of a token id.
fn bucket(token: u32, dims: usize) -> usize {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in token.to_le_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    (h as usize) % dims
}

pub struct HashedEmbeddingBackend {
    dimensions: usize,
    artifact: PathBuf,
}

impl HashedEmbeddingBackend {
    pub fn new(dimensions: usize, artifact: impl Into<PathBuf>) -> Self {
        Self {
            dimensions: dimensions.max(1),
            artifact: artifact.into(),
        }
    }
}

impl ModelBackend for HashedEmbeddingBackend {
    fn metadata(&self) -> BackendMetadata {
        metadata(ModelKind::SentenceEmbeddings, "hashed-bag-of-tokens", &self.artifact)
    }
}

impl EmbeddingBackend for HashedEmbeddingBackend {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, token_ids: &[u32]) -> anyhow::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        for &id in token_ids.iter().filter(|id| **id >= FIRST_WORD_TOKEN) {
            vector[bucket(id, self.dimensions)] += 1.0;
        }
        Ok(vector)
    }
}

pub struct SentenceOverlapQaBackend {
    artifact: PathBuf,
}

impl SentenceOverlapQaBackend {
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        Self {
            artifact: artifact.into(),
        }
    }
}

impl ModelBackend for SentenceOverlapQaBackend {
    fn metadata(&self) -> BackendMetadata {
        metadata(ModelKind::ExtractiveQa, "sentence-overlap", &self.artifact)
    }
}

impl QaBackend for SentenceOverlapQaBackend {
    /// Scores each context sentence by the share of question terms it
    /// contains. Sentences that merely restate the question are skipped.
    fn answer(&self, context: &str, question: &str) -> anyhow::Result<Vec<QaCandidate>> {
        let question_terms: HashSet<String> = content_terms(question).into_iter().collect();
        if question_terms.is_empty() {
            return Ok(Vec::new());
        }
        let restated = question.trim().trim_end_matches('?').to_lowercase();

        let mut candidates: Vec<QaCandidate> = SENTENCE_SPLIT
            .split(context)
            .map(|s| LABEL_PREFIX.replace(s.trim(), "").trim().to_string())
            .filter(|s| s.split_whitespace().count() >= 3)
            .filter(|s| restated.is_empty() || !s.to_lowercase().contains(&restated))
            .filter_map(|sentence| {
                let terms: HashSet<String> = content_terms(&sentence).into_iter().collect();
                let overlap = question_terms.intersection(&terms).count();
                (overlap > 0).then(|| QaCandidate {
                    score: overlap as f32 / question_terms.len() as f32,
                    text: sentence,
                })
            })
            .collect();

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(MAX_QA_CANDIDATES);
        Ok(candidates)
    }
}

pub struct KeywordIntentBackend {
    artifact: PathBuf,
}

impl KeywordIntentBackend {
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        Self {
            artifact: artifact.into(),
        }
    }

    const KEYWORDS: &'static [(&'static str, &'static [&'static str])] = &[
        (
            "pattern_explanation",
            &["pattern", "head and shoulders", "triangle", "flag", "wedge", "double top", "double bottom", "cup and handle", "chart"],
        ),
        ("quantra_score", &["quantra", "score", "rating", "quality"]),
        (
            "trading_strategy",
            &["strategy", "entry", "exit", "stop loss", "risk", "position", "trade", "breakout"],
        ),
        (
            "indicator",
            &["rsi", "macd", "moving average", "bollinger", "volume", "stochastic", "indicator", "ema", "sma"],
        ),
        ("validation", &["valid", "confirm", "reliable", "accurate", "verify", "false signal"]),
    ];
}

impl ModelBackend for KeywordIntentBackend {
    fn metadata(&self) -> BackendMetadata {
        metadata(ModelKind::IntentClassifier, "keyword-intent", &self.artifact)
    }
}

impl IntentBackend for KeywordIntentBackend {
    fn classify(&self, text: &str) -> anyhow::Result<Vec<IntentScore>> {
        let q = text.to_lowercase();
        let hits: Vec<(&str, usize)> = Self::KEYWORDS
            .iter()
            .map(|(label, words)| (*label, words.iter().filter(|w| q.contains(*w)).count()))
            .filter(|(_, n)| *n > 0)
            .collect();

        let total: usize = hits.iter().map(|(_, n)| n).sum();
        if total == 0 {
            return Ok(vec![IntentScore {
                label: "general".to_string(),
                score: 0.5,
            }]);
        }

        let mut scores: Vec<IntentScore> = hits
            .into_iter()
            .map(|(label, n)| IntentScore {
                label: label.to_string(),
                score: n as f32 / total as f32,
            })
            .collect();
        scores.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(scores)
    }
}

/// Loader for the lexical backends. Accepts any artifact file with a
/// supported extension; its contents are not interpreted.
#[derive(Debug, Clone, Default)]
pub struct LexicalBackendLoader;

impl LexicalBackendLoader {
    fn check_artifact(artifact: &Path) -> anyhow::Result<()> {
        if !artifact.is_file() {
            anyhow::bail!("Model artifact not found: {}", artifact.display());
        }
        if FormatDetector::detect_from_path(artifact).is_none() {
            anyhow::bail!(
                "Unsupported model format: {}. Supported extensions: {:?}",
                artifact.display(),
                FormatDetector::supported_extensions()
            );
        }
        Ok(())
    }
}

impl BackendLoader for LexicalBackendLoader {
    fn load_embedding(&self, artifact: &Path) -> anyhow::Result<Arc<dyn EmbeddingBackend>> {
        Self::check_artifact(artifact)?;
        Ok(Arc::new(HashedEmbeddingBackend::new(LEXICAL_EMBEDDING_DIM, artifact)))
    }

    fn load_qa(&self, artifact: &Path) -> anyhow::Result<Arc<dyn QaBackend>> {
        Self::check_artifact(artifact)?;
        Ok(Arc::new(SentenceOverlapQaBackend::new(artifact)))
    }

    fn load_intent(&self, artifact: &Path) -> anyhow::Result<Arc<dyn IntentBackend>> {
        Self::check_artifact(artifact)?;
        Ok(Arc::new(KeywordIntentBackend::new(artifact)))
    }
}
