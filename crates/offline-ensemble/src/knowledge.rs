//! Knowledge base of curated question/answer pairs.
//!
//! The retriever only needs `load_all`. The JSON-backed store also offers
//! keyword search and category lookup for callers browsing the content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl KnowledgeEntry {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            category: String::new(),
            keywords: Vec::new(),
        }
    }
}

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Every entry, in stored order.
    async fn load_all(&self) -> anyhow::Result<Arc<Vec<KnowledgeEntry>>>;
}

/// Reads a JSON array of entries from disk once and keeps it until
/// `clear_cache`. A failed read or an empty array is not cached, so the file
/// is read again until it holds entries.
pub struct JsonKnowledgeBase {
    path: PathBuf,
    cached: RwLock<Option<Arc<Vec<KnowledgeEntry>>>>,
}

impl JsonKnowledgeBase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }

    /// Entries mentioning `query`, ranked by where it matched: question (3),
    /// exact keyword (2), answer (1).
    pub async fn search(&self, query: &str) -> anyhow::Result<Vec<KnowledgeEntry>> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let entries = self.load_all().await?;

        let mut scored: Vec<(u32, &KnowledgeEntry)> = entries
            .iter()
            .filter(|entry| {
                entry.question.to_lowercase().contains(&query)
                    || entry.answer.to_lowercase().contains(&query)
                    || entry.keywords.iter().any(|k| {
                        let k = k.to_lowercase();
                        k.contains(&query) || query.contains(&k)
                    })
            })
            .map(|entry| (search_score(entry, &query), entry))
            .collect();

        // Stable sort keeps stored order among equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().map(|(_, e)| e.clone()).collect())
    }

    pub async fn by_category(&self, category: &str) -> anyhow::Result<Vec<KnowledgeEntry>> {
        let entries = self.load_all().await?;
        Ok(entries
            .iter()
            .filter(|e| e.category.eq_ignore_ascii_case(category))
            .cloned()
            .collect())
    }

    pub async fn clear_cache(&self) {
        *self.cached.write().await = None;
    }
}

fn search_score(entry: &KnowledgeEntry, query: &str) -> u32 {
    let mut score = 0;
    if entry.question.to_lowercase().contains(query) {
        score += 3;
    }
    if entry.keywords.iter().any(|k| k.to_lowercase() == query) {
        score += 2;
    }
    if entry.answer.to_lowercase().contains(query) {
        score += 1;
    }
    score
}

#[async_trait]
impl KnowledgeBase for JsonKnowledgeBase {
    async fn load_all(&self) -> anyhow::Result<Arc<Vec<KnowledgeEntry>>> {
        if let Some(entries) = self.cached.read().await.as_ref() {
            return Ok(entries.clone());
        }

        let mut cached = self.cached.write().await;
        if let Some(entries) = cached.as_ref() {
            return Ok(entries.clone());
        }

        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read knowledge base {}: {}", self.path.display(), e)
        })?;
        let entries: Vec<KnowledgeEntry> = serde_json::from_str(&raw)?;
        info!("Loaded {} knowledge base entries from {}", entries.len(), self.path.display());

        let entries = Arc::new(entries);
        if !entries.is_empty() {
            *cached = Some(entries.clone());
        }
        Ok(entries)
    }
}

/// Mutable in-process knowledge base, for embedding callers and tests.
#[derive(Default)]
pub struct InMemoryKnowledgeBase {
    entries: RwLock<Arc<Vec<KnowledgeEntry>>>,
}

impl InMemoryKnowledgeBase {
    pub fn new(entries: Vec<KnowledgeEntry>) -> Self {
        Self {
            entries: RwLock::new(Arc::new(entries)),
        }
    }

    pub async fn replace(&self, entries: Vec<KnowledgeEntry>) {
        debug!("Replacing knowledge base with {} entries", entries.len());
        *self.entries.write().await = Arc::new(entries);
    }

    pub async fn push(&self, entry: KnowledgeEntry) {
        let mut guard = self.entries.write().await;
        let mut entries = guard.as_ref().clone();
        entries.push(entry);
        *guard = Arc::new(entries);
    }
}

#[async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    async fn load_all(&self) -> anyhow::Result<Arc<Vec<KnowledgeEntry>>> {
        Ok(self.entries.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"[
        {"question": "What is RSI?", "answer": "RSI is a momentum oscillator.", "category": "indicators", "keywords": ["rsi", "momentum"]},
        {"question": "What is a head and shoulders pattern?", "answer": "A reversal pattern with three peaks.", "category": "patterns", "keywords": ["reversal"]},
        {"question": "How is volume used?", "answer": "Volume confirms RSI divergence and breakouts.", "category": "Indicators"}
    ]"#;

    async fn sample_kb() -> (tempfile::TempDir, JsonKnowledgeBase) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("qa.json");
        tokio::fs::write(&path, SAMPLE).await.unwrap();
        (dir, JsonKnowledgeBase::new(path))
    }

    #[tokio::test]
    async fn test_load_all_reads_entries() {
        let (_dir, kb) = sample_kb().await;
        let entries = kb.load_all().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[2].keywords.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error_and_not_cached() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("later.json");
        let kb = JsonKnowledgeBase::new(&path);
        assert!(kb.load_all().await.is_err());

        tokio::fs::write(&path, SAMPLE).await.unwrap();
        assert_eq!(kb.load_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_file_is_not_cached() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("qa.json");
        tokio::fs::write(&path, "[]").await.unwrap();
        let kb = JsonKnowledgeBase::new(&path);
        assert!(kb.load_all().await.unwrap().is_empty());

        tokio::fs::write(&path, SAMPLE).await.unwrap();
        assert_eq!(kb.load_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_search_ranks_question_matches_first() {
        let (_dir, kb) = sample_kb().await;
        let results = kb.search("RSI").await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].question, "What is RSI?");
        assert!(kb.search("   ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_by_category_ignores_case() {
        let (_dir, kb) = sample_kb().await;
        assert_eq!(kb.by_category("indicators").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_clear_cache_rereads_file() {
        let (dir, kb) = sample_kb().await;
        assert_eq!(kb.load_all().await.unwrap().len(), 3);

        tokio::fs::write(dir.path().join("qa.json"), "[]").await.unwrap();
        assert_eq!(kb.load_all().await.unwrap().len(), 3);

        kb.clear_cache().await;
        assert!(kb.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_push() {
        let kb = InMemoryKnowledgeBase::default();
        assert!(kb.load_all().await.unwrap().is_empty());
        kb.push(KnowledgeEntry::new("q", "a")).await;
        assert_eq!(kb.load_all().await.unwrap().len(), 1);
    }
}
