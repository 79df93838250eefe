//! Intent classification. Optional: with no backend every question is
//! `general`, and no failure here ever reaches the caller.

use crate::model_runtime::{BackendLoader, BackendSlot, BackendUnavailable, IntentBackend};
use crate::model_state::ModelKind;
use crate::thread_pool::InferencePool;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_INTENT_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    PatternExplanation,
    QuantraScore,
    TradingStrategy,
    Indicator,
    Validation,
    General,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::PatternExplanation,
        Intent::QuantraScore,
        Intent::TradingStrategy,
        Intent::Indicator,
        Intent::Validation,
        Intent::General,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Intent::PatternExplanation => "pattern_explanation",
            Intent::QuantraScore => "quantra_score",
            Intent::TradingStrategy => "trading_strategy",
            Intent::Indicator => "indicator",
            Intent::Validation => "validation",
            Intent::General => "general",
        }
    }

    /// Labels outside the known set map to `General`.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        Intent::ALL
            .into_iter()
            .find(|intent| intent.label().eq_ignore_ascii_case(label))
            .unwrap_or(Intent::General)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: Intent,
    pub confidence: f32,
}

impl Default for IntentResult {
    fn default() -> Self {
        Self {
            intent: Intent::General,
            confidence: DEFAULT_INTENT_CONFIDENCE,
        }
    }
}

pub struct IntentClassifier {
    slot: BackendSlot<dyn IntentBackend>,
    loader: Arc<dyn BackendLoader>,
    pool: Arc<InferencePool>,
}

impl IntentClassifier {
    pub fn new(loader: Arc<dyn BackendLoader>, pool: Arc<InferencePool>) -> Self {
        Self {
            slot: BackendSlot::new(ModelKind::IntentClassifier),
            loader,
            pool,
        }
    }

    pub async fn initialize(&self, artifact: &Path) -> Result<(), BackendUnavailable> {
        let loader = self.loader.clone();
        let artifact = artifact.to_path_buf();
        self.slot
            .ensure_loaded(&self.pool, move || loader.load_intent(&artifact))
            .await
            .map(|_| ())
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_loaded()
    }

    pub async fn classify(&self, text: &str) -> IntentResult {
        if text.trim().is_empty() {
            return IntentResult::default();
        }
        let Some(backend) = self.slot.get() else {
            return IntentResult::default();
        };

        let input = text.to_string();
        let scores = match self.pool.run(move || backend.classify(&input)).await {
            Ok(Ok(scores)) => scores,
            Ok(Err(e)) => {
                warn!("Intent classification failed: {}", e);
                return IntentResult::default();
            }
            Err(e) => {
                warn!("Intent classification job failed: {}", e);
                return IntentResult::default();
            }
        };

        match scores.into_iter().next() {
            Some(top) => {
                let intent = Intent::from_label(&top.label);
                if intent == Intent::General && !top.label.eq_ignore_ascii_case("general") {
                    debug!("Unknown intent label '{}' coerced to general", top.label);
                }
                IntentResult {
                    intent,
                    confidence: top.score,
                }
            }
            None => IntentResult::default(),
        }
    }

    pub fn close(&self) -> bool {
        self.slot.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runtime::{BackendMetadata, EmbeddingBackend, IntentScore, ModelBackend, ModelFormat, QaBackend};
    use std::path::PathBuf;

    struct FixedIntent(&'static str, f32);

    impl ModelBackend for FixedIntent {
        fn metadata(&self) -> BackendMetadata {
            BackendMetadata {
                kind: ModelKind::IntentClassifier,
                format: ModelFormat::Json,
                backend_name: "fixed".to_string(),
                artifact_path: PathBuf::from("intent.json"),
            }
        }
    }

    impl IntentBackend for FixedIntent {
        fn classify(&self, _text: &str) -> anyhow::Result<Vec<IntentScore>> {
            if self.0 == "fail" {
                anyhow::bail!("tensor shape mismatch");
            }
            Ok(vec![IntentScore {
                label: self.0.to_string(),
                score: self.1,
            }])
        }
    }

    struct FixedLoader(&'static str, f32);

    impl BackendLoader for FixedLoader {
        fn load_embedding(&self, _: &Path) -> anyhow::Result<Arc<dyn EmbeddingBackend>> {
            anyhow::bail!("not used")
        }
        fn load_qa(&self, _: &Path) -> anyhow::Result<Arc<dyn QaBackend>> {
            anyhow::bail!("not used")
        }
        fn load_intent(&self, _: &Path) -> anyhow::Result<Arc<dyn IntentBackend>> {
            Ok(Arc::new(FixedIntent(self.0, self.1)))
        }
    }

    async fn classifier(label: &'static str, score: f32) -> IntentClassifier {
        let pool = Arc::new(InferencePool::new(1).unwrap());
        let classifier = IntentClassifier::new(Arc::new(FixedLoader(label, score)), pool);
        classifier.initialize(Path::new("intent.json")).await.unwrap();
        classifier
    }

    #[test]
    fn test_from_label_coerces_unknown() {
        assert_eq!(Intent::from_label("indicator"), Intent::Indicator);
        assert_eq!(Intent::from_label(" Quantra_Score "), Intent::QuantraScore);
        assert_eq!(Intent::from_label("crypto_pump"), Intent::General);
    }

    #[tokio::test]
    async fn test_blank_input_skips_backend() {
        let classifier = classifier("fail", 0.0).await;
        assert_eq!(classifier.classify("   ").await, IntentResult::default());
    }

    #[tokio::test]
    async fn test_without_backend_defaults_to_general() {
        let pool = Arc::new(InferencePool::new(1).unwrap());
        let classifier = IntentClassifier::new(Arc::new(FixedLoader("indicator", 0.9)), pool);
        let result = classifier.classify("What is RSI?").await;
        assert_eq!(result.intent, Intent::General);
        assert_eq!(result.confidence, DEFAULT_INTENT_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_confidence_passed_through() {
        let classifier = classifier("indicator", 0.83).await;
        let result = classifier.classify("What is RSI?").await;
        assert_eq!(result.intent, Intent::Indicator);
        assert_eq!(result.confidence, 0.83);
    }

    #[tokio::test]
    async fn test_unknown_label_keeps_backend_confidence() {
        let classifier = classifier("astrology", 0.91).await;
        let result = classifier.classify("Will the moon move markets?").await;
        assert_eq!(result.intent, Intent::General);
        assert_eq!(result.confidence, 0.91);
    }

    #[tokio::test]
    async fn test_backend_failure_defaults() {
        let classifier = classifier("fail", 0.0).await;
        assert_eq!(classifier.classify("What is RSI?").await, IntentResult::default());
    }
}
