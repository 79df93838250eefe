//! Builds the passage handed to extractive QA when retrieval alone did not
//! answer confidently.

use super::intent::{Intent, IntentResult};
use super::retriever::RetrievalResult;

/// Context seeded with the closest knowledge-base answer.
pub fn with_retrieval(question: &str, retrieval: &RetrievalResult, intent: Option<&IntentResult>) -> String {
    let intent = intent.map(|i| i.intent).unwrap_or(Intent::General);
    format!(
        "Related information: {}\n\nQuestion: {}\nIntent: {}",
        retrieval.answer, question, intent
    )
}

/// Context built from the intent alone, used when retrieval found nothing.
pub fn from_intent(question: &str, intent: Option<&IntentResult>) -> String {
    let intent = intent.map(|i| i.intent).unwrap_or(Intent::General);
    format!("{}\n\nQuestion: {}", intent_sentence(intent), question)
}

pub fn build(question: &str, retrieval: Option<&RetrievalResult>, intent: Option<&IntentResult>) -> String {
    match retrieval {
        Some(retrieval) => with_retrieval(question, retrieval, intent),
        None => from_intent(question, intent),
    }
}

fn intent_sentence(intent: Intent) -> &'static str {
    match intent {
        Intent::PatternExplanation => "This is a question about chart patterns and technical analysis.",
        Intent::QuantraScore => "This is a question about the Quantra Score metric for pattern quality.",
        Intent::TradingStrategy => "This is a question about trading strategies and market analysis.",
        Intent::Indicator => "This is a question about technical indicators.",
        Intent::Validation => "This is a question about pattern validation and confirmation.",
        Intent::General => "This is a general question about trading and markets.",
    }
}
