mod common;

use common::{harness, harness_with_config, ScriptedLoader, MACD_ANSWER, RSI_ANSWER};
use futures::future::join_all;
use offline_ensemble::ensemble::extractive_qa::DEFAULT_ANSWER;
use offline_ensemble::ensemble::orchestrator::{
    MODELS_UNAVAILABLE_FALLBACK, NO_MATCH_FALLBACK, NO_MATCH_REASON,
};
use offline_ensemble::{metrics, EnsembleConfig, GenerationResult, ModelKind, ModelState};
use std::sync::atomic::Ordering;

const REQUIRED: [ModelKind; 2] = ModelKind::REQUIRED;
const MAX_TOKENS: usize = 512;

/// Cosine 0.6 against "What is RSI?", 0 against everything else.
const WEAK_RSI_QUESTION: &str = "Is RSI useful for crypto?";
/// Cosine 0.8 against "What is RSI?".
const CLOSE_RSI_QUESTION: &str = "Explain the RSI indicator";

fn scripted() -> ScriptedLoader {
    let mut loader = ScriptedLoader::new();
    loader.vector(WEAK_RSI_QUESTION, [3.0, 0.0, 4.0, 0.0]);
    loader.vector(CLOSE_RSI_QUESTION, [4.0, 0.0, 3.0, 0.0]);
    loader
}

fn success_text(result: &GenerationResult) -> (&str, bool) {
    match result {
        GenerationResult::Success {
            text, from_cache, ..
        } => (text.as_str(), *from_cache),
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_exact_match_takes_fast_path() {
    let h = harness(scripted().qa_answer("unused", 0.9), &REQUIRED);
    h.orchestrator.initialize().await.unwrap();

    let result = h.orchestrator.generate("What is RSI?", MAX_TOKENS).await;
    assert_eq!(success_text(&result), (RSI_ANSWER, true));
    assert!(h.loader.qa_contexts().is_empty());
    assert_eq!(h.orchestrator.state(), ModelState::Ready);
}

#[tokio::test]
async fn test_close_match_above_default_threshold() {
    let h = harness(scripted(), &REQUIRED);
    h.orchestrator.initialize().await.unwrap();

    let result = h.orchestrator.generate(CLOSE_RSI_QUESTION, MAX_TOKENS).await;
    assert_eq!(success_text(&result), (RSI_ANSWER, true));
}

#[tokio::test]
async fn test_threshold_is_inclusive() {
    let config = EnsembleConfig {
        retrieval_threshold: 0.6,
        ..EnsembleConfig::default()
    };
    let h = harness_with_config(scripted().qa_answer("unused", 0.9), &REQUIRED, config);
    h.orchestrator.initialize().await.unwrap();

    let result = h.orchestrator.generate(WEAK_RSI_QUESTION, MAX_TOKENS).await;
    assert_eq!(success_text(&result), (RSI_ANSWER, true));
    assert!(h.loader.qa_contexts().is_empty());
}

#[tokio::test]
async fn test_weak_match_goes_to_extractive_qa_with_retrieval_context() {
    let h = harness(
        scripted()
            .qa_answer("a momentum oscillator", 0.92)
            .with_intent("indicator", 0.8),
        &ModelKind::ALL,
    );
    h.orchestrator.initialize().await.unwrap();

    let result = h.orchestrator.generate(WEAK_RSI_QUESTION, MAX_TOKENS).await;
    assert_eq!(success_text(&result), ("a momentum oscillator", false));
    assert_eq!(
        h.loader.qa_contexts(),
        vec![format!(
            "Related information: {}\n\nQuestion: {}\nIntent: indicator",
            RSI_ANSWER, WEAK_RSI_QUESTION
        )]
    );
}

#[tokio::test]
async fn test_no_retrieval_match_builds_intent_context() {
    let h = harness(
        scripted()
            .qa_answer("watch the trend", 0.8)
            .with_intent("trading_strategy", 0.7),
        &ModelKind::ALL,
    );
    h.orchestrator.initialize().await.unwrap();

    let result = h.orchestrator.generate("When should I sell?", MAX_TOKENS).await;
    assert_eq!(success_text(&result), ("watch the trend", false));
    assert_eq!(
        h.loader.qa_contexts(),
        vec!["This is a question about trading strategies and market analysis.\n\nQuestion: When should I sell?".to_string()]
    );
}

#[tokio::test]
async fn test_low_confidence_qa_answer_is_still_returned() {
    let h = harness(scripted().qa_answer("maybe", 0.1), &REQUIRED);
    h.orchestrator.initialize().await.unwrap();

    let result = h.orchestrator.generate(WEAK_RSI_QUESTION, MAX_TOKENS).await;
    assert_eq!(success_text(&result), (DEFAULT_ANSWER, false));
}

#[tokio::test]
async fn test_qa_failure_falls_back_to_best_retrieval() {
    let mut loader = scripted();
    loader.qa_fails_inference = true;
    let h = harness(loader, &REQUIRED);
    h.orchestrator.initialize().await.unwrap();

    let result = h.orchestrator.generate(WEAK_RSI_QUESTION, MAX_TOKENS).await;
    assert_eq!(success_text(&result), (RSI_ANSWER, true));
    assert_eq!(h.loader.qa_contexts().len(), 1);
    assert_eq!(h.orchestrator.state(), ModelState::Ready);
}

#[tokio::test]
async fn test_retrieval_only_uses_weak_match() {
    let loader = scripted();
    loader.qa_load_fails.store(true, Ordering::SeqCst);
    let h = harness(loader, &REQUIRED);
    h.orchestrator.initialize().await.unwrap();

    let result = h.orchestrator.generate(WEAK_RSI_QUESTION, MAX_TOKENS).await;
    assert_eq!(success_text(&result), (RSI_ANSWER, true));
}

#[tokio::test]
async fn test_retrieval_only_without_match_is_unavailable() {
    let loader = scripted();
    loader.qa_load_fails.store(true, Ordering::SeqCst);
    let h = harness(loader, &REQUIRED);
    h.orchestrator.initialize().await.unwrap();

    match h.orchestrator.generate("When should I sell?", MAX_TOKENS).await {
        GenerationResult::Unavailable {
            reason,
            fallback_text,
        } => {
            assert_eq!(reason, NO_MATCH_REASON);
            assert_eq!(fallback_text, NO_MATCH_FALLBACK);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(h.orchestrator.state(), ModelState::Ready);
}

#[tokio::test]
async fn test_uninitialized_returns_unavailable_without_state_change() {
    let h = harness(scripted(), &REQUIRED);

    match h.orchestrator.generate("What is RSI?", MAX_TOKENS).await {
        GenerationResult::Unavailable {
            reason,
            fallback_text,
        } => {
            assert_eq!(reason, "Models not loaded into memory");
            assert_eq!(fallback_text, MODELS_UNAVAILABLE_FALLBACK);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(h.orchestrator.state(), ModelState::Downloaded);
}

#[tokio::test]
async fn test_generate_after_unload_is_unavailable() {
    let h = harness(scripted(), &REQUIRED);
    h.orchestrator.initialize().await.unwrap();
    h.orchestrator.unload().await;

    let result = h.orchestrator.generate("What is RSI?", MAX_TOKENS).await;
    assert!(matches!(result, GenerationResult::Unavailable { .. }));
    assert!(!result.display_text().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_generate_restores_ready() {
    let h = harness(scripted().qa_answer("a momentum oscillator", 0.9), &REQUIRED);
    h.orchestrator.initialize().await.unwrap();

    let questions = ["What is RSI?", "What is MACD?", WEAK_RSI_QUESTION, "When should I sell?"];
    let calls = (0..16).map(|i| {
        let orchestrator = h.orchestrator.clone();
        let question = questions[i % questions.len()];
        async move { orchestrator.generate(question, MAX_TOKENS).await }
    });
    let results = join_all(calls).await;

    assert!(results.iter().all(GenerationResult::is_success));
    assert_eq!(success_text(&results[1]), (MACD_ANSWER, true));
    assert_eq!(h.orchestrator.state(), ModelState::Ready);
}

#[tokio::test]
async fn test_max_tokens_truncates_answer() {
    let h = harness(scripted(), &REQUIRED);
    h.orchestrator.initialize().await.unwrap();

    match h.orchestrator.generate("What is MACD?", 2).await {
        GenerationResult::Success {
            text,
            tokens_generated,
            ..
        } => {
            assert_eq!(text, "MACD compares");
            assert_eq!(tokens_generated, 2);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_routes_are_counted() {
    metrics::init_metrics().unwrap();
    let h = harness(scripted(), &REQUIRED);
    h.orchestrator.initialize().await.unwrap();
    h.orchestrator.generate("What is RSI?", MAX_TOKENS).await;

    let text = metrics::gather().unwrap();
    assert!(text.contains("route=\"fast_path\""));
    assert!(text.contains("outcome=\"success\""));
}

#[tokio::test]
async fn test_query_panic_fails_and_initialize_recovers() {
    let loader = scripted();
    let panics = loader.embedder_panics_on_query.clone();
    let h = harness(loader, &REQUIRED);
    h.orchestrator.initialize().await.unwrap();
    panics.store(true, Ordering::SeqCst);

    match h.orchestrator.generate("When should I sell?", MAX_TOKENS).await {
        GenerationResult::Failure {
            error,
            fallback_text,
        } => {
            assert_eq!(error, "inference job panicked");
            assert_eq!(fallback_text.as_deref(), Some(MODELS_UNAVAILABLE_FALLBACK));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    match h.orchestrator.state() {
        ModelState::Error { recoverable, .. } => assert!(recoverable),
        other => panic!("unexpected state: {:?}", other),
    }
    assert!(matches!(
        h.orchestrator.generate("What is RSI?", MAX_TOKENS).await,
        GenerationResult::Unavailable { .. }
    ));

    panics.store(false, Ordering::SeqCst);
    h.orchestrator.initialize().await.unwrap();
    assert_eq!(h.orchestrator.state(), ModelState::Ready);
    let result = h.orchestrator.generate("What is RSI?", MAX_TOKENS).await;
    assert_eq!(success_text(&result), (RSI_ANSWER, true));
}

#[tokio::test]
async fn test_qa_panic_falls_back_to_best_retrieval() {
    let mut loader = scripted();
    loader.qa_panics = true;
    let h = harness(loader, &REQUIRED);
    h.orchestrator.initialize().await.unwrap();

    let result = h.orchestrator.generate(WEAK_RSI_QUESTION, MAX_TOKENS).await;
    assert_eq!(success_text(&result), (RSI_ANSWER, true));
    assert_eq!(h.loader.qa_contexts().len(), 1);
    assert_eq!(h.orchestrator.state(), ModelState::Ready);
}
