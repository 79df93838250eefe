// crates/offline-ensemble/src/main.rs

#[cfg(feature = "cli")]
mod cli {
    use anyhow::Result;
    use clap::{Parser, Subcommand};
    use offline_ensemble::{
        config::Config, metrics, shared_state::EnsembleServices, telemetry, GenerationResult,
        ModelKind, SharedEnsemble,
    };
    use std::sync::Arc;
    use tracing::warn;

    #[derive(Parser, Debug)]
    #[command(
        name = "offline-ensemble",
        version,
        about = "Answer trading questions offline with a retrieval + extractive QA ensemble."
    )]
    pub struct Cli {
        #[command(subcommand)]
        pub command: Command,
    }

    #[derive(Subcommand, Debug)]
    pub enum Command {
        /// Answer a question
        Ask {
            question: String,
            /// Maximum number of words in the answer
            #[arg(long)]
            max_tokens: Option<usize>,
            /// Skip the explanation cache
            #[arg(long)]
            no_cache: bool,
        },
        /// Show model artifacts, lifecycle state and health
        Status,
        /// Show cache counters
        CacheStats,
        /// Drop every cached embedding and answer
        ClearCache,
        /// Load the ensemble and print prometheus metrics
        Metrics,
    }

    pub async fn run(cli: Cli) -> Result<()> {
        let config = Config::from_env()?;
        config.print_config();
        let shared = SharedEnsemble::new(config);
        let services = shared.services().await?;

        match cli.command {
            Command::Ask {
                question,
                max_tokens,
                no_cache,
            } => ask(&services, &question, max_tokens, no_cache).await,
            Command::Status => {
                status(&services).await;
                Ok(())
            }
            Command::CacheStats => cache_stats(&services),
            Command::ClearCache => {
                services.answers.clear_cache().await;
                services.embedding_cache.clear();
                println!("Caches cleared.");
                Ok(())
            }
            Command::Metrics => {
                initialize(&services).await;
                print!("{}", metrics::gather()?);
                Ok(())
            }
        }
    }

    async fn initialize(services: &EnsembleServices) {
        if let Err(e) = services.orchestrator.initialize().await {
            warn!("Ensemble not initialized: {}", e);
        }
    }

    async fn ask(
        services: &Arc<EnsembleServices>,
        question: &str,
        max_tokens: Option<usize>,
        no_cache: bool,
    ) -> Result<()> {
        initialize(services).await;
        let max_tokens = max_tokens.unwrap_or(services.orchestrator.config().default_max_tokens);

        let result = if no_cache {
            services.orchestrator.generate(question, max_tokens).await
        } else {
            services.answers.answer_question_with_limit(question, max_tokens).await
        };

        println!("\n{}", result.display_text());
        match &result {
            GenerationResult::Success {
                tokens_generated,
                inference_time_ms,
                from_cache,
                ..
            } => println!(
                "\n[{} tokens, {} ms{}]",
                tokens_generated,
                inference_time_ms,
                if *from_cache { ", cached" } else { "" }
            ),
            GenerationResult::Failure { error, .. } => println!("\n[failed: {}]", error),
            GenerationResult::Unavailable { reason, .. } => println!("\n[unavailable: {}]", reason),
        }
        Ok(())
    }

    async fn status(services: &EnsembleServices) {
        let orchestrator = &services.orchestrator;
        println!("State: {}", orchestrator.refresh_state());

        initialize(services).await;
        let health = orchestrator.health();
        println!("Health: {:?} ({})", health.status, health.message);
        println!("Loaded models:");
        for kind in ModelKind::ALL {
            let loaded = health.models_loaded.contains(&kind);
            println!(
                "  {:<22} {:<28} {}",
                kind.display_name(),
                kind.artifact_name(),
                if loaded { "loaded" } else { "-" }
            );
        }
        println!("Indexed questions: {}", orchestrator.retriever().cached_embeddings_count());
    }

    fn cache_stats(services: &EnsembleServices) -> Result<()> {
        for stats in [services.embedding_cache.stats(), services.explanation_cache.stats()] {
            println!(
                "{}: {} memory hits, {} persistent hits, {} misses, {} writes, {} expired, hit rate {:.1}%",
                stats.name,
                stats.memory_hits,
                stats.persistent_hits,
                stats.misses,
                stats.writes,
                stats.expired_evictions,
                stats.hit_rate * 100.0
            );
            match stats.persistent_entries {
                Some(n) => println!("  {} in memory, {} persisted", stats.memory_entries, n),
                None => println!("  {} in memory", stats.memory_entries),
            }
        }
        if let Some(db) = &services.database {
            let db_stats = db.get_stats()?;
            println!(
                "Database: {} entries, schema v{}, {} bytes",
                db_stats.total_entries, db_stats.schema_version, db_stats.database_size_bytes
            );
        }
        Ok(())
    }

    pub fn init() -> Result<()> {
        telemetry::init_tracing_with_default("warn");
        metrics::init_metrics()?;
        Ok(())
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;

    cli::init()?;
    cli::run(cli::Cli::parse()).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
