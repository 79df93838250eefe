//! Process-wide ensemble services.
//!
//! `SharedEnsemble` is constructed once by the application and handed to
//! every feature surface that needs answers. The heavy services behind it are
//! built on first use, exactly once even under concurrent first calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::{
    cache_management::{EmbeddingCache, ExplanationCache, SystemClock, TwoTierCache},
    config::Config,
    ensemble::{AnswerService, EnsembleComponents, EnsembleOrchestrator},
    knowledge::{JsonKnowledgeBase, KnowledgeBase},
    model_runtime::{BackendLoader, DirectoryArtifactStore, LexicalBackendLoader},
    storage::CacheDatabase,
    thread_pool::InferencePool,
};

pub const EMBEDDING_NAMESPACE: &str = "embeddings";
pub const EXPLANATION_NAMESPACE: &str = "explanations";

/// Everything built from one `Config`.
pub struct EnsembleServices {
    pub orchestrator: Arc<EnsembleOrchestrator>,
    pub answers: Arc<AnswerService>,
    pub embedding_cache: Arc<EmbeddingCache>,
    pub explanation_cache: Arc<ExplanationCache>,
    pub database: Option<CacheDatabase>,
}

pub struct SharedEnsemble {
    config: Arc<Config>,
    loader: Arc<dyn BackendLoader>,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
    services: OnceCell<Arc<EnsembleServices>>,
    constructions: AtomicUsize,
}

impl SharedEnsemble {
    /// Uses the lexical reference backends.
    pub fn new(config: Config) -> Self {
        Self::with_loader(config, Arc::new(LexicalBackendLoader))
    }

    pub fn with_loader(config: Config, loader: Arc<dyn BackendLoader>) -> Self {
        Self {
            config: Arc::new(config),
            loader,
            knowledge: None,
            services: OnceCell::new(),
            constructions: AtomicUsize::new(0),
        }
    }

    /// Replaces the JSON knowledge base named in the config.
    pub fn with_knowledge_base(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Builds the services on the first call; later and concurrent callers
    /// get the same instance. A failed build is retried on the next call.
    pub async fn services(&self) -> anyhow::Result<Arc<EnsembleServices>> {
        self.services
            .get_or_try_init(|| async { self.build().map(Arc::new) })
            .await
            .cloned()
    }

    /// The services if they have been built already.
    pub fn built(&self) -> Option<Arc<EnsembleServices>> {
        self.services.get().cloned()
    }

    /// How many times the services were constructed. Never more than one.
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    fn build(&self) -> anyhow::Result<EnsembleServices> {
        self.constructions.fetch_add(1, Ordering::SeqCst);
        let config = &self.config;
        let cache_config = config.cache_config();

        let database = if config.cache_persist {
            match CacheDatabase::new(&config.cache_db_path) {
                Ok(db) => Some(db),
                Err(e) => {
                    warn!(
                        "Cache database unavailable at {}, caching in memory only: {}",
                        config.cache_db_path.display(),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let clock = Arc::new(SystemClock);
        let embedding_cache = Arc::new(TwoTierCache::new(
            EMBEDDING_NAMESPACE,
            cache_config.clone(),
            database.as_ref().map(|db| db.store(EMBEDDING_NAMESPACE)),
            clock.clone(),
        ));
        let explanation_cache = Arc::new(TwoTierCache::new(
            EXPLANATION_NAMESPACE,
            cache_config,
            database.as_ref().map(|db| db.store(EXPLANATION_NAMESPACE)),
            clock,
        ));

        let knowledge: Arc<dyn KnowledgeBase> = match &self.knowledge {
            Some(knowledge) => knowledge.clone(),
            None => Arc::new(JsonKnowledgeBase::new(&config.knowledge_base_path)),
        };
        let pool = Arc::new(InferencePool::new(config.inference_threads)?);

        let components = EnsembleComponents::new(
            self.loader.clone(),
            knowledge,
            Arc::new(DirectoryArtifactStore::new(&config.models_dir)),
            pool,
        )
        .with_embedding_cache(embedding_cache.clone());

        let orchestrator = Arc::new(EnsembleOrchestrator::new(components, config.ensemble_config()));
        let answers = Arc::new(AnswerService::new(orchestrator.clone(), explanation_cache.clone()));

        info!(
            "Ensemble services created (models: {}, persistent cache: {})",
            config.models_dir.display(),
            database.is_some()
        );

        Ok(EnsembleServices {
            orchestrator,
            answers,
            embedding_cache,
            explanation_cache,
            database,
        })
    }
}
