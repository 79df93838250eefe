// crates/offline-ensemble/src/config.rs

use crate::cache_management::CacheConfig;
use crate::ensemble::orchestrator::{EnsembleConfig, DEFAULT_MAX_TOKENS};
use crate::thread_pool;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub models_dir: PathBuf,
    pub knowledge_base_path: PathBuf,
    pub cache_db_path: PathBuf,
    pub cache_max_entries: u64,
    pub cache_ttl_hours: u64,
    pub cache_persist: bool,
    pub inference_threads: usize,
    pub retrieval_threshold: f32,
    pub qa_min_confidence: f32,
    pub default_max_tokens: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            knowledge_base_path: PathBuf::from("knowledge/qa_knowledge_base.json"),
            cache_db_path: PathBuf::from("data/ensemble_cache.db"),
            cache_max_entries: 100,
            cache_ttl_hours: 24,
            cache_persist: true,
            inference_threads: thread_pool::default_thread_count(),
            retrieval_threshold: 0.75,
            qa_min_confidence: 0.3,
            default_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_vars(|key| env::var(key).ok())
    }

    /// Builds a config from a variable lookup; unset variables take defaults.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // "auto" (or unset) picks a thread count from the CPU count
        let inference_threads = match var("INFERENCE_THREADS") {
            None => Self::auto_detect_threads(),
            Some(v) if v.eq_ignore_ascii_case("auto") => Self::auto_detect_threads(),
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("INFERENCE_THREADS must be a number or \"auto\", got {:?}", v))?,
        };

        let config = Self {
            models_dir: var("ENSEMBLE_MODELS_DIR").map(PathBuf::from).unwrap_or(defaults.models_dir),
            knowledge_base_path: var("KNOWLEDGE_BASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.knowledge_base_path),
            cache_db_path: var("CACHE_DB_PATH").map(PathBuf::from).unwrap_or(defaults.cache_db_path),
            cache_max_entries: parse_or(var("CACHE_MAX_ENTRIES"), "CACHE_MAX_ENTRIES", defaults.cache_max_entries)?,
            cache_ttl_hours: parse_or(var("CACHE_TTL_HOURS"), "CACHE_TTL_HOURS", defaults.cache_ttl_hours)?,
            cache_persist: match var("CACHE_PERSIST") {
                None => defaults.cache_persist,
                Some(v) => parse_bool(&v).with_context(|| format!("CACHE_PERSIST must be a boolean, got {:?}", v))?,
            },
            inference_threads,
            retrieval_threshold: parse_or(var("RETRIEVAL_THRESHOLD"), "RETRIEVAL_THRESHOLD", defaults.retrieval_threshold)?,
            qa_min_confidence: parse_or(var("QA_MIN_CONFIDENCE"), "QA_MIN_CONFIDENCE", defaults.qa_min_confidence)?,
            default_max_tokens: parse_or(var("DEFAULT_MAX_TOKENS"), "DEFAULT_MAX_TOKENS", defaults.default_max_tokens)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("RETRIEVAL_THRESHOLD", self.retrieval_threshold),
            ("QA_MIN_CONFIDENCE", self.qa_min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be between 0 and 1, got {}", name, value);
            }
        }
        if self.cache_max_entries == 0 {
            bail!("CACHE_MAX_ENTRIES must be at least 1");
        }
        if self.inference_threads == 0 {
            bail!("INFERENCE_THREADS must be at least 1");
        }
        if self.default_max_tokens == 0 {
            bail!("DEFAULT_MAX_TOKENS must be at least 1");
        }
        Ok(())
    }

    fn auto_detect_threads() -> usize {
        let threads = thread_pool::default_thread_count();
        info!("Auto-detected {} CPU cores, using {} inference threads", num_cpus::get(), threads);
        threads
    }

    pub fn ensemble_config(&self) -> EnsembleConfig {
        EnsembleConfig {
            retrieval_threshold: self.retrieval_threshold,
            qa_min_confidence: self.qa_min_confidence,
            default_max_tokens: self.default_max_tokens,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::default()
            .with_max_entries(self.cache_max_entries)
            .with_ttl(Duration::from_secs(self.cache_ttl_hours * 3600))
            .with_persistence(self.cache_persist)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Models Directory: {}", self.models_dir.display());
        info!("- Knowledge Base: {}", self.knowledge_base_path.display());
        info!("- Cache Database: {}", self.cache_db_path.display());
        info!("- Cache: {} entries, {}h TTL, persist={}", self.cache_max_entries, self.cache_ttl_hours, self.cache_persist);
        info!("- Inference Threads: {}", self.inference_threads);
        info!("- Retrieval Threshold: {}", self.retrieval_threshold);
        info!("- QA Min Confidence: {}", self.qa_min_confidence);
        info!("- Default Max Tokens: {}", self.default_max_tokens);
    }
}

fn parse_or<T>(value: Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v.parse::<T>().with_context(|| format!("Invalid value for {}: {:?}", name, v)),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
