use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::gateway::{RateLimits, RetryPolicy};

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub answer_model: String,
    pub embedding_model: String,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub max_tokens_per_batch: usize,
    pub max_output_tokens: usize,
    /// Width of the sliding window the chunker used, in words.
    pub source_overlap_words: usize,
    pub min_overlap_words: usize,
    pub similarity_k: usize,
    pub gap_threshold_years: i32,
    pub max_augmentation_rounds: usize,
    pub broad_evidence_cap: usize,
    pub max_review_iterations: usize,
    pub max_sentences_per_paragraph: usize,
    pub chronology_tolerance_years: i32,
    pub related_questions: usize,
    pub query_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_batch: 3_000,
            max_output_tokens: 900,
            source_overlap_words: 80,
            min_overlap_words: 2,
            similarity_k: 48,
            gap_threshold_years: 10,
            max_augmentation_rounds: 2,
            broad_evidence_cap: 24,
            max_review_iterations: 5,
            max_sentences_per_paragraph: 3,
            chronology_tolerance_years: 5,
            related_questions: 3,
            query_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub ollama_base_url: String,
    pub qdrant_base_url: String,
    pub qdrant_collection: String,
    pub models: ModelConfig,
    pub pipeline: PipelineConfig,
    pub rate_limits: RateLimits,
    pub retry: RetryPolicy,
    pub max_concurrent_generations: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("CHRONICLE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            max_tokens_per_batch: env_or("MAX_TOKENS_PER_BATCH", defaults.max_tokens_per_batch),
            max_output_tokens: env_or("MAX_OUTPUT_TOKENS", defaults.max_output_tokens),
            source_overlap_words: env_or("SOURCE_OVERLAP_WORDS", defaults.source_overlap_words),
            min_overlap_words: env_or("MIN_OVERLAP_WORDS", defaults.min_overlap_words),
            similarity_k: env_or("SIMILARITY_K", defaults.similarity_k),
            gap_threshold_years: env_or("GAP_THRESHOLD_YEARS", defaults.gap_threshold_years),
            max_augmentation_rounds: env_or(
                "MAX_AUGMENTATION_ROUNDS",
                defaults.max_augmentation_rounds,
            ),
            broad_evidence_cap: env_or("BROAD_EVIDENCE_CAP", defaults.broad_evidence_cap),
            max_review_iterations: env_or("MAX_REVIEW_ITERATIONS", defaults.max_review_iterations),
            max_sentences_per_paragraph: env_or(
                "MAX_SENTENCES_PER_PARAGRAPH",
                defaults.max_sentences_per_paragraph,
            ),
            chronology_tolerance_years: env_or(
                "CHRONOLOGY_TOLERANCE_YEARS",
                defaults.chronology_tolerance_years,
            ),
            related_questions: env_or("RELATED_QUESTIONS", defaults.related_questions),
            query_timeout: Duration::from_secs(env_or(
                "QUERY_TIMEOUT_SECS",
                defaults.query_timeout.as_secs(),
            )),
        };

        Self {
            bind_addr: env::var("CHRONICLE_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            data_dir,
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            qdrant_base_url: env::var("QDRANT_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6333".to_string()),
            qdrant_collection: env::var("QDRANT_COLLECTION")
                .unwrap_or_else(|_| "history_chunks".to_string()),
            models: ModelConfig {
                answer_model: env::var("ANSWER_MODEL")
                    .unwrap_or_else(|_| "qwen2.5:14b-instruct".to_string()),
                embedding_model: env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "mxbai-embed-large".to_string()),
            },
            pipeline,
            rate_limits: RateLimits::new(
                env_or("REQUESTS_PER_MINUTE", 30),
                env_or("TOKENS_PER_MINUTE", 60_000),
                env_or("REQUESTS_PER_DAY", 1_000),
            ),
            retry: RetryPolicy::new(
                env_or("RETRY_MAX_ATTEMPTS", 4),
                Duration::from_millis(env_or("RETRY_BASE_DELAY_MS", 500)),
                Duration::from_millis(env_or("RETRY_MAX_DELAY_MS", 8_000)),
            ),
            max_concurrent_generations: env_or("MAX_CONCURRENT_GENERATIONS", 2),
        }
    }

    pub fn tantivy_dir(&self) -> PathBuf {
        self.data_dir.join("tantivy")
    }

    pub fn sqlite_dsn(&self) -> String {
        format!("sqlite://{}", self.data_dir.join("chronicle.sqlite3").display())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
