use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("service rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("service quota exhausted")]
    QuotaExceeded,

    #[error("transient service failure: {0}")]
    Transient(String),

    #[error("request rejected by service: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("daily request budget exhausted")]
    RateLimitedDaily,

    #[error("generation failed after retries: {0}")]
    Transient(String),

    #[error("invalid generation request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("no evidence found for query")]
    RetrievalEmpty,

    #[error("daily request budget exhausted")]
    RateLimitedDaily,

    #[error("chunk store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("query timed out after {0:?}")]
    TimedOut(Duration),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
