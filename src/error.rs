//! Crate-wide error taxonomy (§7).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("provider error (transient, retryable): {0}")]
    ProviderTransient(String),

    #[error("provider error (permanent): {0}")]
    ProviderPermanent(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("context truncated: {0}")]
    Truncated(String),

    #[error("intent extraction failed: {0}")]
    IntentFailure(String),

    #[error("rate limited, retry after {retry_after_secs:.1}s: {context}")]
    RateLimited { retry_after_secs: f64, context: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lexical store error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("vector store error: {0}")]
    Lance(#[from] lancedb::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// True for errors that a caller may usefully retry with backoff (§4.2/§4.3/§5).
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ProviderTransient(_) | EngineError::RateLimited { .. })
    }
}
