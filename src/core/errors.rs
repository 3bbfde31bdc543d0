use thiserror::Error;

/// Error taxonomy for the engine.
///
/// Recovery points absorb most of these before they reach the caller:
/// retrieval degradation falls back to text search inside the retriever,
/// and generation failures are folded into a `success = false` envelope
/// at the orchestrator boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("rate limit exceeded for provider '{0}'")]
    RateLimitExceeded(String),
    #[error("no embedding provider configured")]
    EmbeddingUnavailable,
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        EngineError::Internal(err.to_string())
    }
}
