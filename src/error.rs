use thiserror::Error;

/// Crate-wide error type.
///
/// Semantic problems found in a SQL draft are never surfaced here; they are
/// recovered into a `ValidationReport`. Errors are reserved for malformed
/// configuration input and collaborator failures.
#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("Schema format error: {0}")]
    SchemaFormat(String),

    #[error("Fixer error: {0}")]
    Fixer(#[from] FixerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure modes of the external fix collaborator.
#[derive(Error, Debug)]
pub enum FixerError {
    #[error("Fixer request timed out")]
    Timeout,

    #[error("Fixer rate limited")]
    RateLimited,

    #[error("Fixer connection error: {0}")]
    Connection(String),

    #[error("Fixer returned malformed output: {0}")]
    Malformed(String),
}

impl FixerError {
    /// Transient failures are worth retrying with backoff; a malformed
    /// response is not: the collaborator answered, just badly.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FixerError::Malformed(_))
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;
