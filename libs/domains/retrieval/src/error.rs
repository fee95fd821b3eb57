use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Record not found: {0}")]
    RecordNotFound(Uuid),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Collection '{name}' still holds {records} records")]
    NotEmpty { name: String, records: usize },

    #[error("Embedding provider error: {0}")]
    Provider(String),

    #[error("Embedding failed after {attempts} attempts: {reason}")]
    EmbeddingFailed { attempts: u32, reason: String },

    #[error("Embedding timed out after {0}ms")]
    EmbeddingTimeout(u64),

    #[error("Index for collection '{collection}' has {pending} pending updates")]
    IndexStale { collection: String, pending: u64 },

    #[error("Index build failed: {0}")]
    IndexBuild(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type RetrievalResult<T> = Result<T, RetrievalError>;

impl RetrievalError {
    /// Whether the failure is a transient provider hiccup worth retrying.
    ///
    /// Store faults (`NotFound`, `DimensionMismatch`, `AlreadyExists`, ...) are
    /// caller errors and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetrievalError::Provider(_))
    }

    /// Whether the failure came from the embedding provider path.
    pub fn is_provider_fault(&self) -> bool {
        matches!(
            self,
            RetrievalError::Provider(_)
                | RetrievalError::EmbeddingFailed { .. }
                | RetrievalError::EmbeddingTimeout(_)
        )
    }

    pub(crate) fn dimension(expected: usize, actual: usize) -> Self {
        RetrievalError::DimensionMismatch { expected, actual }
    }
}

impl From<reqwest::Error> for RetrievalError {
    fn from(err: reqwest::Error) -> Self {
        RetrievalError::Provider(err.to_string())
    }
}

impl From<serde_json::Error> for RetrievalError {
    fn from(err: serde_json::Error) -> Self {
        RetrievalError::Internal(format!("JSON error: {}", err))
    }
}

impl From<tokio::task::JoinError> for RetrievalError {
    fn from(err: tokio::task::JoinError) -> Self {
        RetrievalError::Internal(format!("Background task failed: {}", err))
    }
}

impl From<core_config::ConfigError> for RetrievalError {
    fn from(err: core_config::ConfigError) -> Self {
        RetrievalError::Config(err.to_string())
    }
}
