use thiserror::Error;

/// Typed error hierarchy for chatcoalesce.
///
/// Use at module boundaries (buffer store calls, delivery, media resolution, config validation).
/// Internal/leaf functions can continue using `anyhow::Result`; the `Internal` variant
/// allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum CoalesceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Delivery error: {message}")]
    Delivery { message: String, retryable: bool },

    #[error("Media error: {0}")]
    Media(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `CoalesceError`.
pub type CoalesceResult<T> = std::result::Result<T, CoalesceError>;

impl CoalesceError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Whether the caller should retry the operation that produced this error.
    ///
    /// Storage errors are always retriable: the fragment was not accepted and
    /// the inbound request should be failed back to its sender.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Delivery { retryable, .. } => *retryable,
            Self::Storage { .. } | Self::Internal(_) => true,
            Self::Config(_) | Self::Media(_) => false,
        }
    }
}

impl From<redis::RedisError> for CoalesceError {
    fn from(err: redis::RedisError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}
