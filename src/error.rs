// Engine error taxonomy

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected at ingress; the order is persisted as REJECTED with this reason.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance { required: i128, available: i128 },

    /// Lock could not be acquired within the configured retry budget. Retryable.
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("store error: {0}")]
    Store(String),

    /// current_price() returned zero for this token.
    #[error("price unavailable for token {0}")]
    PriceUnavailable(String),

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("position {0} not found")]
    PositionNotFound(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    Internal(String),
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization: {}", e))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::LockUnavailable(_) | EngineError::Store(_))
    }
}
