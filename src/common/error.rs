use thiserror::Error;

/// Error taxonomy for the real-time core. Transport plumbing keeps using
/// `anyhow`; anything a caller can act on is typed here.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("call session {session_id} is {actual}, action requires {expected}")]
    InvalidTransition {
        session_id: String,
        expected: &'static str,
        actual: String,
    },

    #[error("call session not found: {0}")]
    SessionNotFound(String),

    #[error("transient store failure: {0}")]
    TransientStoreFailure(#[source] anyhow::Error),

    #[error("delivery dropped: {0}")]
    DeliveryDrop(String),

    #[error("upstream backend error: {0}")]
    ProxyUpstreamError(String),

    #[error("message too long (max {max} chars)")]
    MessageTooLong { max: usize },
}

impl From<sqlx::Error> for RealtimeError {
    fn from(e: sqlx::Error) -> Self {
        RealtimeError::TransientStoreFailure(e.into())
    }
}

impl From<redis::RedisError> for RealtimeError {
    fn from(e: redis::RedisError) -> Self {
        RealtimeError::TransientStoreFailure(e.into())
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
