use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for the connection manager and typed ops.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("connection unavailable: {0}")]
    Unavailable(String),

    #[error("connection manager is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(#[from] types::ConfigError),
}

impl ClientError {
    /// Whether `execute_with_retry` should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout(_) | ClientError::ProtocolError(_) | ClientError::TransportError(_)
        )
    }
}
