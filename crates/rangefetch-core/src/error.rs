//! Error types for the download engine

use thiserror::Error;
use uuid::Uuid;

/// Transport-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),
}

impl From<reqwest::Error> for NetworkError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            NetworkError::Timeout
        } else if let Some(status) = error.status() {
            NetworkError::HttpStatus(status.as_u16())
        } else {
            NetworkError::ConnectionFailed(error.to_string())
        }
    }
}

/// Errors that can occur in the download engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Range mismatch: {0}")]
    RangeMismatch(String),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Queue is at capacity ({0} pending)")]
    Capacity(usize),

    #[error("Download not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Download was paused")]
    Paused,

    #[error("Download aborted by engine shutdown")]
    Aborted,

    #[error("Download did not finish within its time limit")]
    RequestTimeout,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if this error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Network(NetworkError::Timeout)
            | EngineError::Network(NetworkError::ConnectionFailed(_)) => true,
            EngineError::Network(NetworkError::HttpStatus(status)) => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// Pause, cancel and shutdown surface as errors but are not failures
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            EngineError::Paused | EngineError::Cancelled | EngineError::Aborted
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(error: reqwest::Error) -> Self {
        EngineError::Network(error.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Config(error.to_string())
    }
}

impl From<url::ParseError> for EngineError {
    fn from(error: url::ParseError) -> Self {
        EngineError::Validation(format!("invalid URL: {}", error))
    }
}
