use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::models::DownloadState;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Transfer stalled: no data for {0:?}")]
    Stalled(Duration),
    #[error("Truncated body: expected {expected} bytes, got {actual}")]
    Truncated { expected: i64, actual: i64 },
    #[error("Server error: http {status} {message}")]
    Server { status: u16, message: String },
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Disk error: {0}")]
    Disk(#[from] io::Error),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("State error: {0}")]
    State(String),
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition {
        from: DownloadState,
        to: DownloadState,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Download cancelled")]
    Cancelled,
    #[error("Circuit open for {0}")]
    CircuitOpen(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Wire-level error taxonomy. Coarser than `EngineError`; this is what the
/// UI boundary and the attempts log see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Network,
    Server,
    Integrity,
    Disk,
    State,
    Cancelled,
    CircuitOpen,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Server => "server",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Disk => "disk",
            ErrorKind::State => "state",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CircuitOpen => "circuit_open",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::Serde(_) => ErrorKind::Validation,
            EngineError::Network(_) | EngineError::Stalled(_) | EngineError::Truncated { .. } => {
                ErrorKind::Network
            }
            EngineError::Server { .. } => ErrorKind::Server,
            EngineError::Integrity(_) => ErrorKind::Integrity,
            EngineError::Disk(_) | EngineError::Database(_) => ErrorKind::Disk,
            EngineError::State(_)
            | EngineError::IllegalTransition { .. }
            | EngineError::NotFound(_) => ErrorKind::State,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::CircuitOpen(_) => ErrorKind::CircuitOpen,
        }
    }

    /// Whether a chunk-level retry may recover from this error.
    pub fn retryable(&self) -> bool {
        match self {
            EngineError::Network(err) => is_retryable_reqwest_error(err),
            EngineError::Stalled(_) | EngineError::Truncated { .. } => true,
            EngineError::Server { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            _ => false,
        }
    }

    pub fn server(status: reqwest::StatusCode, message: impl Into<String>) -> Self {
        EngineError::Server {
            status: status.as_u16(),
            message: message.into(),
        }
    }
}

/// Retryable: connect, timeout, request and body-read failures.
/// Non-retryable: redirect policy rejections and builder errors.
pub fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() || err.is_decode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_classify_by_status() {
        let transient = EngineError::Server {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert!(transient.retryable());
        assert_eq!(transient.kind(), ErrorKind::Server);

        let permanent = EngineError::Server {
            status: 404,
            message: "not found".to_string(),
        };
        assert!(!permanent.retryable());

        for status in [408, 429] {
            let err = EngineError::Server {
                status,
                message: String::new(),
            };
            assert!(err.retryable(), "{status} should be retryable");
        }
    }

    #[test]
    fn kinds_map_to_wire_strings() {
        assert_eq!(ErrorKind::CircuitOpen.as_str(), "circuit_open");
        assert_eq!(EngineError::Cancelled.kind().as_str(), "cancelled");
        assert_eq!(
            EngineError::Validation("bad url".to_string()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn stalled_is_retryable_network_error() {
        let err = EngineError::Stalled(Duration::from_secs(60));
        assert!(err.retryable());
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn illegal_transition_is_state_error() {
        let err = EngineError::IllegalTransition {
            from: DownloadState::Completed,
            to: DownloadState::Queued,
        };
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(!err.retryable());
    }
}
