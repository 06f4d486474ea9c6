use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use tandem_shared::ChatError;

/// Failure of a single call to the gateway or the upload endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection error: {0}")]
    Connection(String),

    /// The server answered with an error.
    #[error("Rejected: {0}")]
    Rejected(ChatError),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Terminal failures are never retried automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::Rejected(e) if e.code().is_terminal())
    }

    pub fn into_chat_error(self) -> ChatError {
        match self {
            TransportError::Rejected(e) => e,
            other => ChatError::TransientNetworkFailure(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Queue persistence error: {0}")]
    Persist(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No failed item with id {0}")]
    UnknownItem(Uuid),

    #[error("Cannot determine data directory")]
    NoDataDir,
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(TransportError::Rejected(ChatError::Forbidden("x".into())).is_terminal());
        assert!(!TransportError::Rejected(ChatError::Internal("x".into())).is_terminal());
        assert!(!TransportError::Timeout(Duration::from_secs(1)).is_terminal());
        assert!(!TransportError::NotConnected.is_terminal());
    }

    #[test]
    fn test_transient_maps_to_network_failure() {
        let err = TransportError::Connection("reset".into()).into_chat_error();
        assert!(matches!(err, ChatError::TransientNetworkFailure(_)));
    }
}
