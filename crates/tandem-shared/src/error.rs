use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the conversation core, shared by server and client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Referenced conversation, message or participant does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requester is not allowed to act on the conversation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Malformed action payload.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Retryable client-side network failure.
    #[error("Network failure: {0}")]
    TransientNetworkFailure(String),

    /// A queued action failed on every allowed attempt.
    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-readable error class sent over the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Forbidden,
    ValidationFailed,
    TransientNetworkFailure,
    RetryExhausted,
    Internal,
}

impl ErrorCode {
    /// Server-side rejections that must never be retried automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorCode::NotFound | ErrorCode::Forbidden | ErrorCode::ValidationFailed
        )
    }
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChatError::NotFound(_) => ErrorCode::NotFound,
            ChatError::Forbidden(_) => ErrorCode::Forbidden,
            ChatError::ValidationFailed(_) => ErrorCode::ValidationFailed,
            ChatError::TransientNetworkFailure(_) => ErrorCode::TransientNetworkFailure,
            ChatError::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            ChatError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Rebuild an error from its wire form.
    pub fn from_code(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::NotFound => ChatError::NotFound(message),
            ErrorCode::Forbidden => ChatError::Forbidden(message),
            ErrorCode::ValidationFailed => ChatError::ValidationFailed(message),
            ErrorCode::TransientNetworkFailure => ChatError::TransientNetworkFailure(message),
            ErrorCode::RetryExhausted => ChatError::RetryExhausted {
                attempts: 0,
                last_error: message,
            },
            ErrorCode::Internal => ChatError::Internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_codes() {
        assert!(ErrorCode::Forbidden.is_terminal());
        assert!(ErrorCode::NotFound.is_terminal());
        assert!(!ErrorCode::TransientNetworkFailure.is_terminal());
        assert!(!ErrorCode::Internal.is_terminal());
    }

    #[test]
    fn test_code_wire_form() {
        let json = serde_json::to_string(&ErrorCode::ValidationFailed).unwrap();
        assert_eq!(json, "\"validation_failed\"");
    }
}
