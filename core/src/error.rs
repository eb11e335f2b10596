/// Error types for the conversation sync engine
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate message: {message_id}")]
    DuplicateMessage { message_id: Uuid },

    #[error("Change feed disconnected")]
    FeedDisconnected,

    #[error("Send failed: {reason}")]
    SendFailed {
        /// The text the user tried to send, handed back for retry
        content: String,
        reason: String,
    },

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Errors worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Storage(_) | SyncError::FeedDisconnected
        )
    }

    /// Errors the user can act on and therefore should see
    pub fn is_user_actionable(&self) -> bool {
        matches!(self, SyncError::SendFailed { .. } | SyncError::Validation(_))
    }
}

impl From<sled::Error> for SyncError {
    fn from(e: sled::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::Transport("down".into()).is_retryable());
        assert!(SyncError::FeedDisconnected.is_retryable());
        assert!(!SyncError::Validation("empty".into()).is_retryable());

        let failed = SyncError::SendFailed {
            content: "hi".into(),
            reason: "timeout".into(),
        };
        assert!(failed.is_user_actionable());
        assert!(!failed.is_retryable());
        assert!(!SyncError::DuplicateMessage { message_id: Uuid::new_v4() }.is_user_actionable());
    }
}
