use thiserror::Error;

use crate::TableId;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Not authorized to access table {0}")]
    Unauthorized(TableId),

    #[error("Invalid mutation: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Structural changes are blocked while the active view has unsaved changes")]
    ViewDirty,

    #[error("Submission declined")]
    Declined,

    #[error("Operation timed out")]
    Timeout,

    #[error("Mutation queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GridError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Errors that can never succeed on a later attempt and are rejected at submission.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized(_) | Self::InvalidInput(_) | Self::ViewDirty | Self::Declined
        )
    }
}
