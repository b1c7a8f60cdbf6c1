//! Error types for confab-chat

use thiserror::Error;

/// Result type alias using confab-chat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running or persisting a turn
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the stream layer
    #[error(transparent)]
    Core(#[from] confab_core::Error),

    /// An error from the billing layer
    #[error(transparent)]
    Billing(#[from] confab_billing::Error),

    /// The conversation belongs to another user
    #[error("User {user_id} does not own conversation {conversation_id}")]
    Forbidden {
        user_id: String,
        conversation_id: String,
    },

    /// A referenced message does not exist
    #[error("Message not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Create an ownership error
    pub fn forbidden(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self::Forbidden {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
        }
    }

    /// Check if this error is an ownership/authorization rejection
    pub fn is_authorization(&self) -> bool {
        match self {
            Error::Forbidden { .. } => true,
            Error::Billing(e) => e.is_authorization(),
            _ => false,
        }
    }
}
