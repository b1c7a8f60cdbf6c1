//! Error types for confab-billing

use thiserror::Error;

/// Result type alias using confab-billing Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ledger operations
///
/// Shortfalls and unknown models are not errors; they are reported in the
/// returned values instead.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller does not own the record it tried to change
    #[error("User {user_id} is not allowed to modify {resource}")]
    Unauthorized { user_id: String, resource: String },

    /// A referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backing store failed
    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    /// Create an authorization error
    pub fn unauthorized(user_id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::Unauthorized {
            user_id: user_id.into(),
            resource: resource.into(),
        }
    }

    /// Check if this error should reject the operation outright
    pub fn is_authorization(&self) -> bool {
        matches!(self, Error::Unauthorized { .. })
    }
}
