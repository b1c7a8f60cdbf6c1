//! Error types for confab-core

use thiserror::Error;

/// Result type alias using confab-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading a response stream
#[derive(Error, Debug)]
pub enum Error {
    /// Reading from the underlying transport failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The provider reported an error inside the stream
    #[error("Stream error: {0}")]
    Stream(String),
}

impl Error {
    /// Check if this error came from the transport rather than the provider
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_is_transport() {
        let e = Error::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(e.is_transport());
    }

    #[test]
    fn test_stream_is_not_transport() {
        assert!(!Error::Stream("overloaded".into()).is_transport());
    }

    #[test]
    fn test_display() {
        let e = Error::Stream("model refused".into());
        assert_eq!(e.to_string(), "Stream error: model refused");
    }
}
