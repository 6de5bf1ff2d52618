//! Error types for the Turnstile admission controller.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The caller cancelled the request context
    #[error("context cancelled")]
    Cancelled,

    /// The request context deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error came from the caller's context rather than from Turnstile itself.
    pub fn is_context_error(&self) -> bool {
        matches!(self, TurnstileError::Cancelled | TurnstileError::DeadlineExceeded)
    }
}

impl From<::config::ConfigError> for TurnstileError {
    fn from(err: ::config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_errors() {
        assert!(TurnstileError::Cancelled.is_context_error());
        assert!(TurnstileError::DeadlineExceeded.is_context_error());
        assert!(!TurnstileError::Config("bad".to_string()).is_context_error());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(TurnstileError::Cancelled.to_string(), "context cancelled");
        assert_eq!(
            TurnstileError::Config("missing field".to_string()).to_string(),
            "Configuration error: missing field"
        );
    }
}
