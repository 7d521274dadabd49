//! Error types for the Block Tutor relay.
//!
//! [`ServerError`] covers configuration, startup and the rate-limit store.
//! Per-request failures are turned into HTTP responses in [`crate::api`].

use std::path::PathBuf;

/// A specialized `Result` type for relay operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that can occur while configuring or running the relay.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// The config file could not be read or is not valid JSON.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your block-tutor.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    /// A required secret is not set.
    #[error("Missing secret: {name} is not set\n\nSuggestion: Export {name} or add it to a .env file next to the binary")]
    MissingSecret {
        /// Name of the environment variable.
        name: String,
    },

    // ========================================================================
    // Rate Limiter Errors
    // ========================================================================
    /// The rate-limit store could not be reached or answered unexpectedly.
    #[error("Rate limiter unavailable: {message}")]
    RateLimiterUnavailable {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // General Errors
    // ========================================================================
    /// Chat provider client could not be created.
    #[error("Chat client error: {0}")]
    Llm(#[from] tutor_llm::LlmError),

    /// General I/O error (binding the listener, serving).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `MissingSecret` error.
    #[must_use]
    pub fn missing_secret(name: impl Into<String>) -> Self {
        Self::MissingSecret { name: name.into() }
    }

    /// Creates a new `RateLimiterUnavailable` error.
    #[must_use]
    pub fn rate_limiter(message: impl Into<String>) -> Self {
        Self::RateLimiterUnavailable {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = ServerError::config_parse("/etc/block-tutor.json", "expected value");
        let msg = err.to_string();
        assert!(msg.contains("Invalid JSON"));
        assert!(msg.contains("/etc/block-tutor.json"));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_missing_secret_names_variable() {
        let err = ServerError::missing_secret("OPENAI_API_KEY");
        assert!(err.to_string().contains("OPENAI_API_KEY is not set"));
    }

    #[test]
    fn test_from_llm_error() {
        let err: ServerError = tutor_llm::LlmError::MissingApiKey.into();
        assert!(matches!(err, ServerError::Llm(_)));
        assert!(err.to_string().contains("missing API key"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err: ServerError = io_err.into();
        assert!(matches!(err, ServerError::Io(_)));
    }
}
