//! Error types for LumaDB
//!
//! Provides a unified error type hierarchy for the data-handle layer.

use thiserror::Error;

/// Result type alias using LumaDB's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for LumaDB
#[derive(Error, Debug)]
pub enum Error {
    // Handle Errors
    #[error("Handle error: {0}")]
    Handle(#[from] HandleError),

    // Data Source Errors
    #[error("Data source error: {0}")]
    DataSource(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal Errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Data handle acquisition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// Exclusive access could not be granted without waiting.
    #[error("Handle busy: {0}")]
    Busy(String),

    /// The handle is being torn down; resolve the name again.
    #[error("Handle is dead: {0}")]
    Dead(String),

    /// The object behind the handle was dropped and cannot be reopened.
    #[error("Handle was dropped: {0}")]
    Dropped(String),

    #[error("Handle is protected: {0}")]
    Protected(String),

    #[error("Failed to open {name}: {reason}")]
    OpenFailed { name: String, reason: String },
}

impl Error {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Handle(HandleError::Busy(_)) | Error::Io(_))
    }

    /// Returns the handle error, if this is one
    #[must_use]
    pub fn as_handle_error(&self) -> Option<&HandleError> {
        match self {
            Error::Handle(e) => Some(e),
            _ => None,
        }
    }

    /// Get a stable numeric error code
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Error::Handle(HandleError::Busy(_)) => 1,
            Error::Handle(HandleError::Dead(_)) => 2,
            Error::Handle(HandleError::Dropped(_)) => 3,
            Error::Handle(HandleError::Protected(_)) => 4,
            Error::Handle(HandleError::OpenFailed { .. }) => 5,
            Error::DataSource(_) => 10,
            Error::Config(_) => 17,
            Error::Io(_) => 20,
            Error::Serialization(_) => 21,
            Error::Internal(_) => 99,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(format!("Failed to parse TOML config: {e}"))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(format!("Failed to parse YAML config: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_retryable() {
        let err: Error = HandleError::Busy("table:foo".to_string()).into();
        assert!(err.is_retryable());
        assert_eq!(err.code(), 1);
        assert_eq!(err.to_string(), "Handle error: Handle busy: table:foo");
    }

    #[test]
    fn test_dead_and_dropped_are_distinct() {
        let dead: Error = HandleError::Dead("file:a".to_string()).into();
        let dropped: Error = HandleError::Dropped("file:a".to_string()).into();
        assert!(!dead.is_retryable());
        assert!(!dropped.is_retryable());
        assert_ne!(dead.code(), dropped.code());
        assert_eq!(
            dropped.as_handle_error(),
            Some(&HandleError::Dropped("file:a".to_string()))
        );
    }
}
