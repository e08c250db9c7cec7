//! Error types for strata operations.
//!
//! Failures split into two families: configuration errors, which are
//! caller mistakes and never worth retrying, and storage errors, which
//! surface from the backing database and may be transient.

use thiserror::Error;

/// Result type alias for strata operations.
pub type StrataResult<T> = Result<T, StrataError>;

/// Main error type for all strata operations.
#[derive(Error, Debug)]
pub enum StrataError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backing store operation failed.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StrataError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a storage error with no underlying source.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Whether retrying the failed operation could succeed.
    ///
    /// Configuration and serialization errors are deterministic; only
    /// store and IO failures can be transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Io(_))
    }
}

impl From<rusqlite::Error> for StrataError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
