//! Error types for Genie.
//!
//! One error enum covers the whole tool: configuration and startup faults,
//! session lifecycle conflicts, wire codec failures, and transport I/O.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Genie library.
#[derive(Debug, Error)]
pub enum GenieError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("no transport backend configured")]
    TransportUnconfigured,

    #[error("session already exists: {id}")]
    SessionExists { id: String },

    #[error("session does not exist: {id}")]
    NoSession { id: String },

    #[error("Decode error: {message}")]
    Decode {
        message: String,
        #[source]
        source: Option<serde_yaml::Error>,
    },

    #[error("unsupported: {message}")]
    Unsupported { message: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for Genie operations.
pub type Result<T> = std::result::Result<T, GenieError>;

impl From<std::io::Error> for GenieError {
    fn from(err: std::io::Error) -> Self {
        GenieError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_yaml::Error> for GenieError {
    fn from(err: serde_yaml::Error) -> Self {
        GenieError::Decode {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl GenieError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        GenieError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a configuration error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        GenieError::Config {
            message: message.into(),
        }
    }
}
