//! Error types for keel-state.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or saving persisted state.
#[derive(Debug, Error)]
pub enum StateError {
    /// Filesystem failure.
    #[error("state I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// State could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted document exists but cannot be trusted.
    #[error("corrupt state at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Stack id that cannot be used as a storage key.
    #[error("stack id '{0}' cannot be stored: only letters, digits, '-', '_' and '.' are allowed")]
    InvalidKey(String),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, StateError>;
