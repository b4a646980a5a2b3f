//! CLI error types

use keel_deployer::DeployError;
use keel_state::StateError;
use std::path::PathBuf;
use thiserror::Error;

/// CLI error types
#[derive(Debug, Error)]
pub enum CliError {
    /// Deployment failure
    #[error(transparent)]
    Deploy(#[from] DeployError),

    /// State store failure
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stack set file could not be read or parsed
    #[error("Stack set {}: {reason}", .path.display())]
    StackSet { path: PathBuf, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CliError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Deploy(err) => err.exit_code(),
            _ => 1,
        }
    }
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
