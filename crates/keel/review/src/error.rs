//! Review error types

use keel_types::StackId;
use std::time::Duration;
use thiserror::Error;

/// Review and approval errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReviewError {
    #[error("no decision on change set {fingerprint} for stack {stack_id} within {waited:?}")]
    ApprovalTimedOut {
        stack_id: StackId,
        fingerprint: String,
        waited: Duration,
    },

    #[error("approval gate '{gate}' failed: {reason}")]
    Gate { gate: String, reason: String },
}

/// Result type for review operations
pub type Result<T> = std::result::Result<T, ReviewError>;
