//! Rollout error types

use keel_health::HealthError;
use keel_types::{InstanceId, PolicyError, ResourceId};
use std::time::Duration;
use thiserror::Error;

/// Rolling update errors
///
/// Every batch-level failure names the group, the batch and the units
/// involved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RolloutError {
    #[error("capacity group {group}: invalid update policy: {source}")]
    InvalidPolicy {
        group: ResourceId,
        #[source]
        source: PolicyError,
    },

    #[error("invalid rollout timings: {0}")]
    InvalidTimings(String),

    #[error(
        "capacity group {group}: {live} live units leave no headroom above MinInstancesInService {min_in_service}"
    )]
    InsufficientCapacity {
        group: ResourceId,
        live: u32,
        min_in_service: u32,
    },

    #[error(
        "capacity group {group}: batch {batch} not healthy after {polls} polls ({waited:?}); waiting on {}",
        format_units(.units)
    )]
    BatchTimeout {
        group: ResourceId,
        batch: u32,
        units: Vec<InstanceId>,
        polls: u32,
        waited: Duration,
    },

    #[error("capacity group {group}: batch {batch}: replacement {unit} is unhealthy after grace: {reason}")]
    UnhealthyReplacement {
        group: ResourceId,
        batch: u32,
        unit: InstanceId,
        reason: String,
    },

    #[error("capacity group {group}: batch {batch}: {unit} signalled failure: {reason}")]
    SignalFailure {
        group: ResourceId,
        batch: u32,
        unit: InstanceId,
        reason: String,
    },

    #[error(
        "capacity group {group}: batch {batch}: no completion signal within {waited:?} from {}",
        format_units(.units)
    )]
    SignalTimeout {
        group: ResourceId,
        batch: u32,
        units: Vec<InstanceId>,
        waited: Duration,
    },

    #[error(
        "capacity group {group}: halted at batch {batch}: verified units turned unhealthy: {}",
        format_units(.units)
    )]
    Oscillation {
        group: ResourceId,
        batch: u32,
        units: Vec<InstanceId>,
    },

    #[error("capacity group {group}: cancelled after {completed_batches} completed batches")]
    Cancelled {
        group: ResourceId,
        completed_batches: u32,
    },

    #[error("capacity group {group}: launcher failed: {reason}")]
    Launch { group: ResourceId, reason: String },

    #[error(transparent)]
    Health(#[from] HealthError),
}

impl RolloutError {
    /// Batch the failure happened in, if it is batch-scoped.
    pub fn batch(&self) -> Option<u32> {
        match self {
            RolloutError::BatchTimeout { batch, .. }
            | RolloutError::UnhealthyReplacement { batch, .. }
            | RolloutError::SignalFailure { batch, .. }
            | RolloutError::SignalTimeout { batch, .. }
            | RolloutError::Oscillation { batch, .. } => Some(*batch),
            _ => None,
        }
    }

    /// Units the failure names.
    pub fn units(&self) -> Vec<InstanceId> {
        match self {
            RolloutError::BatchTimeout { units, .. }
            | RolloutError::SignalTimeout { units, .. }
            | RolloutError::Oscillation { units, .. } => units.clone(),
            RolloutError::UnhealthyReplacement { unit, .. }
            | RolloutError::SignalFailure { unit, .. } => vec![unit.clone()],
            _ => Vec::new(),
        }
    }
}

fn format_units(units: &[InstanceId]) -> String {
    units
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for rollout operations
pub type Result<T> = std::result::Result<T, RolloutError>;
