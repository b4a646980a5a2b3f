//! Event types for Keel observability
//!
//! Events provide a unified stream of stack and rollout lifecycle activity.

use crate::{ExportName, InstanceId, LaunchVersion, ResourceId, StackId, StackState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all Keel events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployEventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Event source
    pub source: EventSource,

    /// Event severity
    pub severity: EventSeverity,

    /// The actual event
    pub event: DeployEvent,
}

impl DeployEventEnvelope {
    pub fn new(event: DeployEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            source: event.source(),
            severity: event.severity(),
            event,
        }
    }
}

/// Event sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    /// Stack deployer
    Deployer,
    /// Change set review
    Review,
    /// Rolling update controller
    Rollout,
    /// Export registry
    Registry,
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// Keel events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeployEvent {
    /// Stack moved between lifecycle states
    StackTransition {
        stack_id: StackId,
        from: StackState,
        to: StackState,
    },

    /// A change set was computed for a stack
    ChangeSetComputed {
        stack_id: StackId,
        fingerprint: String,
        items: usize,
        risky: usize,
    },

    /// A stack published its exports
    ExportsPublished {
        stack_id: StackId,
        exports: Vec<ExportName>,
    },

    /// A rolling update batch launched new units
    BatchStarted {
        stack_id: StackId,
        group_id: ResourceId,
        batch: u32,
        size: u32,
        target_version: LaunchVersion,
    },

    /// A batch's replacements were verified and old units terminated
    BatchCompleted {
        stack_id: StackId,
        group_id: ResourceId,
        batch: u32,
        in_service: u32,
    },

    /// A batch did not complete
    BatchFailed {
        stack_id: StackId,
        group_id: ResourceId,
        batch: u32,
        units: Vec<InstanceId>,
        reason: String,
    },

    /// A stack was removed
    StackTornDown { stack_id: StackId },
}

impl DeployEvent {
    pub fn source(&self) -> EventSource {
        match self {
            DeployEvent::StackTransition { .. } | DeployEvent::StackTornDown { .. } => {
                EventSource::Deployer
            }
            DeployEvent::ChangeSetComputed { .. } => EventSource::Review,
            DeployEvent::ExportsPublished { .. } => EventSource::Registry,
            DeployEvent::BatchStarted { .. }
            | DeployEvent::BatchCompleted { .. }
            | DeployEvent::BatchFailed { .. } => EventSource::Rollout,
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            DeployEvent::BatchFailed { .. } => EventSeverity::Error,
            DeployEvent::StackTransition { to, .. } => match to {
                StackState::Failed => EventSeverity::Error,
                StackState::RollingBack => EventSeverity::Warning,
                _ => EventSeverity::Info,
            },
            DeployEvent::ChangeSetComputed { risky, .. } if *risky > 0 => EventSeverity::Warning,
            _ => EventSeverity::Info,
        }
    }
}

impl std::fmt::Display for DeployEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployEvent::StackTransition { stack_id, from, to } => {
                write!(f, "{}: {} -> {}", stack_id, from, to)
            }
            DeployEvent::ChangeSetComputed {
                stack_id,
                fingerprint,
                items,
                risky,
            } => write!(
                f,
                "{}: change set {} ({} changes, {} risky)",
                stack_id,
                &fingerprint[..fingerprint.len().min(12)],
                items,
                risky
            ),
            DeployEvent::ExportsPublished { stack_id, exports } => {
                write!(f, "{}: published {} exports", stack_id, exports.len())
            }
            DeployEvent::BatchStarted {
                stack_id,
                group_id,
                batch,
                size,
                target_version,
            } => write!(
                f,
                "{}/{}: batch {} launching {} units at {}",
                stack_id, group_id, batch, size, target_version
            ),
            DeployEvent::BatchCompleted {
                stack_id,
                group_id,
                batch,
                in_service,
            } => write!(
                f,
                "{}/{}: batch {} complete, {} in service",
                stack_id, group_id, batch, in_service
            ),
            DeployEvent::BatchFailed {
                stack_id,
                group_id,
                batch,
                reason,
                ..
            } => write!(f, "{}/{}: batch {} failed: {}", stack_id, group_id, batch, reason),
            DeployEvent::StackTornDown { stack_id } => write!(f, "{}: torn down", stack_id),
        }
    }
}
