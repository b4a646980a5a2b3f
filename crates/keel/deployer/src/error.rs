//! Deployment error types

use keel_graph::GraphError;
use keel_registry::RegistryError;
use keel_review::ReviewError;
use keel_rollout::RolloutError;
use keel_state::StateError;
use keel_types::{ExportName, ResourceId, StackId, StackState};
use serde::Serialize;
use thiserror::Error;

/// A foreign lock that keeps a stack from being torn down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownBlocker {
    pub stack_id: StackId,
    pub export: ExportName,
    pub consumer: StackId,
}

impl std::fmt::Display for TeardownBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "export '{}' of {} is imported by {}",
            self.export, self.stack_id, self.consumer
        )
    }
}

/// Deployment errors
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("stack {stack_id}: change set {fingerprint} rejected at review: {reason}")]
    ReviewRejected {
        stack_id: StackId,
        fingerprint: String,
        reason: String,
    },

    #[error("stack {stack_id}: review did not complete: {source}")]
    Review {
        stack_id: StackId,
        #[source]
        source: ReviewError,
    },

    #[error("stack {stack_id}: provisioning refused the change while Applying: {reason}")]
    ApplyRejected { stack_id: StackId, reason: String },

    #[error("stack {stack_id}: rolling update of {group} failed while Settling: {source}")]
    RollingUpdate {
        stack_id: StackId,
        group: ResourceId,
        #[source]
        source: RolloutError,
    },

    #[error("teardown blocked: {}", format_blockers(.blockers))]
    TeardownBlocked { blockers: Vec<TeardownBlocker> },

    #[error("stack {stack_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        stack_id: StackId,
        from: StackState,
        to: StackState,
    },

    #[error("stack {0} is not part of the stack set")]
    UnknownStack(StackId),

    #[error("stack {stack_id}: provisioner failed to {operation}: {reason}")]
    Provisioner {
        stack_id: StackId,
        operation: &'static str,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl DeployError {
    /// Process exit code for this failure class.
    ///
    /// | code | class                                   |
    /// |------|-----------------------------------------|
    /// | 2    | dependency (graph or registry)          |
    /// | 3    | review rejected or not decided          |
    /// | 4    | apply rejected by provisioning          |
    /// | 5    | rolling update failure                  |
    /// | 6    | teardown blocked by foreign consumers   |
    /// | 1    | anything else                           |
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::Graph(_) | DeployError::Registry(_) => 2,
            DeployError::ReviewRejected { .. } | DeployError::Review { .. } => 3,
            DeployError::ApplyRejected { .. } => 4,
            DeployError::RollingUpdate { .. } => 5,
            DeployError::TeardownBlocked { .. } => 6,
            _ => 1,
        }
    }

    /// Whether the run stopped because cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            DeployError::RollingUpdate {
                source: RolloutError::Cancelled { .. },
                ..
            }
        )
    }

    /// Stack the failure belongs to, when it is stack-scoped.
    pub fn stack_id(&self) -> Option<&StackId> {
        match self {
            DeployError::ReviewRejected { stack_id, .. }
            | DeployError::Review { stack_id, .. }
            | DeployError::ApplyRejected { stack_id, .. }
            | DeployError::RollingUpdate { stack_id, .. }
            | DeployError::InvalidTransition { stack_id, .. }
            | DeployError::Provisioner { stack_id, .. } => Some(stack_id),
            DeployError::UnknownStack(stack_id) => Some(stack_id),
            _ => None,
        }
    }
}

fn format_blockers(blockers: &[TeardownBlocker]) -> String {
    blockers
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for deployment operations
pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::InstanceId;
    use std::time::Duration;

    #[test]
    fn test_exit_codes_by_failure_class() {
        let cycle = DeployError::Graph(GraphError::Cycle {
            chain: vec![StackId::new("a"), StackId::new("b"), StackId::new("a")],
        });
        assert_eq!(cycle.exit_code(), 2);

        let unknown = DeployError::Registry(RegistryError::UnknownExport(ExportName::new("x")));
        assert_eq!(unknown.exit_code(), 2);

        let rejected = DeployError::ReviewRejected {
            stack_id: StackId::new("app"),
            fingerprint: "abc".into(),
            reason: "no".into(),
        };
        assert_eq!(rejected.exit_code(), 3);

        let apply = DeployError::ApplyRejected {
            stack_id: StackId::new("app"),
            reason: "quota".into(),
        };
        assert_eq!(apply.exit_code(), 4);

        let rolling = DeployError::RollingUpdate {
            stack_id: StackId::new("app"),
            group: ResourceId::new("web"),
            source: RolloutError::BatchTimeout {
                group: ResourceId::new("web"),
                batch: 2,
                units: vec![InstanceId::generate()],
                polls: 10,
                waited: Duration::from_secs(60),
            },
        };
        assert_eq!(rolling.exit_code(), 5);
        assert!(!rolling.is_cancelled());
        let message = rolling.to_string();
        assert!(message.contains("app") && message.contains("web") && message.contains("batch 2"));

        let blocked = DeployError::TeardownBlocked {
            blockers: vec![TeardownBlocker {
                stack_id: StackId::new("network"),
                export: ExportName::new("vpc-id"),
                consumer: StackId::new("app"),
            }],
        };
        assert_eq!(blocked.exit_code(), 6);
        assert!(blocked.to_string().contains("vpc-id"));

        assert_eq!(DeployError::Config("missing".into()).exit_code(), 1);
    }

    #[test]
    fn test_cancelled_rollout_is_recognised() {
        let cancelled = DeployError::RollingUpdate {
            stack_id: StackId::new("app"),
            group: ResourceId::new("web"),
            source: RolloutError::Cancelled {
                group: ResourceId::new("web"),
                completed_batches: 1,
            },
        };
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.exit_code(), 5);
        assert!(!DeployError::Config("missing".into()).is_cancelled());
    }
}
