//! Deployment reports

use crate::error::DeployError;
use keel_rollout::RolloutReport;
use keel_types::{ExportName, StackId, StackState};
use serde::Serialize;
use std::time::Duration;

/// How a stack's run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutcomeStatus {
    /// Change set applied and settled
    Deployed,
    /// Empty change set; exports refreshed only
    Unchanged,
    /// Review declined or never decided
    Rejected,
    /// Update failed and the last deployed declaration was restored
    RolledBack,
    /// Update failed with nothing to restore, the restore failed, or the
    /// run was cancelled
    Failed,
    /// Not attempted because an earlier wave failed
    Skipped,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutcomeStatus::Deployed => "deployed",
            OutcomeStatus::Unchanged => "unchanged",
            OutcomeStatus::Rejected => "rejected",
            OutcomeStatus::RolledBack => "rolled back",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Result of one stack's run
#[derive(Debug)]
pub struct StackOutcome {
    pub stack_id: StackId,
    pub status: OutcomeStatus,
    /// Resting state the stack ended in
    pub state: StackState,
    pub fingerprint: Option<String>,
    pub changes: usize,
    pub risky: usize,
    pub rollouts: Vec<RolloutReport>,
    pub error: Option<DeployError>,
}

impl StackOutcome {
    pub fn new(stack_id: StackId, state: StackState) -> Self {
        Self {
            stack_id,
            status: OutcomeStatus::Failed,
            state,
            fingerprint: None,
            changes: 0,
            risky: 0,
            rollouts: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn skipped(stack_id: StackId, state: StackState) -> Self {
        Self {
            status: OutcomeStatus::Skipped,
            ..Self::new(stack_id, state)
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
            && matches!(self.status, OutcomeStatus::Deployed | OutcomeStatus::Unchanged)
    }
}

/// Result of a whole deployment run, in build order
#[derive(Debug, Default)]
pub struct DeployReport {
    pub outcomes: Vec<StackOutcome>,
    pub elapsed: Duration,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.is_success())
    }

    pub fn outcome(&self, stack: &StackId) -> Option<&StackOutcome> {
        self.outcomes.iter().find(|o| &o.stack_id == stack)
    }

    /// The first failure in build order.
    pub fn first_error(&self) -> Option<&DeployError> {
        self.outcomes.iter().find_map(|o| o.error.as_ref())
    }

    pub fn exit_code(&self) -> i32 {
        self.first_error().map(|e| e.exit_code()).unwrap_or(0)
    }
}

/// Result of a teardown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Stacks removed, in teardown order
    pub removed: Vec<StackId>,
    pub exports_retired: Vec<ExportName>,
    pub units_terminated: u32,
}
