//! Per-stack lifecycle state machine

use crate::error::{DeployError, Result};
use keel_types::{DeployEvent, DeployEventEnvelope, StackId, StackState};
use tokio::sync::broadcast;
use tracing::info;

/// Tracks one stack through a deployment run
///
/// Every transition is checked against [`StackState::can_transition_to`]
/// and published as a [`DeployEvent::StackTransition`].
pub struct StackLifecycle {
    stack_id: StackId,
    state: StackState,
    started_from: StackState,
    history: Vec<StackState>,
    events: broadcast::Sender<DeployEventEnvelope>,
}

impl StackLifecycle {
    pub fn new(
        stack_id: StackId,
        state: StackState,
        events: broadcast::Sender<DeployEventEnvelope>,
    ) -> Self {
        Self {
            stack_id,
            state,
            started_from: state,
            history: vec![state],
            events,
        }
    }

    pub fn stack_id(&self) -> &StackId {
        &self.stack_id
    }

    pub fn state(&self) -> StackState {
        self.state
    }

    /// State the run started in.
    pub fn started_from(&self) -> StackState {
        self.started_from
    }

    /// Every state visited, starting with the initial one.
    pub fn history(&self) -> &[StackState] {
        &self.history
    }

    /// Where a declined review sends the stack: back to Deployed if it was
    /// deployed before the run, otherwise Pending.
    pub fn resting_state(&self) -> StackState {
        if self.started_from == StackState::Deployed {
            StackState::Deployed
        } else {
            StackState::Pending
        }
    }

    pub fn transition(&mut self, next: StackState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DeployError::InvalidTransition {
                stack_id: self.stack_id.clone(),
                from: self.state,
                to: next,
            });
        }
        let from = self.state;
        self.state = next;
        self.history.push(next);
        info!(stack_id = %self.stack_id, from = %from, to = %next, "Stack transition");
        let _ = self.events.send(DeployEventEnvelope::new(DeployEvent::StackTransition {
            stack_id: self.stack_id.clone(),
            from,
            to: next,
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_checked_and_published() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut lifecycle = StackLifecycle::new(StackId::new("app"), StackState::Pending, tx);

        lifecycle.transition(StackState::Planning).unwrap();
        let err = lifecycle.transition(StackState::Applying).unwrap_err();
        assert!(matches!(
            err,
            DeployError::InvalidTransition {
                from: StackState::Planning,
                to: StackState::Applying,
                ..
            }
        ));
        assert_eq!(lifecycle.state(), StackState::Planning);
        assert_eq!(lifecycle.history(), &[StackState::Pending, StackState::Planning]);

        let envelope = rx.try_recv().unwrap();
        assert!(matches!(
            envelope.event,
            DeployEvent::StackTransition {
                to: StackState::Planning,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_resting_state_follows_start() {
        let (tx, _rx) = broadcast::channel(4);
        let deployed = StackLifecycle::new(StackId::new("a"), StackState::Deployed, tx.clone());
        assert_eq!(deployed.resting_state(), StackState::Deployed);
        let failed = StackLifecycle::new(StackId::new("b"), StackState::Failed, tx);
        assert_eq!(failed.resting_state(), StackState::Pending);
    }
}
