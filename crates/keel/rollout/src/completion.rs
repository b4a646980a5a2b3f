//! Completion signals
//!
//! With `WaitOnResourceSignals` a batch is not complete until every new unit
//! has reported success from the outside.

use dashmap::DashMap;
use keel_types::InstanceId;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Signal sent by a unit when its own bootstrap finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionSignal {
    Success,
    Failure { reason: String },
}

/// Why waiting on completion signals ended early
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalWaitError {
    Failed { unit: InstanceId, reason: String },
    TimedOut { missing: Vec<InstanceId> },
}

/// Board collecting completion signals per unit
#[derive(Debug, Default)]
pub struct CompletionSignals {
    signals: DashMap<InstanceId, CompletionSignal>,
    notify: Notify,
}

impl CompletionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal_success(&self, unit: &InstanceId) {
        self.record(unit, CompletionSignal::Success);
    }

    pub fn signal_failure(&self, unit: &InstanceId, reason: impl Into<String>) {
        self.record(
            unit,
            CompletionSignal::Failure {
                reason: reason.into(),
            },
        );
    }

    pub fn get(&self, unit: &InstanceId) -> Option<CompletionSignal> {
        self.signals.get(unit).map(|s| s.clone())
    }

    /// Forget a unit's signal once the unit is gone.
    pub fn clear(&self, unit: &InstanceId) {
        self.signals.remove(unit);
    }

    fn record(&self, unit: &InstanceId, signal: CompletionSignal) {
        debug!(unit = %unit, signal = ?signal, "Completion signal received");
        self.signals.insert(unit.clone(), signal);
        self.notify.notify_waiters();
    }

    /// Wait until every unit in `units` signalled success.
    ///
    /// Returns at the first failure signal, or with the units still missing
    /// once `timeout` elapses.
    pub async fn wait_for(
        &self,
        units: &[InstanceId],
        timeout: Duration,
    ) -> Result<(), SignalWaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut missing = Vec::new();
            for unit in units {
                match self.get(unit) {
                    Some(CompletionSignal::Success) => {}
                    Some(CompletionSignal::Failure { reason }) => {
                        return Err(SignalWaitError::Failed {
                            unit: unit.clone(),
                            reason,
                        });
                    }
                    None => missing.push(unit.clone()),
                }
            }
            if missing.is_empty() {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SignalWaitError::TimedOut { missing });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_all_signals() {
        let board = Arc::new(CompletionSignals::new());
        let units = vec![InstanceId::generate(), InstanceId::generate()];
        board.signal_success(&units[0]);

        let waiter = {
            let board = board.clone();
            let units = units.clone();
            tokio::spawn(async move { board.wait_for(&units, Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        board.signal_success(&units[1]);

        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_and_timeout() {
        let board = CompletionSignals::new();
        let units = vec![InstanceId::generate(), InstanceId::generate()];

        assert_eq!(
            board.wait_for(&units, Duration::from_secs(5)).await,
            Err(SignalWaitError::TimedOut {
                missing: units.clone()
            })
        );

        board.signal_failure(&units[1], "bootstrap script exited 1");
        assert!(matches!(
            board.wait_for(&units, Duration::from_secs(5)).await,
            Err(SignalWaitError::Failed { ref unit, .. }) if unit == &units[1]
        ));
    }
}
