//! Rolling update policy
//!
//! Governs how a capacity group is moved from one launch version to the next
//! while keeping a floor of in-service units.

use crate::capacity::ElbHealthCheck;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Batched replacement settings for a capacity group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RollingUpdatePolicy {
    /// Units that must stay in service at every instant of the update
    #[serde(rename = "MinInstancesInService")]
    pub min_in_service: u32,

    /// Upper bound on units replaced per batch
    pub max_batch_size: u32,

    /// Hold time between draining old units and terminating them
    #[serde(with = "crate::duration_serde")]
    pub pause_time: Duration,

    /// Require an external completion signal for every new unit
    #[serde(default, rename = "WaitOnResourceSignals")]
    pub wait_on_signals: bool,

    /// Maximum wait for completion signals before the batch fails
    #[serde(default, with = "crate::duration_serde::option")]
    pub signal_timeout: Option<Duration>,
}

/// Reasons a rolling update policy cannot be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("MaxBatchSize must be at least 1")]
    ZeroBatchSize,

    #[error("MinInstancesInService ({min_in_service}) must be below desired capacity ({desired})")]
    NoHeadroom { min_in_service: u32, desired: u32 },

    #[error(
        "MinInstancesInService is 0 and MaxBatchSize ({max_batch_size}) covers the whole group \
         ({desired}); the update would drop all serving capacity"
    )]
    WouldDropAllCapacity { max_batch_size: u32, desired: u32 },

    #[error("WaitOnResourceSignals is set but no SignalTimeout is configured")]
    MissingSignalTimeout,
}

impl RollingUpdatePolicy {
    pub fn new(min_in_service: u32, max_batch_size: u32, pause_time: Duration) -> Self {
        Self {
            min_in_service,
            max_batch_size,
            pause_time,
            wait_on_signals: false,
            signal_timeout: None,
        }
    }

    /// Require completion signals, failing a batch after `timeout`.
    pub fn with_signals(mut self, timeout: Duration) -> Self {
        self.wait_on_signals = true;
        self.signal_timeout = Some(timeout);
        self
    }

    /// Check the policy against the group's desired capacity.
    pub fn validate(&self, desired: u32) -> Result<(), PolicyError> {
        if self.max_batch_size == 0 {
            return Err(PolicyError::ZeroBatchSize);
        }
        if self.min_in_service >= desired {
            return Err(PolicyError::NoHeadroom {
                min_in_service: self.min_in_service,
                desired,
            });
        }
        if self.min_in_service == 0 && self.max_batch_size >= desired {
            return Err(PolicyError::WouldDropAllCapacity {
                max_batch_size: self.max_batch_size,
                desired,
            });
        }
        if self.wait_on_signals && self.signal_timeout.is_none() {
            return Err(PolicyError::MissingSignalTimeout);
        }
        Ok(())
    }

    /// Batch size for the next step, given how many units still run the old version.
    pub fn batch_size(&self, total: u32, remaining_old: u32) -> u32 {
        self.max_batch_size
            .min(total.saturating_sub(self.min_in_service))
            .min(remaining_old)
    }

    /// Whether the pause is shorter than the load balancer needs to notice a
    /// failing unit. Such a pause can observe a stale Healthy verdict and walk
    /// into repeated replacement.
    pub fn is_mistuned(&self, elb: &ElbHealthCheck) -> bool {
        self.pause_time < elb.failure_detection_window()
    }
}
