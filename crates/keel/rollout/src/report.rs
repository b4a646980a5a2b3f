//! Rollout reports

use keel_types::{InstanceId, LaunchVersion, ResourceId};
use serde::{Deserialize, Serialize};

/// One completed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub number: u32,
    pub size: u32,
    pub launched: Vec<InstanceId>,
    pub terminated: Vec<InstanceId>,
    /// Health polls used before the batch was verified
    pub polls: u32,
}

/// Outcome of a rollout or provisioning run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutReport {
    pub group: ResourceId,
    pub target: LaunchVersion,
    pub batches: Vec<BatchRecord>,
    /// InService count after every state change, starting before the first
    pub in_service_samples: Vec<u32>,
    /// PauseTime shorter than the load balancer's failure detection window
    pub mistuned: bool,
}

impl RolloutReport {
    pub fn new(group: ResourceId, target: LaunchVersion) -> Self {
        Self {
            group,
            target,
            batches: Vec::new(),
            in_service_samples: Vec::new(),
            mistuned: false,
        }
    }

    pub fn min_in_service(&self) -> Option<u32> {
        self.in_service_samples.iter().copied().min()
    }

    pub fn units_replaced(&self) -> usize {
        self.batches.iter().map(|b| b.terminated.len()).sum()
    }
}
