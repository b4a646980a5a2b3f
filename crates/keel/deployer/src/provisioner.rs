//! Provisioning seam
//!
//! The provisioner applies resource-level changes. Keel decides when and in
//! which order; the provisioner only accepts or refuses.

use crate::error::{DeployError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use keel_review::ChangeSet;
use keel_types::{StackId, StackSpec};
use tracing::debug;

/// Applies declarations to the underlying infrastructure
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Apply `change_set` to bring the stack to `desired`.
    ///
    /// A refusal is reported as [`DeployError::ApplyRejected`].
    async fn apply(&self, desired: &StackSpec, change_set: &ChangeSet) -> Result<()>;

    /// Re-apply the last deployed declaration after a failed update.
    async fn rollback(&self, last_deployed: &StackSpec) -> Result<()>;

    /// Delete everything the stack provisioned.
    async fn destroy(&self, stack: &StackId) -> Result<()>;

    fn name(&self) -> &str;
}

/// Provisioner that accepts everything except stacks it was told to refuse
#[derive(Debug, Default)]
pub struct SimulatedProvisioner {
    refusals: DashMap<StackId, String>,
    failing_rollbacks: DashMap<StackId, String>,
    applied: DashMap<StackId, u32>,
    rolled_back: DashMap<StackId, u32>,
    destroyed: DashMap<StackId, u32>,
}

impl SimulatedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every apply for `stack`.
    pub fn refuse(&self, stack: impl Into<StackId>, reason: impl Into<String>) {
        self.refusals.insert(stack.into(), reason.into());
    }

    /// Fail every rollback for `stack`.
    pub fn fail_rollbacks(&self, stack: impl Into<StackId>, reason: impl Into<String>) {
        self.failing_rollbacks.insert(stack.into(), reason.into());
    }

    pub fn allow(&self, stack: &StackId) {
        self.refusals.remove(stack);
        self.failing_rollbacks.remove(stack);
    }

    pub fn applied(&self, stack: &StackId) -> u32 {
        self.applied.get(stack).map(|n| *n).unwrap_or(0)
    }

    pub fn rolled_back(&self, stack: &StackId) -> u32 {
        self.rolled_back.get(stack).map(|n| *n).unwrap_or(0)
    }

    pub fn destroyed(&self, stack: &StackId) -> u32 {
        self.destroyed.get(stack).map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    async fn apply(&self, desired: &StackSpec, change_set: &ChangeSet) -> Result<()> {
        if let Some(reason) = self.refusals.get(&desired.id) {
            return Err(DeployError::ApplyRejected {
                stack_id: desired.id.clone(),
                reason: reason.clone(),
            });
        }
        debug!(stack_id = %desired.id, items = change_set.len(), "Change set applied");
        *self.applied.entry(desired.id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn rollback(&self, last_deployed: &StackSpec) -> Result<()> {
        if let Some(reason) = self.failing_rollbacks.get(&last_deployed.id) {
            return Err(DeployError::Provisioner {
                stack_id: last_deployed.id.clone(),
                operation: "roll back",
                reason: reason.clone(),
            });
        }
        *self.rolled_back.entry(last_deployed.id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn destroy(&self, stack: &StackId) -> Result<()> {
        *self.destroyed.entry(stack.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
