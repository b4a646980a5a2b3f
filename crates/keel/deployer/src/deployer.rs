//! Single-stack deployment

use crate::error::{DeployError, Result};
use crate::lifecycle::StackLifecycle;
use crate::provisioner::Provisioner;
use crate::report::{OutcomeStatus, StackOutcome};
use keel_registry::ExportRegistry;
use keel_review::{ApprovalDecision, ApprovalGate, ChangeSet, ChangeSetReviewer};
use keel_rollout::RollingUpdateController;
use keel_state::{StackSnapshot, StateStore};
use keel_types::{
    CapacityGroup, CapacityGroupSpec, DeployEvent, DeployEventEnvelope, ExportName, StackId,
    StackSpec, StackState,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

/// Drives one stack through its lifecycle
///
/// Shared by every stack task of a run; all state lives in the registry,
/// the state store and the per-run [`StackLifecycle`].
pub struct StackDeployer {
    pub(crate) registry: Arc<ExportRegistry>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) provisioner: Arc<dyn Provisioner>,
    pub(crate) gate: Arc<dyn ApprovalGate>,
    pub(crate) rollout: Arc<RollingUpdateController>,
    pub(crate) reviewer: ChangeSetReviewer,
    pub(crate) events: broadcast::Sender<DeployEventEnvelope>,
    pub(crate) cancel: watch::Receiver<bool>,
    /// Held from registry snapshot to the end of its write
    pub(crate) registry_write: Mutex<()>,
}

impl StackDeployer {
    /// Compute the change set for `spec` against its last deployed
    /// declaration.
    pub async fn plan(&self, spec: &StackSpec) -> Result<ChangeSet> {
        let snapshot = self.store.load_stack(&spec.id).await?;
        let current = snapshot.as_ref().and_then(|s| s.last_deployed.as_ref());
        Ok(self
            .reviewer
            .compute(current, spec, &self.registry.consumers()))
    }

    /// Run `spec` to a resting state and persist the result.
    ///
    /// Failures are reported in the outcome; the stack always ends in
    /// Pending, Deployed or Failed.
    #[instrument(skip_all, fields(stack_id = %spec.id))]
    pub async fn deploy(&self, spec: &StackSpec) -> StackOutcome {
        let mut snapshot = match self.store.load_stack(&spec.id).await {
            Ok(snapshot) => snapshot.unwrap_or_else(|| StackSnapshot::new(spec.id.clone())),
            Err(err) => {
                let mut outcome = StackOutcome::new(spec.id.clone(), StackState::Pending);
                outcome.error = Some(err.into());
                return outcome;
            }
        };
        if !snapshot.state.is_resting() {
            warn!(state = %snapshot.state, "Previous run was interrupted; treating stack as Failed");
            snapshot.state = StackState::Failed;
        }

        let mut lifecycle =
            StackLifecycle::new(spec.id.clone(), snapshot.state, self.events.clone());
        let mut outcome = StackOutcome::new(spec.id.clone(), snapshot.state);

        if let Err(err) = self
            .run(spec, &mut snapshot, &mut lifecycle, &mut outcome)
            .await
        {
            error!(state = %lifecycle.state(), error = %err, "Stack deployment failed");
            outcome.error = Some(err);
        }

        outcome.state = lifecycle.state();
        snapshot.state = lifecycle.state();
        if let Err(err) = self.persist(&mut snapshot).await {
            error!(error = %err, "Failed to persist stack state");
            if outcome.error.is_none() {
                outcome.error = Some(err);
            }
        }
        outcome
    }

    async fn run(
        &self,
        spec: &StackSpec,
        snapshot: &mut StackSnapshot,
        lifecycle: &mut StackLifecycle,
        outcome: &mut StackOutcome,
    ) -> Result<()> {
        // Pending -> Planning only once every import resolves
        for import in &spec.imports {
            self.registry.resolve(import)?;
        }
        if lifecycle.state() != StackState::Pending {
            lifecycle.transition(StackState::Pending)?;
        }
        lifecycle.transition(StackState::Planning)?;

        let change_set = self.reviewer.compute(
            snapshot.last_deployed.as_ref(),
            spec,
            &self.registry.consumers(),
        );
        let risky = change_set.risky_items().count();
        outcome.fingerprint = Some(change_set.fingerprint().to_string());
        outcome.changes = change_set.len();
        outcome.risky = risky;
        info!(
            fingerprint = change_set.short_fingerprint(),
            items = change_set.len(),
            risky,
            "Change set computed"
        );
        self.emit(DeployEvent::ChangeSetComputed {
            stack_id: spec.id.clone(),
            fingerprint: change_set.fingerprint().to_string(),
            items: change_set.len(),
            risky,
        });

        if change_set.is_empty() {
            lifecycle.transition(StackState::Deployed)?;
            self.publish(spec, snapshot)?;
            outcome.status = OutcomeStatus::Unchanged;
            return Ok(());
        }

        lifecycle.transition(StackState::AwaitingReview)?;
        if change_set.is_risky() {
            if let Err(err) = self.review(&change_set).await {
                lifecycle.transition(lifecycle.resting_state())?;
                outcome.status = OutcomeStatus::Rejected;
                return Err(err);
            }
        }

        lifecycle.transition(StackState::Applying)?;
        let mut groups = snapshot.groups.clone();
        let applied = match self.provisioner.apply(spec, &change_set).await {
            Ok(()) => {
                lifecycle.transition(StackState::Settling)?;
                match self.settle(spec, &mut groups, outcome).await {
                    Ok(()) => self.publish(spec, snapshot),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };

        match applied {
            Ok(()) => {
                snapshot.groups = groups;
                lifecycle.transition(StackState::Deployed)?;
                outcome.status = OutcomeStatus::Deployed;
                Ok(())
            }
            Err(err) => {
                warn!(state = %lifecycle.state(), error = %err, "Update failed");
                lifecycle.transition(StackState::Failed)?;
                if err.is_cancelled() || *self.cancel.borrow() {
                    info!("Cancelled; capacity groups kept as they stand");
                    outcome.status = OutcomeStatus::Failed;
                } else {
                    self.roll_back(snapshot, &mut groups, lifecycle, outcome)
                        .await;
                }
                snapshot.groups = groups;
                Err(err)
            }
        }
    }

    /// Ask the approval gate about a risky change set.
    async fn review(&self, change_set: &ChangeSet) -> Result<()> {
        let stack_id = change_set.stack_id().clone();
        info!(
            gate = self.gate.name(),
            fingerprint = change_set.short_fingerprint(),
            "Risky change set needs approval"
        );
        let decision = self
            .gate
            .review(change_set)
            .await
            .map_err(|source| DeployError::Review {
                stack_id: stack_id.clone(),
                source,
            })?;
        match decision {
            ApprovalDecision::Approved => {
                info!(gate = self.gate.name(), "Change set approved");
                Ok(())
            }
            ApprovalDecision::Rejected { reason } => Err(DeployError::ReviewRejected {
                stack_id,
                fingerprint: change_set.fingerprint().to_string(),
                reason,
            }),
        }
    }

    /// Converge every declared capacity group and retire undeclared ones.
    async fn settle(
        &self,
        spec: &StackSpec,
        groups: &mut Vec<CapacityGroup>,
        outcome: &mut StackOutcome,
    ) -> Result<()> {
        let declared: BTreeMap<_, _> = spec.capacity_groups().collect();
        self.retire_undeclared(&spec.id, &declared, groups).await?;

        for (id, group_spec) in spec.capacity_groups() {
            let group = match groups.iter().position(|g| &g.id == id) {
                Some(index) => {
                    groups[index].apply_spec(group_spec);
                    &mut groups[index]
                }
                None => {
                    groups.push(CapacityGroup::from_spec(spec.id.clone(), id.clone(), group_spec));
                    let last = groups.len() - 1;
                    &mut groups[last]
                }
            };
            self.converge(group, group_spec, self.cancel.clone(), outcome)
                .await?;
        }
        Ok(())
    }

    /// Fill the group to its desired capacity, then replace outdated units.
    async fn converge(
        &self,
        group: &mut CapacityGroup,
        group_spec: &CapacityGroupSpec,
        cancel: watch::Receiver<bool>,
        outcome: &mut StackOutcome,
    ) -> Result<()> {
        let policy = &group_spec.update_policy;
        let target = &group_spec.launch_version;
        let wrap = |group: &CapacityGroup, source| DeployError::RollingUpdate {
            stack_id: group.stack_id.clone(),
            group: group.id.clone(),
            source,
        };

        let report = self
            .rollout
            .provision(group, policy, cancel.clone())
            .await
            .map_err(|e| wrap(group, e))?;
        if !report.batches.is_empty() {
            outcome.rollouts.push(report);
        }

        if !group.outdated_units(target).is_empty() {
            let report = self
                .rollout
                .execute(group, policy, target, cancel)
                .await
                .map_err(|e| wrap(group, e))?;
            outcome.rollouts.push(report);
        }
        debug!(group = %group.id, in_service = group.in_service_count(), "Capacity group converged");
        Ok(())
    }

    async fn retire_undeclared(
        &self,
        stack_id: &StackId,
        declared: &BTreeMap<&keel_types::ResourceId, &CapacityGroupSpec>,
        groups: &mut Vec<CapacityGroup>,
    ) -> Result<()> {
        let mut index = 0;
        while index < groups.len() {
            if declared.contains_key(&groups[index].id) {
                index += 1;
                continue;
            }
            let group = &mut groups[index];
            let terminated = self.rollout.terminate_all(group).await.map_err(|source| {
                DeployError::RollingUpdate {
                    stack_id: stack_id.clone(),
                    group: group.id.clone(),
                    source,
                }
            })?;
            info!(group = %group.id, terminated, "Capacity group no longer declared; units terminated");
            groups.remove(index);
        }
        Ok(())
    }

    /// Failed -> RollingBack -> Deployed, restoring the last deployed
    /// declaration and its capacity groups. Without a deployed declaration
    /// the stack stays Failed.
    async fn roll_back(
        &self,
        snapshot: &StackSnapshot,
        groups: &mut Vec<CapacityGroup>,
        lifecycle: &mut StackLifecycle,
        outcome: &mut StackOutcome,
    ) {
        let Some(previous) = snapshot.last_deployed.as_ref() else {
            info!("No deployed declaration to roll back to; stack stays Failed");
            outcome.status = OutcomeStatus::Failed;
            return;
        };
        if lifecycle.transition(StackState::RollingBack).is_err() {
            outcome.status = OutcomeStatus::Failed;
            return;
        }

        let restored = match self.provisioner.rollback(previous).await {
            Ok(()) => self.restore_groups(previous, groups, outcome).await,
            Err(err) => Err(err),
        };
        let next = match restored {
            Ok(()) => {
                info!("Rolled back to the last deployed declaration");
                outcome.status = OutcomeStatus::RolledBack;
                StackState::Deployed
            }
            Err(err) => {
                error!(error = %err, "Rollback failed; stack stays Failed");
                outcome.status = OutcomeStatus::Failed;
                StackState::Failed
            }
        };
        if let Err(err) = lifecycle.transition(next) {
            error!(error = %err, "Rollback left the stack in an unexpected state");
        }
    }

    /// Bring capacity groups back to the previous declaration. A cancel
    /// stops the restore between batches like any other rollout.
    async fn restore_groups(
        &self,
        previous: &StackSpec,
        groups: &mut Vec<CapacityGroup>,
        outcome: &mut StackOutcome,
    ) -> Result<()> {
        let declared: BTreeMap<_, _> = previous.capacity_groups().collect();
        self.retire_undeclared(&previous.id, &declared, groups).await?;

        for (id, group_spec) in previous.capacity_groups() {
            let group = match groups.iter().position(|g| &g.id == id) {
                Some(index) => {
                    groups[index].apply_spec(group_spec);
                    &mut groups[index]
                }
                None => {
                    groups.push(CapacityGroup::from_spec(
                        previous.id.clone(),
                        id.clone(),
                        group_spec,
                    ));
                    let last = groups.len() - 1;
                    &mut groups[last]
                }
            };
            info!(group = %id, version = %group_spec.launch_version, "Rolling capacity group back");
            self.converge(group, group_spec, self.cancel.clone(), outcome)
                .await?;
        }
        Ok(())
    }

    /// Publish the stack's exports in one step and align its import locks.
    fn publish(&self, spec: &StackSpec, snapshot: &mut StackSnapshot) -> Result<()> {
        let changed = self.registry.publish_all(&spec.id, &spec.exports)?;

        for import in &spec.imports {
            self.registry.lock(import, &spec.id)?;
        }
        let stale: Vec<ExportName> = self
            .registry
            .locks_held_by(&spec.id)
            .into_iter()
            .filter(|name| !spec.imports.contains(name))
            .collect();
        for name in &stale {
            self.registry.unlock(name, &spec.id);
            debug!(export = %name, "Released lock on export no longer imported");
        }

        if !changed.is_empty() {
            let exports: Vec<ExportName> = changed.into_iter().map(|e| e.name).collect();
            info!(exports = exports.len(), "Exports published");
            self.emit(DeployEvent::ExportsPublished {
                stack_id: spec.id.clone(),
                exports,
            });
        }

        snapshot.last_deployed = Some(spec.clone());
        snapshot.exports = spec.exports.clone();
        Ok(())
    }

    async fn persist(&self, snapshot: &mut StackSnapshot) -> Result<()> {
        snapshot.touch();
        self.store.save_stack(snapshot).await?;
        self.save_registry().await?;
        debug!(generation = snapshot.generation, state = %snapshot.state, "Stack state persisted");
        Ok(())
    }

    /// Remove one stack: terminate its units, destroy its resources,
    /// release its locks and retire its exports.
    #[instrument(skip_all, fields(stack_id = %stack_id))]
    pub async fn teardown(&self, stack_id: &StackId) -> Result<(Vec<ExportName>, u32)> {
        let mut units = 0;
        if let Some(mut snapshot) = self.store.load_stack(stack_id).await? {
            while let Some(group) = snapshot.groups.first_mut() {
                match self.rollout.terminate_all(group).await {
                    Ok(terminated) => {
                        units += terminated;
                        snapshot.groups.remove(0);
                    }
                    Err(source) => {
                        let err = DeployError::RollingUpdate {
                            stack_id: stack_id.clone(),
                            group: group.id.clone(),
                            source,
                        };
                        self.persist(&mut snapshot).await?;
                        return Err(err);
                    }
                }
            }
        }

        self.provisioner.destroy(stack_id).await?;
        self.registry.release_all(stack_id);
        let retired = self.registry.retire(stack_id)?;
        self.store.delete_stack(stack_id).await?;
        self.save_registry().await?;

        info!(units, exports = retired.len(), "Stack torn down");
        self.emit(DeployEvent::StackTornDown {
            stack_id: stack_id.clone(),
        });
        Ok((retired, units))
    }

    /// Write the current registry. Concurrent stacks of a wave queue here so
    /// an older snapshot never lands after a newer one.
    async fn save_registry(&self) -> Result<()> {
        let _guard = self.registry_write.lock().await;
        self.store.save_registry(&self.registry.snapshot()).await?;
        Ok(())
    }

    fn emit(&self, event: DeployEvent) {
        let _ = self.events.send(DeployEventEnvelope::new(event));
    }
}
