//! Rolling update controller

use crate::completion::{CompletionSignals, SignalWaitError};
use crate::error::{Result, RolloutError};
use crate::launcher::InstanceLauncher;
use crate::report::{BatchRecord, RolloutReport};
use chrono::{DateTime, Utc};
use keel_health::{Clock, HealthAssessment, HealthReconciler, HealthSignalSource, HealthVerdict};
use keel_types::{
    CapacityGroup, DeployEvent, DeployEventEnvelope, HealthCheckType, InstanceId, LaunchVersion,
    PolicyError, RollingUpdatePolicy, UnitState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

/// Polling budget for verifying a batch
///
/// There are no built-in defaults: every value comes from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutTimings {
    /// Time between health polls of a batch
    pub poll_interval: Duration,
    /// Health polls allowed per batch once the grace period has passed
    pub max_polls: u32,
    /// Longest a batch may wait for health and signals after its grace period
    pub batch_wait_ceiling: Duration,
}

impl RolloutTimings {
    pub fn new(poll_interval: Duration, max_polls: u32, batch_wait_ceiling: Duration) -> Self {
        Self {
            poll_interval,
            max_polls,
            batch_wait_ceiling,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(RolloutError::InvalidTimings(
                "poll interval must be greater than zero".into(),
            ));
        }
        if self.max_polls == 0 {
            return Err(RolloutError::InvalidTimings(
                "at least one health poll per batch is required".into(),
            ));
        }
        if self.batch_wait_ceiling.is_zero() {
            return Err(RolloutError::InvalidTimings(
                "batch wait ceiling must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Drives capacity groups between launch versions in verified batches
pub struct RollingUpdateController {
    launcher: Arc<dyn InstanceLauncher>,
    signals: Arc<dyn HealthSignalSource>,
    completions: Arc<CompletionSignals>,
    clock: Arc<dyn Clock>,
    reconciler: HealthReconciler,
    timings: RolloutTimings,
    events: Option<broadcast::Sender<DeployEventEnvelope>>,
}

impl RollingUpdateController {
    pub fn new(
        launcher: Arc<dyn InstanceLauncher>,
        signals: Arc<dyn HealthSignalSource>,
        clock: Arc<dyn Clock>,
        timings: RolloutTimings,
    ) -> Self {
        Self {
            launcher,
            signals,
            completions: Arc::new(CompletionSignals::new()),
            clock,
            reconciler: HealthReconciler::new(),
            timings,
            events: None,
        }
    }

    /// Use a shared completion signal board.
    pub fn with_completions(mut self, completions: Arc<CompletionSignals>) -> Self {
        self.completions = completions;
        self
    }

    /// Publish batch events on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<DeployEventEnvelope>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn completions(&self) -> &Arc<CompletionSignals> {
        &self.completions
    }

    pub fn timings(&self) -> &RolloutTimings {
        &self.timings
    }

    /// Replace every unit not at `target` while keeping at least
    /// `MinInstancesInService` units in service.
    ///
    /// Each batch launches its replacements before touching old units.
    /// Old units are drained only once every replacement is verified
    /// healthy, and terminated only after `PauseTime` and a second check.
    /// Cancellation is honoured between batches and while waiting on a
    /// batch, never in the middle of a launch.
    #[instrument(skip_all, fields(stack_id = %group.stack_id, group = %group.id, version = %target))]
    pub async fn execute(
        &self,
        group: &mut CapacityGroup,
        policy: &RollingUpdatePolicy,
        target: &LaunchVersion,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RolloutReport> {
        self.timings.validate()?;
        policy
            .validate(group.desired_capacity)
            .map_err(|source| RolloutError::InvalidPolicy {
                group: group.id.clone(),
                source,
            })?;

        let mut report = RolloutReport::new(group.id.clone(), target.clone());
        report.mistuned = self.check_tuning(group, policy);
        group.launch_version = target.clone();
        self.settle_leftovers(group).await;
        sample(&mut report, group);

        info!(
            outdated = group.outdated_units(target).len(),
            min_in_service = policy.min_in_service,
            max_batch_size = policy.max_batch_size,
            "Rolling update started"
        );

        let mut completed = 0u32;
        loop {
            let outdated = group.outdated_units(target);
            self.recheck_verified(group, target, completed + 1).await?;
            if outdated.is_empty() {
                break;
            }
            if *cancel.borrow() {
                return Err(RolloutError::Cancelled {
                    group: group.id.clone(),
                    completed_batches: completed,
                });
            }

            let live = group.live_units().count() as u32;
            let size = policy.batch_size(live, outdated.len() as u32);
            if size == 0 {
                return Err(RolloutError::InsufficientCapacity {
                    group: group.id.clone(),
                    live,
                    min_in_service: policy.min_in_service,
                });
            }

            let old: Vec<InstanceId> = outdated.into_iter().take(size as usize).collect();
            let record = self
                .replace_batch(group, policy, target, completed + 1, &old, &mut cancel, &mut report)
                .await?;
            report.batches.push(record);
            completed += 1;
        }

        info!(batches = completed, "Rolling update complete");
        Ok(report)
    }

    /// Bring the group to its desired capacity at its current launch
    /// version: launch missing units in verified batches of at most
    /// `MaxBatchSize`, or drain and terminate surplus units.
    #[instrument(skip_all, fields(stack_id = %group.stack_id, group = %group.id))]
    pub async fn provision(
        &self,
        group: &mut CapacityGroup,
        policy: &RollingUpdatePolicy,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RolloutReport> {
        self.timings.validate()?;
        if policy.max_batch_size == 0 {
            return Err(RolloutError::InvalidPolicy {
                group: group.id.clone(),
                source: PolicyError::ZeroBatchSize,
            });
        }

        let target = group.launch_version.clone();
        let mut report = RolloutReport::new(group.id.clone(), target.clone());
        self.settle_leftovers(group).await;
        sample(&mut report, group);

        let mut completed = 0u32;
        loop {
            let live = group.live_units().count() as u32;
            if live >= group.desired_capacity {
                break;
            }
            if *cancel.borrow() {
                return Err(RolloutError::Cancelled {
                    group: group.id.clone(),
                    completed_batches: completed,
                });
            }
            let size = policy.max_batch_size.min(group.desired_capacity - live);
            let batch = completed + 1;
            let (launched, polls) = self
                .launch_verified(group, policy, &target, batch, size, &mut cancel, &mut report)
                .await?;
            self.emit(DeployEvent::BatchCompleted {
                stack_id: group.stack_id.clone(),
                group_id: group.id.clone(),
                batch,
                in_service: group.in_service_count(),
            });
            report.batches.push(BatchRecord {
                number: batch,
                size,
                launched,
                terminated: Vec::new(),
                polls,
            });
            completed = batch;
        }

        let surplus = self.surplus_units(group, &target);
        if !surplus.is_empty() {
            info!(surplus = surplus.len(), "Scaling in");
            for id in &surplus {
                if let Some(unit) = group.unit_mut(id) {
                    unit.state = UnitState::Draining;
                }
            }
            sample(&mut report, group);
            tokio::time::sleep(policy.pause_time).await;
            for id in &surplus {
                self.launcher.terminate(group, id).await?;
                group.remove_unit(id);
                self.completions.clear(id);
                sample(&mut report, group);
            }
            report.batches.push(BatchRecord {
                number: completed + 1,
                size: surplus.len() as u32,
                launched: Vec::new(),
                terminated: surplus,
                polls: 0,
            });
        }

        info!(
            in_service = group.in_service_count(),
            desired = group.desired_capacity,
            "Capacity provisioned"
        );
        Ok(report)
    }

    /// Terminate every tracked unit, e.g. when the owning stack is torn down.
    pub async fn terminate_all(&self, group: &mut CapacityGroup) -> Result<u32> {
        let ids: Vec<InstanceId> = group.units.iter().map(|u| u.id.clone()).collect();
        for id in &ids {
            self.launcher.terminate(group, id).await?;
            group.remove_unit(id);
            self.completions.clear(id);
        }
        Ok(ids.len() as u32)
    }

    #[allow(clippy::too_many_arguments)]
    async fn replace_batch(
        &self,
        group: &mut CapacityGroup,
        policy: &RollingUpdatePolicy,
        target: &LaunchVersion,
        batch: u32,
        old: &[InstanceId],
        cancel: &mut watch::Receiver<bool>,
        report: &mut RolloutReport,
    ) -> Result<BatchRecord> {
        let (launched, polls) = self
            .launch_verified(group, policy, target, batch, old.len() as u32, cancel, report)
            .await?;

        for id in old {
            if let Some(unit) = group.unit_mut(id) {
                unit.state = UnitState::Draining;
            }
        }
        sample(report, group);
        debug!(batch, draining = old.len(), pause = ?policy.pause_time, "Old units draining");
        tokio::time::sleep(policy.pause_time).await;

        // The load balancer has had PauseTime to notice a failing replacement
        let turned = self.unhealthy_units(group, &launched).await?;
        if !turned.is_empty() {
            warn!(batch, units = turned.len(), "Replacements turned unhealthy during pause");
            self.restore(group, old);
            sample(report, group);
            self.discard(group, &launched).await;
            sample(report, group);
            let err = RolloutError::Oscillation {
                group: group.id.clone(),
                batch,
                units: turned,
            };
            self.emit_failure(group, batch, &launched, &err);
            return Err(err);
        }

        for id in old {
            self.launcher.terminate(group, id).await?;
            group.remove_unit(id);
            self.completions.clear(id);
            sample(report, group);
        }

        let in_service = group.in_service_count();
        info!(batch, replaced = old.len(), in_service, "Batch complete");
        self.emit(DeployEvent::BatchCompleted {
            stack_id: group.stack_id.clone(),
            group_id: group.id.clone(),
            batch,
            in_service,
        });

        Ok(BatchRecord {
            number: batch,
            size: old.len() as u32,
            launched,
            terminated: old.to_vec(),
            polls,
        })
    }

    /// Launch `size` units at `version` and wait until all are verified.
    /// On failure the new units are terminated before returning.
    #[allow(clippy::too_many_arguments)]
    async fn launch_verified(
        &self,
        group: &mut CapacityGroup,
        policy: &RollingUpdatePolicy,
        version: &LaunchVersion,
        batch: u32,
        size: u32,
        cancel: &mut watch::Receiver<bool>,
        report: &mut RolloutReport,
    ) -> Result<(Vec<InstanceId>, u32)> {
        let mut launched = Vec::with_capacity(size as usize);
        for _ in 0..size {
            match self.launcher.launch(group, version, self.clock.now()).await {
                Ok(unit) => {
                    launched.push(unit.id.clone());
                    group.units.push(unit);
                }
                Err(err) => {
                    self.discard(group, &launched).await;
                    self.emit_failure(group, batch, &launched, &err);
                    return Err(err);
                }
            }
        }

        info!(batch, size, version = %version, "Batch launched");
        self.emit(DeployEvent::BatchStarted {
            stack_id: group.stack_id.clone(),
            group_id: group.id.clone(),
            batch,
            size,
            target_version: version.clone(),
        });

        match self.verify(group, policy, batch, &launched, cancel).await {
            Ok(polls) => {
                let now = self.clock.now();
                for id in &launched {
                    if let Some(unit) = group.unit_mut(id) {
                        unit.mark_in_service(now);
                    }
                }
                sample(report, group);
                Ok((launched, polls))
            }
            Err(err) => {
                warn!(batch, error = %err, "Batch failed, terminating its replacements");
                self.discard(group, &launched).await;
                sample(report, group);
                self.emit_failure(group, batch, &launched, &err);
                Err(err)
            }
        }
    }

    /// Wait out the grace period, then poll until every unit is Healthy on
    /// a fresh probe and, if required, has signalled completion.
    async fn verify(
        &self,
        group: &mut CapacityGroup,
        policy: &RollingUpdatePolicy,
        batch: u32,
        units: &[InstanceId],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<u32> {
        let cancelled = |group: &CapacityGroup| RolloutError::Cancelled {
            group: group.id.clone(),
            completed_batches: batch - 1,
        };

        if !sleep_unless_cancelled(group.health_check_grace_period, cancel).await {
            return Err(cancelled(&*group));
        }

        let started = tokio::time::Instant::now();
        let mut polls = 0u32;
        loop {
            polls += 1;
            let now = self.clock.now();
            let mut waiting = Vec::new();
            for id in units {
                let assessment = self.observe(group, id, now).await?;
                match assessment.verdict {
                    HealthVerdict::Unhealthy => {
                        return Err(RolloutError::UnhealthyReplacement {
                            group: group.id.clone(),
                            batch,
                            unit: id.clone(),
                            reason: assessment.reason,
                        });
                    }
                    // A Healthy verdict from a stale probe proves nothing
                    HealthVerdict::Healthy if !assessment.stale => {}
                    _ => waiting.push(id.clone()),
                }
            }
            if waiting.is_empty() {
                break;
            }

            let waited = started.elapsed();
            if polls >= self.timings.max_polls || waited >= self.timings.batch_wait_ceiling {
                return Err(RolloutError::BatchTimeout {
                    group: group.id.clone(),
                    batch,
                    units: waiting,
                    polls,
                    waited,
                });
            }
            debug!(batch, poll = polls, waiting = waiting.len(), "Replacements not yet healthy");

            let nap = self
                .timings
                .poll_interval
                .min(self.timings.batch_wait_ceiling.saturating_sub(waited));
            if !sleep_unless_cancelled(nap, cancel).await {
                return Err(cancelled(&*group));
            }
        }

        if policy.wait_on_signals {
            let timeout = policy
                .signal_timeout
                .ok_or_else(|| RolloutError::InvalidPolicy {
                    group: group.id.clone(),
                    source: PolicyError::MissingSignalTimeout,
                })?;
            let outcome = tokio::select! {
                outcome = self.completions.wait_for(units, timeout) => outcome,
                _ = until_cancelled(cancel) => return Err(cancelled(&*group)),
            };
            match outcome {
                Ok(()) => debug!(batch, "Completion signals received"),
                Err(SignalWaitError::Failed { unit, reason }) => {
                    return Err(RolloutError::SignalFailure {
                        group: group.id.clone(),
                        batch,
                        unit,
                        reason,
                    });
                }
                Err(SignalWaitError::TimedOut { missing }) => {
                    return Err(RolloutError::SignalTimeout {
                        group: group.id.clone(),
                        batch,
                        units: missing,
                        waited: timeout,
                    });
                }
            }
        }

        Ok(polls)
    }

    /// Refresh one unit's signals and assess it.
    async fn observe(
        &self,
        group: &mut CapacityGroup,
        id: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<HealthAssessment> {
        let unit = group.unit(id).cloned().ok_or_else(|| RolloutError::Launch {
            group: group.id.clone(),
            reason: format!("{} is no longer tracked", id),
        })?;
        let observation = self.signals.observe(&unit, group, now).await?;
        let group_id = group.id.clone();
        let tracked = group.unit_mut(id).ok_or_else(|| RolloutError::Launch {
            group: group_id,
            reason: format!("{} is no longer tracked", id),
        })?;
        observation.apply(tracked);
        let tracked = tracked.clone();
        Ok(self.reconciler.assess(&tracked, group, now)?)
    }

    async fn unhealthy_units(
        &self,
        group: &mut CapacityGroup,
        ids: &[InstanceId],
    ) -> Result<Vec<InstanceId>> {
        let now = self.clock.now();
        let mut unhealthy = Vec::new();
        for id in ids {
            let assessment = self.observe(group, id, now).await?;
            if assessment.verdict == HealthVerdict::Unhealthy {
                debug!(unit = %id, reason = %assessment.reason, "Verified unit now unhealthy");
                unhealthy.push(id.clone());
            }
        }
        Ok(unhealthy)
    }

    /// Halt if a unit verified in an earlier batch has since failed.
    async fn recheck_verified(
        &self,
        group: &mut CapacityGroup,
        target: &LaunchVersion,
        batch: u32,
    ) -> Result<()> {
        let verified: Vec<InstanceId> = group
            .units
            .iter()
            .filter(|u| &u.launch_version == target && u.is_in_service())
            .map(|u| u.id.clone())
            .collect();
        if verified.is_empty() {
            return Ok(());
        }

        let turned = self.unhealthy_units(group, &verified).await?;
        if turned.is_empty() {
            return Ok(());
        }

        warn!(
            batch,
            units = turned.len(),
            "Previously verified units turned unhealthy; halting instead of replacing again"
        );
        let err = RolloutError::Oscillation {
            group: group.id.clone(),
            batch,
            units: turned.clone(),
        };
        self.emit_failure(group, batch, &turned, &err);
        Err(err)
    }

    /// Units left behind by an interrupted run: never-verified Pending units
    /// are terminated and Draining units go back into service.
    async fn settle_leftovers(&self, group: &mut CapacityGroup) {
        let pending: Vec<InstanceId> = group
            .units
            .iter()
            .filter(|u| u.state == UnitState::Pending)
            .map(|u| u.id.clone())
            .collect();
        let draining: Vec<InstanceId> = group
            .units
            .iter()
            .filter(|u| u.state == UnitState::Draining)
            .map(|u| u.id.clone())
            .collect();
        if pending.is_empty() && draining.is_empty() {
            return;
        }
        info!(
            pending = pending.len(),
            draining = draining.len(),
            "Settling units left by an interrupted update"
        );
        self.restore(group, &draining);
        self.discard(group, &pending).await;
    }

    /// Return drained units to service.
    fn restore(&self, group: &mut CapacityGroup, ids: &[InstanceId]) {
        for id in ids {
            if let Some(unit) = group.unit_mut(id) {
                if unit.state == UnitState::Draining {
                    unit.state = UnitState::InService;
                }
            }
        }
    }

    /// Terminate units that never served. A unit the launcher fails to
    /// terminate stays tracked.
    async fn discard(&self, group: &mut CapacityGroup, ids: &[InstanceId]) {
        for id in ids {
            match self.launcher.terminate(group, id).await {
                Ok(()) => {
                    group.remove_unit(id);
                    self.completions.clear(id);
                }
                Err(err) => {
                    warn!(unit = %id, error = %err, "Failed to terminate unit; it stays tracked");
                }
            }
        }
    }

    /// Surplus live units, outdated first and oldest first within each.
    fn surplus_units(&self, group: &CapacityGroup, target: &LaunchVersion) -> Vec<InstanceId> {
        let mut live: Vec<_> = group.live_units().collect();
        let surplus = live.len().saturating_sub(group.desired_capacity as usize);
        live.sort_by_key(|u| (&u.launch_version == target, u.launched_at));
        live.into_iter()
            .take(surplus)
            .map(|u| u.id.clone())
            .collect()
    }

    fn check_tuning(&self, group: &CapacityGroup, policy: &RollingUpdatePolicy) -> bool {
        let Some(elb) = group.load_balancer_health_check.as_ref() else {
            return false;
        };
        if group.health_check_type != HealthCheckType::LoadBalancer || !policy.is_mistuned(elb) {
            return false;
        }
        warn!(
            pause = ?policy.pause_time,
            detection_window = ?elb.failure_detection_window(),
            "PauseTime is shorter than Interval x UnhealthyThreshold; a failing replacement may still look healthy when old units are terminated"
        );
        true
    }

    fn emit(&self, event: DeployEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(DeployEventEnvelope::new(event));
        }
    }

    fn emit_failure(
        &self,
        group: &CapacityGroup,
        batch: u32,
        units: &[InstanceId],
        err: &RolloutError,
    ) {
        self.emit(DeployEvent::BatchFailed {
            stack_id: group.stack_id.clone(),
            group_id: group.id.clone(),
            batch,
            units: units.to_vec(),
            reason: err.to_string(),
        });
    }
}

fn sample(report: &mut RolloutReport, group: &CapacityGroup) {
    report.in_service_samples.push(group.in_service_count());
}

/// Resolves once cancellation is requested; never if the sender is gone.
async fn until_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep for `duration`. Returns false if cancelled first.
async fn sleep_unless_cancelled(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = until_cancelled(cancel) => false,
    }
}
