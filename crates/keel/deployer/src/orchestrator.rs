//! Stack set orchestration
//!
//! Validates a stack set as a whole, then deploys it in dependency waves or
//! tears it down in reverse order.

use crate::deployer::StackDeployer;
use crate::error::{DeployError, Result, TeardownBlocker};
use crate::provisioner::Provisioner;
use crate::report::{DeployReport, StackOutcome, TeardownReport};
use futures::future::join_all;
use keel_graph::DependencyGraph;
use keel_registry::{ExportRegistry, RegistryError};
use keel_review::{ApprovalGate, ChangeSet, ChangeSetReviewer, RejectRisky};
use keel_rollout::RollingUpdateController;
use keel_state::{StackSnapshot, StateStore};
use keel_types::{DeployEventEnvelope, ExportName, StackId, StackSpec, StackState};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, instrument, warn};

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Builder for an [`Orchestrator`]
pub struct OrchestratorBuilder {
    store: Option<Arc<dyn StateStore>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    rollout: Option<RollingUpdateController>,
    gate: Option<Arc<dyn ApprovalGate>>,
    cancel: Option<watch::Receiver<bool>>,
    event_capacity: usize,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            provisioner: None,
            rollout: None,
            gate: None,
            cancel: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Set the state store
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the provisioner
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Set the rolling update controller
    pub fn with_rollout(mut self, rollout: RollingUpdateController) -> Self {
        self.rollout = Some(rollout);
        self
    }

    /// Set the approval gate for risky change sets (default: reject them)
    pub fn with_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Abort rolling updates when `cancel` turns true
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Build the orchestrator, loading the persisted export registry.
    pub async fn build(self) -> Result<Orchestrator> {
        let store = self
            .store
            .ok_or_else(|| DeployError::Config("state store required".into()))?;
        let provisioner = self
            .provisioner
            .ok_or_else(|| DeployError::Config("provisioner required".into()))?;
        let rollout = self
            .rollout
            .ok_or_else(|| DeployError::Config("rolling update controller required".into()))?;
        let gate = self.gate.unwrap_or_else(|| Arc::new(RejectRisky));
        let cancel = self.cancel.unwrap_or_else(|| watch::channel(false).1);

        let registry = Arc::new(ExportRegistry::from_snapshot(store.load_registry().await?));
        let (events, _) = broadcast::channel(self.event_capacity);
        let rollout = Arc::new(rollout.with_events(events.clone()));

        Ok(Orchestrator {
            deployer: StackDeployer {
                registry: registry.clone(),
                store: store.clone(),
                provisioner,
                gate,
                rollout,
                reviewer: ChangeSetReviewer::new(),
                events: events.clone(),
                cancel,
                registry_write: Mutex::new(()),
            },
            registry,
            store,
            events,
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Deploys, plans and tears down stack sets
pub struct Orchestrator {
    deployer: StackDeployer,
    registry: Arc<ExportRegistry>,
    store: Arc<dyn StateStore>,
    events: broadcast::Sender<DeployEventEnvelope>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn registry(&self) -> &Arc<ExportRegistry> {
        &self.registry
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeployEventEnvelope> {
        self.events.subscribe()
    }

    /// Persisted snapshots of every known stack.
    pub async fn status(&self) -> Result<Vec<StackSnapshot>> {
        Ok(self.store.list_stacks().await?)
    }

    /// Deploy a stack set.
    ///
    /// The whole set is validated first: graph errors, exports owned by
    /// stacks outside the set, and dropped exports still imported elsewhere
    /// abort the run before any stack leaves its resting state. Stacks then
    /// run wave by wave; after a wave with a failure the remaining stacks
    /// are skipped.
    #[instrument(skip_all, fields(stacks = stacks.len()))]
    pub async fn deploy(&self, stacks: &[StackSpec]) -> Result<DeployReport> {
        let started = tokio::time::Instant::now();
        let graph = self.preflight(stacks)?;
        let by_id: BTreeMap<&StackId, &StackSpec> = stacks.iter().map(|s| (&s.id, s)).collect();
        let waves = graph.levels();
        info!(stacks = stacks.len(), waves = waves.len(), "Deployment started");

        let mut outcomes: BTreeMap<StackId, StackOutcome> = BTreeMap::new();
        let mut halted = false;
        for (number, wave) in waves.iter().enumerate() {
            if halted {
                for id in wave {
                    let state = self.resting_state_of(id).await;
                    outcomes.insert(id.clone(), StackOutcome::skipped(id.clone(), state));
                }
                continue;
            }

            info!(wave = number + 1, stacks = wave.len(), "Deploying wave");
            let runs = wave
                .iter()
                .filter_map(|id| by_id.get(id))
                .map(|spec| self.deployer.deploy(spec));
            for outcome in join_all(runs).await {
                if !outcome.is_success() {
                    halted = true;
                }
                outcomes.insert(outcome.stack_id.clone(), outcome);
            }
            if halted {
                warn!(wave = number + 1, "Wave failed; remaining stacks skipped");
            }
        }

        let mut report = DeployReport {
            outcomes: Vec::with_capacity(outcomes.len()),
            elapsed: started.elapsed(),
        };
        for id in graph.build_order() {
            if let Some(outcome) = outcomes.remove(id) {
                report.outcomes.push(outcome);
            }
        }
        info!(
            success = report.is_success(),
            elapsed = ?report.elapsed,
            "Deployment finished"
        );
        Ok(report)
    }

    /// Compute the change set for one stack of the set.
    pub async fn plan(&self, stacks: &[StackSpec], stack: &StackId) -> Result<ChangeSet> {
        self.graph_for(stacks)?;
        let spec = stacks
            .iter()
            .find(|s| &s.id == stack)
            .ok_or_else(|| DeployError::UnknownStack(stack.clone()))?;
        self.deployer.plan(spec).await
    }

    /// Tear a stack set down in reverse dependency order.
    ///
    /// Fails fast, before anything is removed, when stacks outside the set
    /// still import exports of stacks in the set.
    #[instrument(skip_all, fields(stacks = stacks.len()))]
    pub async fn teardown(&self, stacks: &[StackSpec]) -> Result<TeardownReport> {
        let members: BTreeSet<&StackId> = stacks.iter().map(|s| &s.id).collect();
        let external: BTreeSet<ExportName> = self.registry.names();
        let graph = DependencyGraph::build_with_external(stacks, &external)?;

        let blockers: Vec<TeardownBlocker> = graph
            .teardown_order()
            .into_iter()
            .flat_map(|stack_id| {
                self.registry
                    .blocking_consumers(&stack_id)
                    .into_iter()
                    .filter(|(_, consumer)| !members.contains(consumer))
                    .map(move |(export, consumer)| TeardownBlocker {
                        stack_id: stack_id.clone(),
                        export,
                        consumer,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        if !blockers.is_empty() {
            warn!(blockers = blockers.len(), "Teardown blocked by foreign consumers");
            return Err(DeployError::TeardownBlocked { blockers });
        }

        let mut report = TeardownReport::default();
        for stack_id in graph.teardown_order() {
            let (retired, units) = self.deployer.teardown(&stack_id).await?;
            report.units_terminated += units;
            report.exports_retired.extend(retired);
            report.removed.push(stack_id);
        }
        info!(
            stacks = report.removed.len(),
            exports = report.exports_retired.len(),
            units = report.units_terminated,
            "Teardown complete"
        );
        Ok(report)
    }

    /// Graph of the set, with exports of stacks outside the set resolvable.
    fn graph_for(&self, stacks: &[StackSpec]) -> Result<DependencyGraph> {
        let members: BTreeSet<&StackId> = stacks.iter().map(|s| &s.id).collect();
        let external: BTreeSet<ExportName> = self
            .registry
            .snapshot()
            .exports
            .into_values()
            .filter(|e| !members.contains(&e.owner))
            .map(|e| e.name)
            .collect();
        Ok(DependencyGraph::build_with_external(stacks, &external)?)
    }

    fn preflight(&self, stacks: &[StackSpec]) -> Result<DependencyGraph> {
        let graph = self.graph_for(stacks)?;
        let registry = self.registry.snapshot();

        for stack in stacks {
            for name in stack.exports.keys() {
                if let Some(existing) = registry.exports.get(name) {
                    if existing.owner != stack.id {
                        return Err(RegistryError::ExportOwnedElsewhere {
                            export: name.clone(),
                            owner: existing.owner.clone(),
                            requested_by: stack.id.clone(),
                        }
                        .into());
                    }
                }
            }

            for export in registry.exports.values().filter(|e| e.owner == stack.id) {
                if stack.exports.contains_key(&export.name) {
                    continue;
                }
                let consumers: Vec<StackId> = registry
                    .locks
                    .get(&export.name)
                    .map(|holders| holders.iter().filter(|c| **c != stack.id).cloned().collect())
                    .unwrap_or_default();
                if !consumers.is_empty() {
                    return Err(RegistryError::ExportInUse {
                        export: export.name.clone(),
                        owner: stack.id.clone(),
                        consumers,
                    }
                    .into());
                }
            }
        }
        Ok(graph)
    }

    async fn resting_state_of(&self, id: &StackId) -> StackState {
        match self.store.load_stack(id).await {
            Ok(Some(snapshot)) => snapshot.state,
            _ => StackState::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::SimulatedProvisioner;
    use crate::report::OutcomeStatus;
    use keel_health::{SignalBehaviour, SimulatedSignalSource, TokioClock};
    use keel_review::{ApprovalBoard, AutoApprove};
    use keel_rollout::{RolloutTimings, SimulatedLauncher};
    use keel_state::InMemoryStateStore;
    use keel_types::{
        CapacityGroupSpec, DeployEvent, ElbHealthCheck, HealthCheckType, LaunchVersion,
        ResourceSpec, RollingUpdatePolicy,
    };
    use async_trait::async_trait;
    use keel_registry::RegistrySnapshot;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const BOOT: Duration = Duration::from_secs(5);

    struct Fixture {
        store: Arc<InMemoryStateStore>,
        provisioner: Arc<SimulatedProvisioner>,
        signals: Arc<SimulatedSignalSource>,
        launcher: Arc<SimulatedLauncher>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryStateStore::new()),
                provisioner: Arc::new(SimulatedProvisioner::new()),
                signals: Arc::new(SimulatedSignalSource::new(SignalBehaviour::Healthy {
                    boot: BOOT,
                })),
                launcher: Arc::new(SimulatedLauncher::new()),
            }
        }

        fn builder(&self, gate: Arc<dyn ApprovalGate>) -> OrchestratorBuilder {
            let rollout = RollingUpdateController::new(
                self.launcher.clone(),
                self.signals.clone(),
                Arc::new(TokioClock::new()),
                RolloutTimings::new(Duration::from_secs(5), 30, Duration::from_secs(600)),
            );
            Orchestrator::builder()
                .with_store(self.store.clone())
                .with_provisioner(self.provisioner.clone())
                .with_rollout(rollout)
                .with_gate(gate)
        }

        async fn orchestrator(&self, gate: Arc<dyn ApprovalGate>) -> Orchestrator {
            self.builder(gate).build().await.unwrap()
        }
    }

    fn group_spec(version: &str) -> CapacityGroupSpec {
        CapacityGroupSpec {
            min_size: 1,
            max_size: 4,
            desired_capacity: 2,
            launch_version: LaunchVersion::new(version),
            health_check_grace_period: Duration::from_secs(30),
            health_check_type: HealthCheckType::LoadBalancer,
            load_balancer_health_check: Some(ElbHealthCheck {
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(5),
                healthy_threshold: 2,
                unhealthy_threshold: 2,
            }),
            update_policy: RollingUpdatePolicy::new(1, 1, Duration::from_secs(30)),
        }
    }

    fn network(subnets: serde_json::Value) -> StackSpec {
        StackSpec::new("network")
            .with_export("vpc-id", "vpc-1")
            .with_resource(
                "vpc",
                ResourceSpec::new("Network::Vpc")
                    .with_property("Subnets", subnets)
                    .immutable("Subnets")
                    .backing("vpc-id"),
            )
    }

    fn app(version: &str) -> StackSpec {
        StackSpec::new("app")
            .with_import("vpc-id")
            .with_export("app-url", "https://app.internal")
            .with_resource(
                "web",
                ResourceSpec::new("Compute::CapacityGroup")
                    .with_capacity_group(group_spec(version))
                    .backing("app-url"),
            )
    }

    fn drain(rx: &mut broadcast::Receiver<DeployEventEnvelope>) -> Vec<DeployEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_in_dependency_order() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(Arc::new(AutoApprove)).await;
        let mut rx = orchestrator.subscribe();

        let set = vec![app("v1"), network(json!(["a", "b"]))];
        let report = orchestrator.deploy(&set).await.unwrap();

        assert!(report.is_success(), "{:?}", report.first_error());
        assert_eq!(report.exit_code(), 0);
        let order: Vec<&str> = report.outcomes.iter().map(|o| o.stack_id.as_str()).collect();
        assert_eq!(order, vec!["network", "app"]);

        let registry = orchestrator.registry();
        assert_eq!(registry.resolve(&ExportName::new("vpc-id")).unwrap().value, "vpc-1");
        assert!(!registry.can_retire(&StackId::new("network")));

        let app_state = fx.store.load_stack(&StackId::new("app")).await.unwrap().unwrap();
        assert_eq!(app_state.state, StackState::Deployed);
        let web = &app_state.groups[0];
        assert_eq!(web.in_service_count(), 2);
        assert!(web.is_converged(&LaunchVersion::new("v1")));

        // network publishes before app enters Planning
        let events = drain(&mut rx);
        let published = events
            .iter()
            .position(|e| matches!(e, DeployEvent::ExportsPublished { stack_id, .. } if stack_id.as_str() == "network"))
            .unwrap();
        let app_planning = events
            .iter()
            .position(|e| matches!(e, DeployEvent::StackTransition { stack_id, to: StackState::Planning, .. } if stack_id.as_str() == "app"))
            .unwrap();
        assert!(published < app_planning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_import_fails_before_planning() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(Arc::new(AutoApprove)).await;
        let mut rx = orchestrator.subscribe();

        let set = vec![app("v1"), StackSpec::new("db").with_import("never-published")];
        let err = orchestrator.deploy(&set).await.unwrap_err();

        assert_eq!(err.exit_code(), 2);
        assert!(matches!(err, DeployError::Graph(keel_graph::GraphError::UnresolvedImport { .. })));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(fx.store.stack_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_update_on_redeploy() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(Arc::new(AutoApprove)).await;
        orchestrator
            .deploy(&[network(json!(["a"])), app("v1")])
            .await
            .unwrap();

        let report = orchestrator
            .deploy(&[network(json!(["a"])), app("v2")])
            .await
            .unwrap();
        assert!(report.is_success());

        let network_outcome = report.outcome(&StackId::new("network")).unwrap();
        assert_eq!(network_outcome.status, OutcomeStatus::Unchanged);

        let app_outcome = report.outcome(&StackId::new("app")).unwrap();
        assert_eq!(app_outcome.status, OutcomeStatus::Deployed);
        let rollout = app_outcome.rollouts.last().unwrap();
        assert_eq!(rollout.batches.len(), 2);
        assert!(rollout.min_in_service().unwrap() >= 1);

        let app_state = fx.store.load_stack(&StackId::new("app")).await.unwrap().unwrap();
        assert!(app_state.groups[0].is_converged(&LaunchVersion::new("v2")));
        assert_eq!(app_state.generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_risky_change_needs_approval() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(Arc::new(RejectRisky)).await;
        orchestrator
            .deploy(&[network(json!(["a"])), app("v1")])
            .await
            .unwrap();

        // Replacing the VPC would cut app off
        let report = orchestrator
            .deploy(&[network(json!(["a", "b"])), app("v1")])
            .await
            .unwrap();
        let outcome = report.outcome(&StackId::new("network")).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Rejected);
        assert_eq!(outcome.state, StackState::Deployed);
        assert_eq!(outcome.risky, 1);
        assert_eq!(report.exit_code(), 3);
        assert_eq!(
            report.outcome(&StackId::new("app")).unwrap().status,
            OutcomeStatus::Skipped
        );
        assert_eq!(fx.provisioner.applied(&StackId::new("network")), 1);

        // Approving the exact fingerprint lets it through
        let fingerprint = outcome.fingerprint.clone().unwrap();
        let board = Arc::new(ApprovalBoard::with_approved(
            Duration::from_secs(60),
            [fingerprint],
        ));
        let orchestrator = fx.orchestrator(board).await;
        let report = orchestrator
            .deploy(&[network(json!(["a", "b"])), app("v1")])
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report.first_error());
        assert_eq!(fx.provisioner.applied(&StackId::new("network")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_rejection_rolls_back() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(Arc::new(AutoApprove)).await;
        orchestrator
            .deploy(&[network(json!(["a"])), app("v1")])
            .await
            .unwrap();

        fx.provisioner.refuse("app", "instance quota exceeded");
        let report = orchestrator
            .deploy(&[network(json!(["a"])), app("v2")])
            .await
            .unwrap();

        let outcome = report.outcome(&StackId::new("app")).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::RolledBack);
        assert_eq!(outcome.state, StackState::Deployed);
        assert_eq!(report.exit_code(), 4);
        assert!(matches!(outcome.error, Some(DeployError::ApplyRejected { .. })));
        assert_eq!(fx.provisioner.rolled_back(&StackId::new("app")), 1);

        let app_state = fx.store.load_stack(&StackId::new("app")).await.unwrap().unwrap();
        let last = app_state.last_deployed.unwrap();
        let (_, group) = last.capacity_groups().next().unwrap();
        assert_eq!(group.launch_version, LaunchVersion::new("v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rollout_restores_previous_version() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(Arc::new(AutoApprove)).await;
        orchestrator
            .deploy(&[network(json!(["a"])), app("v1")])
            .await
            .unwrap();
        let before = fx.store.load_stack(&StackId::new("app")).await.unwrap().unwrap();

        fx.signals
            .set_behaviour("v2", SignalBehaviour::NeverHealthy { boot: BOOT });
        let report = orchestrator
            .deploy(&[network(json!(["a"])), app("v2")])
            .await
            .unwrap();

        let outcome = report.outcome(&StackId::new("app")).unwrap();
        assert_eq!(report.exit_code(), 5);
        assert_eq!(outcome.status, OutcomeStatus::RolledBack);
        assert!(matches!(
            outcome.error,
            Some(DeployError::RollingUpdate { ref group, .. }) if group.as_str() == "web"
        ));

        // Old units were never touched
        let after = fx.store.load_stack(&StackId::new("app")).await.unwrap().unwrap();
        let ids = |s: &StackSnapshot| -> Vec<_> { s.groups[0].units.iter().map(|u| u.id.clone()).collect() };
        assert_eq!(ids(&before), ids(&after));
        assert_eq!(after.state, StackState::Deployed);
        assert_eq!(
            orchestrator
                .registry()
                .resolve(&ExportName::new("app-url"))
                .unwrap()
                .revision,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_deploy_failure_stays_failed() {
        let fx = Fixture::new();
        fx.provisioner.refuse("network", "access denied");
        let orchestrator = fx.orchestrator(Arc::new(AutoApprove)).await;

        let report = orchestrator
            .deploy(&[network(json!(["a"])), app("v1")])
            .await
            .unwrap();
        let outcome = report.outcome(&StackId::new("network")).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.state, StackState::Failed);
        assert!(!orchestrator.registry().contains(&ExportName::new("vpc-id")));
        assert_eq!(
            report.outcome(&StackId::new("app")).unwrap().status,
            OutcomeStatus::Skipped
        );

        // The next run starts from Failed and succeeds
        fx.provisioner.allow(&StackId::new("network"));
        let report = orchestrator
            .deploy(&[network(json!(["a"])), app("v1")])
            .await
            .unwrap();
        assert!(report.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_blocked_by_foreign_consumer() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(Arc::new(AutoApprove)).await;
        orchestrator
            .deploy(&[network(json!(["a"])), app("v1")])
            .await
            .unwrap();

        let err = orchestrator
            .teardown(&[network(json!(["a"]))])
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 6);
        match err {
            DeployError::TeardownBlocked { blockers } => {
                assert_eq!(blockers.len(), 1);
                assert_eq!(blockers[0].consumer, StackId::new("app"));
            }
            other => panic!("expected teardown blocked, got {}", other),
        }
        assert_eq!(fx.provisioner.destroyed(&StackId::new("network")), 0);

        let report = orchestrator
            .teardown(&[network(json!(["a"])), app("v1")])
            .await
            .unwrap();
        assert_eq!(
            report.removed,
            vec![StackId::new("app"), StackId::new("network")]
        );
        assert_eq!(report.units_terminated, 2);
        assert!(orchestrator.registry().names().is_empty());
        assert!(orchestrator.status().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_consumed_export_is_refused() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(Arc::new(AutoApprove)).await;
        orchestrator
            .deploy(&[network(json!(["a"])), app("v1")])
            .await
            .unwrap();

        let mut without_export = StackSpec::new("network");
        without_export.resources = network(json!(["a"])).resources;
        for resource in without_export.resources.values_mut() {
            resource.backs_exports.clear();
        }
        let err = orchestrator.deploy(&[without_export]).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Registry(RegistryError::ExportInUse { .. })
        ));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_against_persisted_state() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(Arc::new(AutoApprove)).await;
        let set = vec![network(json!(["a"])), app("v1")];

        let first = orchestrator.plan(&set, &StackId::new("app")).await.unwrap();
        assert_eq!(first.len(), 1);

        orchestrator.deploy(&set).await.unwrap();
        let again = orchestrator.plan(&set, &StackId::new("app")).await.unwrap();
        assert!(again.is_empty());

        // A fresh orchestrator over the same store sees the same state
        let reopened = fx.orchestrator(Arc::new(AutoApprove)).await;
        let changed = reopened
            .plan(&[network(json!(["a"])), app("v2")], &StackId::new("app"))
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert!(!changed.is_risky());

        assert!(matches!(
            reopened.plan(&set, &StackId::new("missing")).await,
            Err(DeployError::UnknownStack(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_rollout_keeps_partial_group() {
        let fx = Fixture::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let orchestrator = fx
            .builder(Arc::new(AutoApprove))
            .with_cancel(cancel_rx)
            .build()
            .await
            .unwrap();
        orchestrator
            .deploy(&[network(json!(["a"])), app("v1")])
            .await
            .unwrap();

        // Abort while the second replacement batch sits in its grace period
        let mut rx = orchestrator.subscribe();
        let launcher = fx.launcher.clone();
        let canceller = tokio::spawn(async move {
            while let Ok(envelope) = rx.recv().await {
                if matches!(envelope.event, DeployEvent::BatchStarted { batch: 2, .. }) {
                    let launched = launcher.launched();
                    let _ = cancel_tx.send(true);
                    return Some((cancel_tx, launched));
                }
            }
            None
        });

        let report = orchestrator
            .deploy(&[network(json!(["a"])), app("v2")])
            .await
            .unwrap();
        drop(orchestrator);
        let (_cancel_tx, launched_at_cancel) = canceller.await.unwrap().unwrap();

        let outcome = report.outcome(&StackId::new("app")).unwrap();
        assert_eq!(report.exit_code(), 5);
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.state, StackState::Failed);
        assert!(outcome.error.as_ref().unwrap().is_cancelled());
        assert_eq!(fx.provisioner.rolled_back(&StackId::new("app")), 0);

        // Two initial units, one per batch, nothing after the abort
        assert_eq!(launched_at_cancel, 4);
        assert_eq!(fx.launcher.launched(), 4);

        let app_state = fx.store.load_stack(&StackId::new("app")).await.unwrap().unwrap();
        assert_eq!(app_state.state, StackState::Failed);
        let web = &app_state.groups[0];
        let mut versions: Vec<&str> = web.units.iter().map(|u| u.launch_version.as_str()).collect();
        versions.sort();
        assert_eq!(versions, vec!["v1", "v2"]);
        assert_eq!(web.in_service_count(), 2);

        // The next run picks up from the partial group
        let orchestrator = fx.orchestrator(Arc::new(AutoApprove)).await;
        let report = orchestrator
            .deploy(&[network(json!(["a"])), app("v2")])
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report.first_error());
        let app_state = fx.store.load_stack(&StackId::new("app")).await.unwrap().unwrap();
        assert!(app_state.groups[0].is_converged(&LaunchVersion::new("v2")));
        assert_eq!(fx.launcher.launched(), 5);
    }

    /// Delays the first registry write so a later one would finish first
    #[derive(Default)]
    struct SlowFirstRegistryWrite {
        inner: InMemoryStateStore,
        writes: AtomicU32,
    }

    #[async_trait]
    impl StateStore for SlowFirstRegistryWrite {
        async fn load_registry(&self) -> keel_state::Result<RegistrySnapshot> {
            self.inner.load_registry().await
        }

        async fn save_registry(&self, registry: &RegistrySnapshot) -> keel_state::Result<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.inner.save_registry(registry).await
        }

        async fn load_stack(&self, id: &StackId) -> keel_state::Result<Option<StackSnapshot>> {
            self.inner.load_stack(id).await
        }

        async fn save_stack(&self, snapshot: &StackSnapshot) -> keel_state::Result<()> {
            self.inner.save_stack(snapshot).await
        }

        async fn delete_stack(&self, id: &StackId) -> keel_state::Result<()> {
            self.inner.delete_stack(id).await
        }

        async fn list_stacks(&self) -> keel_state::Result<Vec<StackSnapshot>> {
            self.inner.list_stacks().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stacks_keep_every_export() {
        let fx = Fixture::new();
        let store = Arc::new(SlowFirstRegistryWrite::default());
        let orchestrator = fx
            .builder(Arc::new(AutoApprove))
            .with_store(store.clone())
            .build()
            .await
            .unwrap();

        let dns = StackSpec::new("dns").with_export("zone-id", "zone-1");
        let report = orchestrator
            .deploy(&[dns, network(json!(["a"]))])
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report.first_error());

        let persisted = ExportRegistry::from_snapshot(store.load_registry().await.unwrap());
        assert_eq!(persisted.resolve(&ExportName::new("zone-id")).unwrap().value, "zone-1");
        assert_eq!(persisted.resolve(&ExportName::new("vpc-id")).unwrap().value, "vpc-1");
    }
}
