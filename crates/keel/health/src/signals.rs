//! Health signal sources
//!
//! A source reports what the compute provider and the load balancer
//! currently say about a unit. The controller applies observations to its
//! tracked units and then asks the reconciler for a verdict.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_types::{CapacityGroup, HealthCheckType, InstanceUnit, LaunchVersion, LifecycleHealth};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of one load balancer target check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    Pass,
    Fail,
}

/// Signals observed for one unit at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthObservation {
    pub lifecycle: LifecycleHealth,
    /// A target check that ran since the previous observation
    pub probe: Option<ProbeOutcome>,
    pub observed_at: DateTime<Utc>,
}

impl HealthObservation {
    /// Fold the observation into the unit's tracked signals.
    pub fn apply(&self, unit: &mut InstanceUnit) {
        unit.lifecycle = self.lifecycle;
        match self.probe {
            Some(ProbeOutcome::Pass) => unit.elb.record_pass(self.observed_at),
            Some(ProbeOutcome::Fail) => unit.elb.record_fail(self.observed_at),
            None => {}
        }
    }
}

/// Provider of lifecycle and target health signals
#[async_trait]
pub trait HealthSignalSource: Send + Sync {
    /// Current signals for `unit`, a member of `group`.
    async fn observe(
        &self,
        unit: &InstanceUnit,
        group: &CapacityGroup,
        now: DateTime<Utc>,
    ) -> Result<HealthObservation>;
}

/// Scripted behaviour of simulated units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalBehaviour {
    /// Boots for `boot`, then runs and passes every target check
    Healthy { boot: Duration },
    /// Boots for `boot`, then reports impaired and fails every check
    NeverHealthy { boot: Duration },
    /// Healthy after `boot` for `healthy_for`, then impaired
    Flapping { boot: Duration, healthy_for: Duration },
    /// Never leaves Starting and is never probed
    Silent,
}

/// Signal source driven by per-launch-version behaviours
///
/// Behaviour is a function of the unit's age, so results do not depend on
/// how often the controller polls. Target checks run at most once per
/// `Interval` of the group's load balancer settings.
pub struct SimulatedSignalSource {
    default: SignalBehaviour,
    by_version: DashMap<LaunchVersion, SignalBehaviour>,
}

impl SimulatedSignalSource {
    pub fn new(default: SignalBehaviour) -> Self {
        Self {
            default,
            by_version: DashMap::new(),
        }
    }

    pub fn with_version(self, version: impl Into<LaunchVersion>, behaviour: SignalBehaviour) -> Self {
        self.by_version.insert(version.into(), behaviour);
        self
    }

    /// Change the behaviour of a version, including units already running.
    pub fn set_behaviour(&self, version: impl Into<LaunchVersion>, behaviour: SignalBehaviour) {
        self.by_version.insert(version.into(), behaviour);
    }

    pub fn behaviour(&self, version: &LaunchVersion) -> SignalBehaviour {
        self.by_version
            .get(version)
            .map(|b| *b)
            .unwrap_or(self.default)
    }
}

#[async_trait]
impl HealthSignalSource for SimulatedSignalSource {
    async fn observe(
        &self,
        unit: &InstanceUnit,
        group: &CapacityGroup,
        now: DateTime<Utc>,
    ) -> Result<HealthObservation> {
        let age = (now - unit.launched_at).to_std().unwrap_or(Duration::ZERO);
        let (lifecycle, passing) = match self.behaviour(&unit.launch_version) {
            SignalBehaviour::Silent => (LifecycleHealth::Starting, None),
            SignalBehaviour::Healthy { boot } if age < boot => (LifecycleHealth::Starting, Some(false)),
            SignalBehaviour::Healthy { .. } => (LifecycleHealth::Running, Some(true)),
            SignalBehaviour::NeverHealthy { boot } if age < boot => {
                (LifecycleHealth::Starting, Some(false))
            }
            SignalBehaviour::NeverHealthy { .. } => (LifecycleHealth::Impaired, Some(false)),
            SignalBehaviour::Flapping { boot, .. } if age < boot => {
                (LifecycleHealth::Starting, Some(false))
            }
            SignalBehaviour::Flapping { boot, healthy_for } if age < boot + healthy_for => {
                (LifecycleHealth::Running, Some(true))
            }
            SignalBehaviour::Flapping { .. } => (LifecycleHealth::Impaired, Some(false)),
        };

        let probe_due = match (&group.health_check_type, &group.load_balancer_health_check) {
            (HealthCheckType::LoadBalancer, Some(elb)) => match unit.elb.last_probe_at {
                Some(last) => (now - last).to_std().unwrap_or(Duration::ZERO) >= elb.interval,
                None => true,
            },
            _ => false,
        };

        let probe = match passing {
            Some(true) if probe_due => Some(ProbeOutcome::Pass),
            Some(false) if probe_due => Some(ProbeOutcome::Fail),
            _ => None,
        };

        Ok(HealthObservation {
            lifecycle,
            probe,
            observed_at: now,
        })
    }
}
