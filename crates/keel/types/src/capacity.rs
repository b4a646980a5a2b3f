//! Capacity groups and instance units
//!
//! A capacity group is a set of interchangeable compute units behind a load
//! balancer. Every unit carries two independent health signals: what the
//! compute provider says about the machine (lifecycle) and what the load
//! balancer's target health checks observe.

use crate::ids::{InstanceId, LaunchVersion, ResourceId, StackId};
use crate::policy::{PolicyError, RollingUpdatePolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which signal decides whether a unit is healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthCheckType {
    /// Compute lifecycle only
    Instance,
    /// Compute lifecycle and load balancer target health
    #[serde(alias = "ELB")]
    LoadBalancer,
}

impl std::fmt::Display for HealthCheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthCheckType::Instance => write!(f, "Instance"),
            HealthCheckType::LoadBalancer => write!(f, "LoadBalancer"),
        }
    }
}

/// Load balancer target health check settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ElbHealthCheck {
    /// Time between probes
    #[serde(with = "crate::duration_serde")]
    pub interval: Duration,

    /// Probe timeout
    #[serde(with = "crate::duration_serde")]
    pub timeout: Duration,

    /// Consecutive passing probes before a target counts as healthy
    pub healthy_threshold: u32,

    /// Consecutive failing probes before a target counts as unhealthy
    pub unhealthy_threshold: u32,
}

impl ElbHealthCheck {
    /// Longest time the load balancer can take to notice a failing target.
    pub fn failure_detection_window(&self) -> Duration {
        self.interval * self.unhealthy_threshold
    }

    /// A probe older than this no longer describes the target.
    pub fn staleness_limit(&self) -> Duration {
        self.interval + self.timeout
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.healthy_threshold == 0 || self.unhealthy_threshold == 0 {
            return Err("HealthyThreshold and UnhealthyThreshold must be at least 1".into());
        }
        if self.interval.is_zero() {
            return Err("Interval must be greater than zero".into());
        }
        if self.timeout >= self.interval {
            return Err("Timeout must be shorter than Interval".into());
        }
        Ok(())
    }
}

/// Declared capacity group settings, as written in a stack set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapacityGroupSpec {
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    pub launch_version: LaunchVersion,
    #[serde(with = "crate::duration_serde")]
    pub health_check_grace_period: Duration,
    pub health_check_type: HealthCheckType,
    #[serde(default)]
    pub load_balancer_health_check: Option<ElbHealthCheck>,
    pub update_policy: RollingUpdatePolicy,
}

impl CapacityGroupSpec {
    /// Check sizes, health-check wiring and, when the group will ever be
    /// rolled, the update policy.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_size > self.desired_capacity || self.desired_capacity > self.max_size {
            return Err(format!(
                "sizes must satisfy MinSize <= DesiredCapacity <= MaxSize (got {} / {} / {})",
                self.min_size, self.desired_capacity, self.max_size
            ));
        }
        match (&self.health_check_type, &self.load_balancer_health_check) {
            (HealthCheckType::LoadBalancer, None) => {
                return Err(
                    "HealthCheckType LoadBalancer requires a LoadBalancerHealthCheck".into(),
                );
            }
            (_, Some(elb)) => elb.validate()?,
            _ => {}
        }
        if self.desired_capacity > 0 {
            self.update_policy
                .validate(self.desired_capacity)
                .map_err(|e: PolicyError| e.to_string())?;
        }
        Ok(())
    }
}

/// Lifecycle state of an instance unit within its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitState {
    /// Launched, not yet verified healthy
    Pending,
    /// Serving traffic
    InService,
    /// Removed from rotation, awaiting termination
    Draining,
    /// Gone
    Terminated,
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Pending => write!(f, "Pending"),
            UnitState::InService => write!(f, "InService"),
            UnitState::Draining => write!(f, "Draining"),
            UnitState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Compute provider's view of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleHealth {
    /// Booting, no judgement yet
    Starting,
    /// Running and reachable
    Running,
    /// Running but failing provider status checks
    Impaired,
    /// Stopped or lost
    Stopped,
}

impl LifecycleHealth {
    pub fn is_running(&self) -> bool {
        matches!(self, LifecycleHealth::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LifecycleHealth::Impaired | LifecycleHealth::Stopped)
    }
}

/// Load balancer's view of a unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElbHealth {
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl ElbHealth {
    pub fn record_pass(&mut self, at: DateTime<Utc>) {
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
        self.last_probe_at = Some(at);
    }

    pub fn record_fail(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
        self.last_probe_at = Some(at);
    }
}

/// A single unit of compute capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceUnit {
    pub id: InstanceId,
    pub launch_version: LaunchVersion,
    pub state: UnitState,
    /// When the unit entered Pending; the grace period runs from here
    pub launched_at: DateTime<Utc>,
    pub in_service_since: Option<DateTime<Utc>>,
    pub lifecycle: LifecycleHealth,
    pub elb: ElbHealth,
}

impl InstanceUnit {
    /// A freshly launched unit.
    pub fn launch(launch_version: LaunchVersion, at: DateTime<Utc>) -> Self {
        Self {
            id: InstanceId::generate(),
            launch_version,
            state: UnitState::Pending,
            launched_at: at,
            in_service_since: None,
            lifecycle: LifecycleHealth::Starting,
            elb: ElbHealth::default(),
        }
    }

    pub fn mark_in_service(&mut self, at: DateTime<Utc>) {
        self.state = UnitState::InService;
        self.in_service_since = Some(at);
    }

    pub fn is_in_service(&self) -> bool {
        self.state == UnitState::InService
    }
}

/// Live capacity group: declared settings plus tracked units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityGroup {
    pub id: ResourceId,
    pub stack_id: StackId,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    /// Version new units are launched from
    pub launch_version: LaunchVersion,
    #[serde(with = "crate::duration_serde")]
    pub health_check_grace_period: Duration,
    pub health_check_type: HealthCheckType,
    pub load_balancer_health_check: Option<ElbHealthCheck>,
    pub units: Vec<InstanceUnit>,
}

impl CapacityGroup {
    /// An empty group carrying the declared settings.
    pub fn from_spec(stack_id: StackId, id: ResourceId, spec: &CapacityGroupSpec) -> Self {
        let mut group = Self {
            id,
            stack_id,
            min_size: spec.min_size,
            max_size: spec.max_size,
            desired_capacity: spec.desired_capacity,
            launch_version: spec.launch_version.clone(),
            health_check_grace_period: spec.health_check_grace_period,
            health_check_type: spec.health_check_type,
            load_balancer_health_check: None,
            units: Vec::new(),
        };
        group.apply_spec(spec);
        group
    }

    /// Adopt new declared settings, keeping the tracked units.
    pub fn apply_spec(&mut self, spec: &CapacityGroupSpec) {
        self.min_size = spec.min_size;
        self.max_size = spec.max_size;
        self.desired_capacity = spec.desired_capacity;
        self.launch_version = spec.launch_version.clone();
        self.health_check_grace_period = spec.health_check_grace_period;
        self.health_check_type = spec.health_check_type;
        self.load_balancer_health_check = spec.load_balancer_health_check.clone();
    }

    pub fn in_service_count(&self) -> u32 {
        self.units.iter().filter(|u| u.is_in_service()).count() as u32
    }

    /// Units not yet terminated.
    pub fn live_units(&self) -> impl Iterator<Item = &InstanceUnit> {
        self.units.iter().filter(|u| u.state != UnitState::Terminated)
    }

    /// Live units launched from a version other than `version`, oldest first.
    pub fn outdated_units(&self, version: &LaunchVersion) -> Vec<InstanceId> {
        let mut units: Vec<&InstanceUnit> = self
            .live_units()
            .filter(|u| &u.launch_version != version)
            .collect();
        units.sort_by_key(|u| u.launched_at);
        units.into_iter().map(|u| u.id.clone()).collect()
    }

    pub fn unit(&self, id: &InstanceId) -> Option<&InstanceUnit> {
        self.units.iter().find(|u| &u.id == id)
    }

    pub fn unit_mut(&mut self, id: &InstanceId) -> Option<&mut InstanceUnit> {
        self.units.iter_mut().find(|u| &u.id == id)
    }

    /// Drop a unit from tracking, returning it.
    pub fn remove_unit(&mut self, id: &InstanceId) -> Option<InstanceUnit> {
        let index = self.units.iter().position(|u| &u.id == id)?;
        Some(self.units.remove(index))
    }

    /// Every live unit runs `version` and serves traffic.
    pub fn is_converged(&self, version: &LaunchVersion) -> bool {
        let live: Vec<&InstanceUnit> = self.live_units().collect();
        live.len() as u32 == self.desired_capacity
            && live
                .iter()
                .all(|u| &u.launch_version == version && u.is_in_service())
    }
}
