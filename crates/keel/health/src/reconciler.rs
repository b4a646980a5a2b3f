//! Health reconciliation
//!
//! Merges a unit's lifecycle and load balancer signals into one verdict.

use crate::error::{HealthError, Result};
use chrono::{DateTime, Utc};
use keel_types::{CapacityGroup, HealthCheckType, InstanceId, InstanceUnit};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Reconciled health of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthVerdict::Healthy => write!(f, "healthy"),
            HealthVerdict::Unhealthy => write!(f, "unhealthy"),
            HealthVerdict::Unknown => write!(f, "unknown"),
        }
    }
}

/// Verdict plus the timing information behind it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthAssessment {
    pub unit: InstanceId,
    pub verdict: HealthVerdict,

    /// Time left before the unit's health counts; zero once elapsed
    pub grace_remaining: Duration,

    /// Age of the latest load balancer probe, if any probe has run
    pub probe_age: Option<Duration>,

    /// The latest probe is older than `Interval + Timeout`
    pub stale: bool,

    pub reason: String,
}

impl HealthAssessment {
    pub fn in_grace(&self) -> bool {
        !self.grace_remaining.is_zero()
    }

    /// Healthy and backed by a current probe.
    pub fn is_fresh_healthy(&self) -> bool {
        self.verdict == HealthVerdict::Healthy && !self.stale
    }
}

/// Stateless judge of unit health
///
/// Before `HealthCheckGracePeriod` has elapsed since the unit launched the
/// verdict is always Unknown. Afterwards:
///
/// - `Instance`: Running is Healthy, Impaired or Stopped is Unhealthy,
///   Starting is Unknown.
/// - `LoadBalancer`: Healthy needs a Running lifecycle and at least
///   `HealthyThreshold` consecutive passing probes; `UnhealthyThreshold`
///   consecutive failures or a failed lifecycle is Unhealthy; anything else
///   is Unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthReconciler;

impl HealthReconciler {
    pub fn new() -> Self {
        Self
    }

    pub fn verdict(
        &self,
        unit: &InstanceUnit,
        group: &CapacityGroup,
        now: DateTime<Utc>,
    ) -> Result<HealthVerdict> {
        Ok(self.assess(unit, group, now)?.verdict)
    }

    pub fn assess(
        &self,
        unit: &InstanceUnit,
        group: &CapacityGroup,
        now: DateTime<Utc>,
    ) -> Result<HealthAssessment> {
        let elb = match group.health_check_type {
            HealthCheckType::LoadBalancer => Some(
                group
                    .load_balancer_health_check
                    .as_ref()
                    .ok_or_else(|| HealthError::MissingLoadBalancerCheck {
                        group: group.id.clone(),
                    })?,
            ),
            HealthCheckType::Instance => None,
        };

        let since_launch = elapsed(unit.launched_at, now);
        let grace_remaining = group.health_check_grace_period.saturating_sub(since_launch);
        let probe_age = unit.elb.last_probe_at.map(|at| elapsed(at, now));
        let stale = match (elb, probe_age) {
            (Some(elb), Some(age)) => age > elb.staleness_limit(),
            _ => false,
        };

        let (verdict, reason) = if !grace_remaining.is_zero() {
            (
                HealthVerdict::Unknown,
                format!("in grace period, {:?} remaining", grace_remaining),
            )
        } else if let Some(elb) = elb {
            let lifecycle = unit.lifecycle;
            if lifecycle.is_failed() {
                (HealthVerdict::Unhealthy, format!("lifecycle {:?}", lifecycle))
            } else if unit.elb.consecutive_failures >= elb.unhealthy_threshold {
                (
                    HealthVerdict::Unhealthy,
                    format!(
                        "{} consecutive failed target checks",
                        unit.elb.consecutive_failures
                    ),
                )
            } else if lifecycle.is_running()
                && unit.elb.consecutive_successes >= elb.healthy_threshold
            {
                (
                    HealthVerdict::Healthy,
                    format!(
                        "running, {} consecutive passing target checks",
                        unit.elb.consecutive_successes
                    ),
                )
            } else {
                (
                    HealthVerdict::Unknown,
                    format!(
                        "lifecycle {:?}, {}/{} passing target checks",
                        lifecycle, unit.elb.consecutive_successes, elb.healthy_threshold
                    ),
                )
            }
        } else {
            match unit.lifecycle {
                l if l.is_running() => (HealthVerdict::Healthy, "running".to_string()),
                l if l.is_failed() => (HealthVerdict::Unhealthy, format!("lifecycle {:?}", l)),
                l => (HealthVerdict::Unknown, format!("lifecycle {:?}", l)),
            }
        };

        debug!(
            unit = %unit.id,
            group = %group.id,
            verdict = %verdict,
            stale,
            reason = %reason,
            "Unit assessed"
        );
        Ok(HealthAssessment {
            unit: unit.id.clone(),
            verdict,
            grace_remaining,
            probe_age,
            stale,
            reason,
        })
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{
        CapacityGroupSpec, ElbHealthCheck, LaunchVersion, LifecycleHealth, ResourceId,
        RollingUpdatePolicy, StackId,
    };
    use proptest::prelude::*;

    fn elb_check() -> ElbHealthCheck {
        ElbHealthCheck {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            healthy_threshold: 2,
            unhealthy_threshold: 2,
        }
    }

    fn group(check: HealthCheckType) -> CapacityGroup {
        let spec = CapacityGroupSpec {
            min_size: 1,
            max_size: 4,
            desired_capacity: 2,
            launch_version: LaunchVersion::new("v1"),
            health_check_grace_period: Duration::from_secs(60),
            health_check_type: check,
            load_balancer_health_check: Some(elb_check()),
            update_policy: RollingUpdatePolicy::new(1, 1, Duration::from_secs(30)),
        };
        CapacityGroup::from_spec(StackId::new("app"), ResourceId::new("web"), &spec)
    }

    fn at(t0: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        t0 + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_load_balancer_grace_then_latest_signal() {
        let group = group(HealthCheckType::LoadBalancer);
        let t0 = Utc::now();
        let mut unit = InstanceUnit::launch(LaunchVersion::new("v1"), t0);
        unit.lifecycle = LifecycleHealth::Running;
        unit.elb.record_fail(at(t0, 20));
        unit.elb.record_fail(at(t0, 30));

        let reconciler = HealthReconciler::new();
        let early = reconciler.assess(&unit, &group, at(t0, 30)).unwrap();
        assert_eq!(early.verdict, HealthVerdict::Unknown);
        assert_eq!(early.grace_remaining, Duration::from_secs(30));

        // Still failing after grace
        unit.elb.record_fail(at(t0, 60));
        assert_eq!(
            reconciler.verdict(&unit, &group, at(t0, 61)).unwrap(),
            HealthVerdict::Unhealthy
        );

        // Recovered by the time grace ends
        unit.elb.record_pass(at(t0, 50));
        unit.elb.record_pass(at(t0, 60));
        assert_eq!(
            reconciler.verdict(&unit, &group, at(t0, 61)).unwrap(),
            HealthVerdict::Healthy
        );
    }

    #[test]
    fn test_load_balancer_requires_running_lifecycle() {
        let group = group(HealthCheckType::LoadBalancer);
        let t0 = Utc::now();
        let mut unit = InstanceUnit::launch(LaunchVersion::new("v1"), t0);
        unit.elb.record_pass(at(t0, 60));
        unit.elb.record_pass(at(t0, 70));

        let reconciler = HealthReconciler::new();
        assert_eq!(
            reconciler.verdict(&unit, &group, at(t0, 71)).unwrap(),
            HealthVerdict::Unknown
        );
        unit.lifecycle = LifecycleHealth::Stopped;
        assert_eq!(
            reconciler.verdict(&unit, &group, at(t0, 71)).unwrap(),
            HealthVerdict::Unhealthy
        );
    }

    #[test]
    fn test_instance_type_ignores_target_health() {
        let group = group(HealthCheckType::Instance);
        let t0 = Utc::now();
        let mut unit = InstanceUnit::launch(LaunchVersion::new("v1"), t0);
        unit.lifecycle = LifecycleHealth::Running;
        unit.elb.record_fail(at(t0, 60));
        unit.elb.record_fail(at(t0, 61));
        unit.elb.record_fail(at(t0, 62));

        let reconciler = HealthReconciler::new();
        let assessment = reconciler.assess(&unit, &group, at(t0, 65)).unwrap();
        assert_eq!(assessment.verdict, HealthVerdict::Healthy);
        assert!(!assessment.stale);
    }

    #[test]
    fn test_stale_probe_is_reported() {
        let group = group(HealthCheckType::LoadBalancer);
        let t0 = Utc::now();
        let mut unit = InstanceUnit::launch(LaunchVersion::new("v1"), t0);
        unit.lifecycle = LifecycleHealth::Running;
        unit.elb.record_pass(at(t0, 60));
        unit.elb.record_pass(at(t0, 70));

        let reconciler = HealthReconciler::new();
        let fresh = reconciler.assess(&unit, &group, at(t0, 80)).unwrap();
        assert!(fresh.is_fresh_healthy());

        // Interval + Timeout = 15s
        let old = reconciler.assess(&unit, &group, at(t0, 86)).unwrap();
        assert_eq!(old.verdict, HealthVerdict::Healthy);
        assert!(old.stale);
        assert_eq!(old.probe_age, Some(Duration::from_secs(16)));
        assert!(!old.is_fresh_healthy());
    }

    #[test]
    fn test_missing_load_balancer_check() {
        let mut group = group(HealthCheckType::LoadBalancer);
        group.load_balancer_health_check = None;
        let unit = InstanceUnit::launch(LaunchVersion::new("v1"), Utc::now());
        assert!(matches!(
            HealthReconciler::new().assess(&unit, &group, Utc::now()),
            Err(HealthError::MissingLoadBalancerCheck { .. })
        ));
    }

    fn lifecycle_strategy() -> impl Strategy<Value = LifecycleHealth> {
        prop_oneof![
            Just(LifecycleHealth::Starting),
            Just(LifecycleHealth::Running),
            Just(LifecycleHealth::Impaired),
            Just(LifecycleHealth::Stopped),
        ]
    }

    proptest! {
        /// Nothing but Unknown inside the grace period, whatever the signals.
        #[test]
        fn unknown_during_grace(
            lifecycle in lifecycle_strategy(),
            passes in 0u32..5,
            failures in 0u32..5,
            sampled_at in 0i64..60,
            load_balancer in any::<bool>(),
        ) {
            let check = if load_balancer { HealthCheckType::LoadBalancer } else { HealthCheckType::Instance };
            let group = group(check);
            let t0 = Utc::now();
            let mut unit = InstanceUnit::launch(LaunchVersion::new("v1"), t0);
            unit.lifecycle = lifecycle;
            unit.elb.consecutive_successes = passes;
            unit.elb.consecutive_failures = failures;
            unit.elb.last_probe_at = Some(at(t0, sampled_at));

            let reconciler = HealthReconciler::new();
            let verdict = reconciler.verdict(&unit, &group, at(t0, sampled_at)).unwrap();
            prop_assert_eq!(verdict, HealthVerdict::Unknown);

            // After grace an Instance-checked group always reaches a
            // verdict unless the unit is still booting
            let after = reconciler.verdict(&unit, &group, at(t0, 60 + sampled_at)).unwrap();
            if !load_balancer && lifecycle != LifecycleHealth::Starting {
                prop_assert_ne!(after, HealthVerdict::Unknown);
            }
        }
    }
}
