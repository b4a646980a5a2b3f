//! Error types for keel-health.

use keel_types::{InstanceId, ResourceId};
use thiserror::Error;

/// Errors raised while judging unit health.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthError {
    /// A LoadBalancer-checked group has no probe settings.
    #[error("capacity group {group} uses LoadBalancer health checks but has no LoadBalancerHealthCheck")]
    MissingLoadBalancerCheck { group: ResourceId },

    /// The signal provider could not report on a unit.
    #[error("health signals unavailable for {unit}: {reason}")]
    SignalUnavailable { unit: InstanceId, reason: String },
}

/// Result type for health operations.
pub type Result<T> = std::result::Result<T, HealthError>;
