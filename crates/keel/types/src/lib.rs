//! Keel Types - Core types for stack orchestration
//!
//! Keel deploys a set of interdependent infrastructure stacks in dependency
//! order, tracks the values they export to each other, and replaces compute
//! capacity behind a load balancer in health-gated batches.
//!
//! ## Key Concepts
//!
//! - **StackSpec**: Declared imports, exports and resources of one stack
//! - **StackState**: Per-stack lifecycle state machine
//! - **CapacityGroup**: A set of instance units behind a load balancer
//! - **InstanceUnit**: One unit of compute with two independent health signals
//! - **RollingUpdatePolicy**: Governs batched replacement of instance units
//! - **Events**: Unified lifecycle stream

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod capacity;
pub mod duration_serde;
pub mod events;
pub mod ids;
pub mod policy;
pub mod stack;

// Re-export main types
pub use capacity::{
    CapacityGroup, CapacityGroupSpec, ElbHealth, ElbHealthCheck, HealthCheckType, InstanceUnit,
    LifecycleHealth, UnitState,
};
pub use events::{DeployEvent, DeployEventEnvelope, EventSeverity, EventSource};
pub use ids::{ExportName, InstanceId, LaunchVersion, ResourceId, StackId};
pub use policy::{PolicyError, RollingUpdatePolicy};
pub use stack::{ResourceSpec, StackSpec, StackState, StackValidationError};
