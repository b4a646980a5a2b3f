//! Keel Rollout - Health-gated rolling replacement of capacity groups
//!
//! The [`RollingUpdateController`] moves a capacity group from one launch
//! version to another in bounded batches. Each batch launches its
//! replacements first, waits out the grace period, polls the health
//! reconciler until every new unit is verified, and only then drains and
//! terminates the old units it replaces. Serving capacity never drops below
//! the policy's `MinInstancesInService`.
//!
//! ## Failure handling
//!
//! - Unknown verdicts are retried within the poll budget and wait ceiling
//! - An Unhealthy replacement or an exhausted budget fails the batch
//! - A failed batch terminates only its own new units; drained old units
//!   return to service
//! - A previously verified unit turning Unhealthy halts the update
//!   instead of replacing again

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod completion;
pub mod controller;
pub mod error;
pub mod launcher;
pub mod report;

pub use completion::{CompletionSignal, CompletionSignals, SignalWaitError};
pub use controller::{RolloutTimings, RollingUpdateController};
pub use error::{Result, RolloutError};
pub use launcher::{InstanceLauncher, SimulatedLauncher};
pub use report::{BatchRecord, RolloutReport};
