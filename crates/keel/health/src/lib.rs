//! Keel Health - Health reconciliation for capacity groups
//!
//! Every instance unit carries two independent signals: the compute
//! lifecycle and the load balancer's target health. The reconciler merges
//! them into one verdict per unit according to the group's health check
//! type, suppressing judgement until the grace period has passed and
//! reporting how old the latest load balancer probe is.
//!
//! Time is always passed in explicitly; [`Clock`] implementations supply it.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod clock;
pub mod error;
pub mod reconciler;
pub mod signals;

pub use clock::{Clock, SystemClock, TokioClock};
pub use error::{HealthError, Result};
pub use reconciler::{HealthAssessment, HealthReconciler, HealthVerdict};
pub use signals::{
    HealthObservation, HealthSignalSource, ProbeOutcome, SignalBehaviour, SimulatedSignalSource,
};
