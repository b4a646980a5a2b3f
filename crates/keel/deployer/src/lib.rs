//! Keel Deployer - Stack lifecycle and dependency-ordered deployment
//!
//! Every stack moves through an explicit state machine:
//!
//! ```text
//! Pending -> Planning -> AwaitingReview -> Applying -> Settling -> Deployed
//!                                            |            |
//!                                            +-> Failed <-+
//!                                                  |
//!                                            RollingBack -> Deployed
//! ```
//!
//! The [`Orchestrator`] validates a whole stack set before touching
//! anything, then runs the [`StackDeployer`] wave by wave: stacks that
//! share no import path are processed concurrently, while the export
//! registry serializes every mutation. Exports are published only when a
//! stack fully succeeds.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod deployer;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod provisioner;
pub mod report;

pub use deployer::StackDeployer;
pub use error::{DeployError, Result, TeardownBlocker};
pub use lifecycle::StackLifecycle;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use provisioner::{Provisioner, SimulatedProvisioner};
pub use report::{DeployReport, OutcomeStatus, StackOutcome, TeardownReport};
