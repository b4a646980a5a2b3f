//! Keel State - Persisted deployment state
//!
//! The export registry and each stack's last deployed declaration must
//! survive process restarts: the next change set is always computed against
//! what was actually applied, never against an in-memory assumption.
//!
//! ## Backends
//!
//! - [`InMemoryStateStore`]: for tests and dry runs
//! - [`FileStateStore`]: JSON documents under a state directory

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod snapshot;
pub mod storage;

pub use error::{Result, StateError};
pub use snapshot::StackSnapshot;
pub use storage::{FileStateStore, InMemoryStateStore, StateStore};
