//! Keel Registry - Export registry for cross-stack values
//!
//! A single authoritative map of values published by deployed stacks and
//! consumed by their dependents. Consumers hold locks on the exports they
//! import; a stack cannot retire an export while a foreign lock remains.
//!
//! All mutation happens inside one critical section so a reader never sees
//! half of a stack's export set.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod registry;

pub use error::{RegistryError, Result};
pub use registry::{ConsumerSnapshot, Export, ExportRegistry, RegistrySnapshot};
