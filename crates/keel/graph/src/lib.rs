//! Keel Graph - Stack dependency graph and deployment ordering
//!
//! Stacks are linked by the exports they import from each other. The graph
//! turns those declarations into a deployment order, its reverse for
//! teardown, and waves of stacks that can be processed concurrently.
//!
//! Building the graph is a pure function of the declared metadata. Any
//! inconsistency (cycle, unresolved import, duplicate declaration) is
//! reported before anything is touched.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod graph;

pub use error::{GraphError, Result};
pub use graph::DependencyGraph;
