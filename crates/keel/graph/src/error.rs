//! Graph error types

use keel_types::{ExportName, StackId, StackValidationError};
use thiserror::Error;

/// Dependency graph errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Each stack in `chain` imports from the next; the last repeats the first
    #[error("import cycle: {}", format_chain(.chain))]
    Cycle { chain: Vec<StackId> },

    #[error("stack {stack} imports '{export}', which no stack exports")]
    UnresolvedImport { stack: StackId, export: ExportName },

    #[error("stack {0} is declared more than once")]
    DuplicateStack(StackId),

    #[error("export '{export}' is declared by both {first} and {second}")]
    DuplicateExport {
        export: ExportName,
        first: StackId,
        second: StackId,
    },

    #[error(transparent)]
    InvalidStack(#[from] StackValidationError),
}

fn format_chain(chain: &[StackId]) -> String {
    chain
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;
