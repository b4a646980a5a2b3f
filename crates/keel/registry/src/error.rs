//! Registry error types

use keel_types::{ExportName, StackId};
use thiserror::Error;

/// Export registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown export '{0}'")]
    UnknownExport(ExportName),

    #[error("export '{export}' is owned by stack {owner}, not {requested_by}")]
    ExportOwnedElsewhere {
        export: ExportName,
        owner: StackId,
        requested_by: StackId,
    },

    #[error("export '{export}' of stack {owner} is still imported by {}", format_consumers(.consumers))]
    ExportInUse {
        export: ExportName,
        owner: StackId,
        consumers: Vec<StackId>,
    },
}

fn format_consumers(consumers: &[StackId]) -> String {
    consumers
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
