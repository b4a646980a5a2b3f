//! Storage trait

use crate::error::Result;
use crate::snapshot::StackSnapshot;
use async_trait::async_trait;
use keel_registry::RegistrySnapshot;
use keel_types::StackId;

/// Durable home of the export registry and stack snapshots
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the registry; empty if nothing was saved yet.
    async fn load_registry(&self) -> Result<RegistrySnapshot>;

    async fn save_registry(&self, registry: &RegistrySnapshot) -> Result<()>;

    async fn load_stack(&self, id: &StackId) -> Result<Option<StackSnapshot>>;

    /// Replace the stored snapshot of a stack in one step.
    async fn save_stack(&self, snapshot: &StackSnapshot) -> Result<()>;

    async fn delete_stack(&self, id: &StackId) -> Result<()>;

    /// All stored snapshots, ordered by stack id.
    async fn list_stacks(&self) -> Result<Vec<StackSnapshot>>;
}
