//! In-memory state storage for tests and dry runs.

use super::traits::StateStore;
use crate::error::Result;
use crate::snapshot::StackSnapshot;
use async_trait::async_trait;
use dashmap::DashMap;
use keel_registry::RegistrySnapshot;
use keel_types::StackId;
use std::sync::RwLock;

/// In-memory state store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    registry: RwLock<RegistrySnapshot>,
    stacks: DashMap<StackId, StackSnapshot>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack_count(&self) -> usize {
        self.stacks.len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load_registry(&self) -> Result<RegistrySnapshot> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        Ok(registry.clone())
    }

    async fn save_registry(&self, registry: &RegistrySnapshot) -> Result<()> {
        let mut stored = self.registry.write().unwrap_or_else(|e| e.into_inner());
        *stored = registry.clone();
        Ok(())
    }

    async fn load_stack(&self, id: &StackId) -> Result<Option<StackSnapshot>> {
        Ok(self.stacks.get(id).map(|s| s.clone()))
    }

    async fn save_stack(&self, snapshot: &StackSnapshot) -> Result<()> {
        self.stacks
            .insert(snapshot.stack_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete_stack(&self, id: &StackId) -> Result<()> {
        self.stacks.remove(id);
        Ok(())
    }

    async fn list_stacks(&self) -> Result<Vec<StackSnapshot>> {
        let mut stacks: Vec<StackSnapshot> = self.stacks.iter().map(|s| s.clone()).collect();
        stacks.sort_by(|a, b| a.stack_id.cmp(&b.stack_id));
        Ok(stacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_registry::ExportRegistry;
    use keel_types::{ExportName, StackState};

    #[tokio::test]
    async fn test_stack_round_trip_and_listing() {
        let store = InMemoryStateStore::new();
        assert!(store.load_stack(&StackId::new("app")).await.unwrap().is_none());

        let mut app = StackSnapshot::new(StackId::new("app"));
        app.state = StackState::Deployed;
        store.save_stack(&app).await.unwrap();
        store
            .save_stack(&StackSnapshot::new(StackId::new("network")))
            .await
            .unwrap();

        let loaded = store.load_stack(&StackId::new("app")).await.unwrap().unwrap();
        assert_eq!(loaded.state, StackState::Deployed);

        let ids: Vec<String> = store
            .list_stacks()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.stack_id.to_string())
            .collect();
        assert_eq!(ids, vec!["app", "network"]);

        store.delete_stack(&StackId::new("app")).await.unwrap();
        assert_eq!(store.stack_count(), 1);
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.load_registry().await.unwrap(), RegistrySnapshot::default());

        let registry = ExportRegistry::new();
        registry
            .publish(&StackId::new("network"), &ExportName::new("vpc-id"), "vpc-1")
            .unwrap();
        store.save_registry(&registry.snapshot()).await.unwrap();

        let restored = ExportRegistry::from_snapshot(store.load_registry().await.unwrap());
        assert_eq!(restored.resolve(&ExportName::new("vpc-id")).unwrap().value, "vpc-1");
    }
}
