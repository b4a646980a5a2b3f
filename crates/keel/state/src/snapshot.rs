//! Persisted view of one stack

use chrono::{DateTime, Utc};
use keel_types::{CapacityGroup, ExportName, ResourceId, StackId, StackSpec, StackState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything Keel remembers about a stack between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSnapshot {
    pub stack_id: StackId,

    /// Resting state the last run ended in
    pub state: StackState,

    /// Declaration that was last applied in full
    pub last_deployed: Option<StackSpec>,

    /// Tracked capacity groups and their units
    #[serde(default)]
    pub groups: Vec<CapacityGroup>,

    /// Export values published by the last successful deployment
    #[serde(default)]
    pub exports: BTreeMap<ExportName, String>,

    /// Bumped on every save
    pub generation: u64,

    pub updated_at: DateTime<Utc>,
}

impl StackSnapshot {
    /// Snapshot of a stack that has never been deployed.
    pub fn new(stack_id: StackId) -> Self {
        Self {
            stack_id,
            state: StackState::Pending,
            last_deployed: None,
            groups: Vec::new(),
            exports: BTreeMap::new(),
            generation: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn group(&self, id: &ResourceId) -> Option<&CapacityGroup> {
        self.groups.iter().find(|g| &g.id == id)
    }

    pub fn is_deployed(&self) -> bool {
        self.last_deployed.is_some()
    }

    /// Advance the generation before a save.
    pub fn touch(&mut self) {
        self.generation += 1;
        self.updated_at = Utc::now();
    }
}
