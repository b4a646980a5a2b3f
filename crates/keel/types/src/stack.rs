//! Stack specifications and the per-stack lifecycle state machine

use crate::capacity::CapacityGroupSpec;
use crate::ids::{ExportName, ResourceId, StackId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Declared contents of one stack
///
/// Resource declarations are opaque to Keel beyond their type, their
/// property values and which properties cannot change in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackSpec {
    pub id: StackId,

    /// Export names this stack consumes, in declaration order
    #[serde(default)]
    pub imports: Vec<ExportName>,

    /// Export name -> declared value published once the stack is deployed
    #[serde(default)]
    pub exports: BTreeMap<ExportName, String>,

    #[serde(default)]
    pub resources: BTreeMap<ResourceId, ResourceSpec>,
}

/// One declared resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceSpec {
    #[serde(rename = "Type")]
    pub resource_type: String,

    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,

    /// Properties whose change forces the resource to be replaced
    #[serde(default)]
    pub immutable_properties: BTreeSet<String>,

    /// Exports whose values this resource provides
    #[serde(default)]
    pub backs_exports: BTreeSet<ExportName>,

    /// Present when the resource is a capacity group
    #[serde(default)]
    pub capacity_group: Option<CapacityGroupSpec>,
}

/// Problems found when validating a single stack declaration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackValidationError {
    #[error("stack {stack}: import '{export}' is declared more than once")]
    DuplicateImport { stack: StackId, export: ExportName },

    #[error("stack {stack}: resource {resource} backs undeclared export '{export}'")]
    UndeclaredBackedExport {
        stack: StackId,
        resource: ResourceId,
        export: ExportName,
    },

    #[error("stack {stack}: capacity group {resource}: {reason}")]
    InvalidCapacityGroup {
        stack: StackId,
        resource: ResourceId,
        reason: String,
    },
}

impl StackSpec {
    pub fn new(id: impl Into<StackId>) -> Self {
        Self {
            id: id.into(),
            imports: Vec::new(),
            exports: BTreeMap::new(),
            resources: BTreeMap::new(),
        }
    }

    pub fn with_import(mut self, export: impl Into<ExportName>) -> Self {
        self.imports.push(export.into());
        self
    }

    pub fn with_export(mut self, name: impl Into<ExportName>, value: impl Into<String>) -> Self {
        self.exports.insert(name.into(), value.into());
        self
    }

    pub fn with_resource(mut self, id: impl Into<ResourceId>, resource: ResourceSpec) -> Self {
        self.resources.insert(id.into(), resource);
        self
    }

    /// Capacity group resources, in resource id order.
    pub fn capacity_groups(&self) -> impl Iterator<Item = (&ResourceId, &CapacityGroupSpec)> {
        self.resources
            .iter()
            .filter_map(|(id, r)| r.capacity_group.as_ref().map(|g| (id, g)))
    }

    pub fn validate(&self) -> Result<(), StackValidationError> {
        let mut seen = BTreeSet::new();
        for import in &self.imports {
            if !seen.insert(import) {
                return Err(StackValidationError::DuplicateImport {
                    stack: self.id.clone(),
                    export: import.clone(),
                });
            }
        }

        for (resource_id, resource) in &self.resources {
            if let Some(export) = resource
                .backs_exports
                .iter()
                .find(|e| !self.exports.contains_key(*e))
            {
                return Err(StackValidationError::UndeclaredBackedExport {
                    stack: self.id.clone(),
                    resource: resource_id.clone(),
                    export: export.clone(),
                });
            }
            if let Some(group) = &resource.capacity_group {
                group
                    .validate()
                    .map_err(|reason| StackValidationError::InvalidCapacityGroup {
                        stack: self.id.clone(),
                        resource: resource_id.clone(),
                        reason,
                    })?;
            }
        }

        Ok(())
    }
}

impl ResourceSpec {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties: BTreeMap::new(),
            immutable_properties: BTreeSet::new(),
            backs_exports: BTreeSet::new(),
            capacity_group: None,
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Declare a property immutable-in-place.
    pub fn immutable(mut self, name: impl Into<String>) -> Self {
        self.immutable_properties.insert(name.into());
        self
    }

    pub fn backing(mut self, export: impl Into<ExportName>) -> Self {
        self.backs_exports.insert(export.into());
        self
    }

    pub fn with_capacity_group(mut self, group: CapacityGroupSpec) -> Self {
        self.capacity_group = Some(group);
        self
    }
}

/// Lifecycle state of a stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackState {
    /// Waiting for its imports to resolve
    Pending,
    /// Computing the change set
    Planning,
    /// Change set computed, waiting for approval
    AwaitingReview,
    /// Provisioning accepted the change and is applying it
    Applying,
    /// Waiting for resource signals and rolling updates
    Settling,
    /// Fully applied, exports published
    Deployed,
    /// Apply or settle failed
    Failed,
    /// Reverting to the last deployed spec
    RollingBack,
}

impl StackState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: StackState) -> bool {
        use StackState::*;
        matches!(
            (self, next),
            (Pending, Planning)
                | (Planning, AwaitingReview)
                | (Planning, Deployed)
                | (AwaitingReview, Applying)
                // review declined: back to the resting state the run started from
                | (AwaitingReview, Pending)
                | (AwaitingReview, Deployed)
                | (Applying, Settling)
                | (Applying, Failed)
                | (Settling, Deployed)
                | (Settling, Failed)
                | (Failed, RollingBack)
                | (RollingBack, Deployed)
                | (RollingBack, Failed)
                // re-entry on the next deployment invocation
                | (Deployed, Pending)
                | (Failed, Pending)
        )
    }

    /// States a run can end in.
    pub fn is_resting(&self) -> bool {
        matches!(
            self,
            StackState::Pending | StackState::Deployed | StackState::Failed
        )
    }
}

impl std::fmt::Display for StackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StackState::Pending => "Pending",
            StackState::Planning => "Planning",
            StackState::AwaitingReview => "AwaitingReview",
            StackState::Applying => "Applying",
            StackState::Settling => "Settling",
            StackState::Deployed => "Deployed",
            StackState::Failed => "Failed",
            StackState::RollingBack => "RollingBack",
        };
        f.write_str(name)
    }
}
