//! Change set computation and risk classification

use crate::changeset::{AttributeChange, ChangeAction, ChangeItem, ChangeSet};
use keel_registry::ConsumerSnapshot;
use keel_types::{CapacityGroupSpec, ExportName, ResourceId, ResourceSpec, StackSpec};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Prefix for capacity group settings in attribute names
const CAPACITY_GROUP: &str = "CapacityGroup";

/// Computes classified diffs between two declarations of a stack
///
/// Classification:
/// - resource only in the desired declaration: Add
/// - resource only in the current declaration: Remove
/// - type change, capacity group added or dropped, or a change to a
///   property declared immutable in either declaration: Replace
/// - any other property or capacity group setting change: Modify
///
/// Remove and Replace items are risky when another stack consumes an export
/// backed by the resource. A resource that declares no backing exports is
/// assumed to back all of its stack's exports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeSetReviewer;

impl ChangeSetReviewer {
    pub fn new() -> Self {
        Self
    }

    /// Diff `desired` against `current` (None on first deployment).
    pub fn compute(
        &self,
        current: Option<&StackSpec>,
        desired: &StackSpec,
        consumers: &ConsumerSnapshot,
    ) -> ChangeSet {
        let empty = BTreeMap::new();
        let before = current.map(|c| &c.resources).unwrap_or(&empty);
        let after = &desired.resources;

        let ids: BTreeSet<&ResourceId> = before.keys().chain(after.keys()).collect();
        let mut items = Vec::new();

        for id in ids {
            let item = match (before.get(id), after.get(id)) {
                (None, Some(added)) => Some(ChangeItem {
                    resource_id: id.clone(),
                    resource_type: added.resource_type.clone(),
                    action: ChangeAction::Add,
                    risky: false,
                    changes: Vec::new(),
                    reasons: vec!["declared for the first time".to_string()],
                }),
                (Some(removed), None) => {
                    let mut item = ChangeItem {
                        resource_id: id.clone(),
                        resource_type: removed.resource_type.clone(),
                        action: ChangeAction::Remove,
                        risky: false,
                        changes: Vec::new(),
                        reasons: vec!["no longer declared".to_string()],
                    };
                    flag_risk(&mut item, &removed.backs_exports, desired, consumers);
                    Some(item)
                }
                (Some(old), Some(new)) => diff_resource(id, old, new, desired, consumers),
                (None, None) => None,
            };
            items.extend(item);
        }

        let change_set = ChangeSet::new(desired.id.clone(), items);
        debug!(
            stack_id = %desired.id,
            items = change_set.len(),
            fingerprint = %change_set.short_fingerprint(),
            "Change set computed"
        );
        change_set
    }
}

fn diff_resource(
    id: &ResourceId,
    old: &ResourceSpec,
    new: &ResourceSpec,
    desired: &StackSpec,
    consumers: &ConsumerSnapshot,
) -> Option<ChangeItem> {
    let mut changes = Vec::new();
    let mut reasons = Vec::new();
    let mut replace = false;

    if old.resource_type != new.resource_type {
        replace = true;
        reasons.push(format!(
            "type changes from {} to {}",
            old.resource_type, new.resource_type
        ));
        changes.push(AttributeChange {
            name: "Type".to_string(),
            before: Some(Value::String(old.resource_type.clone())),
            after: Some(Value::String(new.resource_type.clone())),
            immutable: true,
        });
    }

    let names: BTreeSet<&String> = old.properties.keys().chain(new.properties.keys()).collect();
    for name in names {
        let before = old.properties.get(name);
        let after = new.properties.get(name);
        if before == after {
            continue;
        }
        let immutable =
            old.immutable_properties.contains(name) || new.immutable_properties.contains(name);
        if immutable {
            replace = true;
            reasons.push(format!("{} is immutable in place", name));
        }
        changes.push(AttributeChange {
            name: name.clone(),
            before: before.cloned(),
            after: after.cloned(),
            immutable,
        });
    }

    match (&old.capacity_group, &new.capacity_group) {
        (Some(a), Some(b)) => changes.extend(diff_capacity_group(a, b)),
        (None, None) => {}
        (a, b) => {
            replace = true;
            reasons.push(if b.is_some() {
                "becomes a capacity group".to_string()
            } else {
                "stops being a capacity group".to_string()
            });
            changes.push(AttributeChange {
                name: CAPACITY_GROUP.to_string(),
                before: a.as_ref().and_then(|g| serde_json::to_value(g).ok()),
                after: b.as_ref().and_then(|g| serde_json::to_value(g).ok()),
                immutable: true,
            });
        }
    }

    if changes.is_empty() {
        return None;
    }

    let action = if replace {
        ChangeAction::Replace
    } else {
        reasons.push(format!("{} attribute(s) change in place", changes.len()));
        ChangeAction::Modify
    };

    let mut item = ChangeItem {
        resource_id: id.clone(),
        resource_type: new.resource_type.clone(),
        action,
        risky: false,
        changes,
        reasons,
    };
    if action == ChangeAction::Replace {
        let backing: BTreeSet<ExportName> = old
            .backs_exports
            .union(&new.backs_exports)
            .cloned()
            .collect();
        flag_risk(&mut item, &backing, desired, consumers);
    }
    Some(item)
}

/// Settings diffed field by field under their declared names.
fn diff_capacity_group(old: &CapacityGroupSpec, new: &CapacityGroupSpec) -> Vec<AttributeChange> {
    let (Ok(Value::Object(before)), Ok(Value::Object(after))) =
        (serde_json::to_value(old), serde_json::to_value(new))
    else {
        return Vec::new();
    };

    let fields: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    fields
        .into_iter()
        .filter(|field| before.get(*field) != after.get(*field))
        .map(|field| AttributeChange {
            name: format!("{}.{}", CAPACITY_GROUP, field),
            before: before.get(field).cloned(),
            after: after.get(field).cloned(),
            immutable: false,
        })
        .collect()
}

fn flag_risk(
    item: &mut ChangeItem,
    backing: &BTreeSet<ExportName>,
    desired: &StackSpec,
    consumers: &ConsumerSnapshot,
) {
    if backing.is_empty() {
        if consumers.stack_has_foreign_consumers(&desired.id) {
            item.risky = true;
            item.reasons.push(format!(
                "stack {} has exports in use and this resource declares none it backs",
                desired.id
            ));
        }
        return;
    }

    for export in backing {
        let foreign = consumers.foreign_consumers(export);
        if !foreign.is_empty() {
            item.risky = true;
            item.reasons.push(format!(
                "backs export '{}' imported by {}",
                export,
                foreign
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
    }
}
