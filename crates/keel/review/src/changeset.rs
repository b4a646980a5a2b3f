//! Change set types

use keel_types::{ResourceId, StackId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What applying a change item does to its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeAction {
    /// New resource with no prior counterpart
    Add,
    /// In-place update of mutable attributes
    Modify,
    /// Resource is deleted
    Remove,
    /// Resource is deleted and recreated
    Replace,
}

impl ChangeAction {
    /// Whether the action destroys the existing resource.
    pub fn is_destructive(&self) -> bool {
        matches!(self, ChangeAction::Remove | ChangeAction::Replace)
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::Add => write!(f, "Add"),
            ChangeAction::Modify => write!(f, "Modify"),
            ChangeAction::Remove => write!(f, "Remove"),
            ChangeAction::Replace => write!(f, "Replace"),
        }
    }
}

/// One attribute that differs between the two declarations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub name: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    /// Declared immutable in place
    pub immutable: bool,
}

/// A classified change to one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeItem {
    pub resource_id: ResourceId,
    pub resource_type: String,
    pub action: ChangeAction,
    pub risky: bool,
    pub changes: Vec<AttributeChange>,
    /// Why the action and risk flag were chosen
    pub reasons: Vec<String>,
}

/// An immutable, ordered list of change items for one stack
///
/// Items are ordered by resource id. The fingerprint is a SHA-256 over the
/// canonical JSON of the stack id and items, so an approval given for one
/// fingerprint cannot be replayed against a different change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    stack_id: StackId,
    items: Vec<ChangeItem>,
    fingerprint: String,
}

#[derive(Serialize)]
struct Canonical<'a> {
    stack_id: &'a StackId,
    items: &'a [ChangeItem],
}

impl ChangeSet {
    pub(crate) fn new(stack_id: StackId, items: Vec<ChangeItem>) -> Self {
        let fingerprint = fingerprint(&stack_id, &items);
        Self {
            stack_id,
            items,
            fingerprint,
        }
    }

    pub fn stack_id(&self) -> &StackId {
        &self.stack_id
    }

    pub fn items(&self) -> &[ChangeItem] {
        &self.items
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// First twelve hex digits, for display.
    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..self.fingerprint.len().min(12)]
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn risky_items(&self) -> impl Iterator<Item = &ChangeItem> {
        self.items.iter().filter(|i| i.risky)
    }

    pub fn is_risky(&self) -> bool {
        self.items.iter().any(|i| i.risky)
    }

    pub fn item(&self, resource_id: &ResourceId) -> Option<&ChangeItem> {
        self.items.iter().find(|i| &i.resource_id == resource_id)
    }

    /// Count of items per action, in Add/Modify/Remove/Replace order.
    pub fn summary(&self) -> [(ChangeAction, usize); 4] {
        let count = |action| self.items.iter().filter(|i| i.action == action).count();
        [
            (ChangeAction::Add, count(ChangeAction::Add)),
            (ChangeAction::Modify, count(ChangeAction::Modify)),
            (ChangeAction::Remove, count(ChangeAction::Remove)),
            (ChangeAction::Replace, count(ChangeAction::Replace)),
        ]
    }
}

fn fingerprint(stack_id: &StackId, items: &[ChangeItem]) -> String {
    // Maps in the item tree are BTreeMap-backed, so the encoding is stable
    let canonical = serde_json::to_vec(&Canonical { stack_id, items }).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, action: ChangeAction) -> ChangeItem {
        ChangeItem {
            resource_id: ResourceId::new(id),
            resource_type: "Test::Thing".into(),
            action,
            risky: false,
            changes: Vec::new(),
            reasons: Vec::new(),
        }
    }

    #[test]
    fn test_fingerprint_binds_contents() {
        let a = ChangeSet::new(StackId::new("app"), vec![item("lb", ChangeAction::Modify)]);
        let b = ChangeSet::new(StackId::new("app"), vec![item("lb", ChangeAction::Modify)]);
        let c = ChangeSet::new(StackId::new("app"), vec![item("lb", ChangeAction::Replace)]);
        let d = ChangeSet::new(StackId::new("web"), vec![item("lb", ChangeAction::Modify)]);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(a.fingerprint(), d.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
        assert_eq!(a.short_fingerprint().len(), 12);
    }

    #[test]
    fn test_summary_counts() {
        let set = ChangeSet::new(
            StackId::new("app"),
            vec![
                item("a", ChangeAction::Add),
                item("b", ChangeAction::Add),
                item("c", ChangeAction::Replace),
            ],
        );
        assert_eq!(
            set.summary(),
            [
                (ChangeAction::Add, 2),
                (ChangeAction::Modify, 0),
                (ChangeAction::Remove, 0),
                (ChangeAction::Replace, 1),
            ]
        );
        assert!(!set.is_risky());
    }
}
