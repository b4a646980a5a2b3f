//! The export registry
//!
//! One instance is shared (behind an `Arc`) by every stack task of a run.
//! Reads take a shared lock, writes an exclusive one, so concurrent resolves
//! never observe an export mid-update.

use crate::error::{RegistryError, Result};
use chrono::{DateTime, Utc};
use keel_types::{ExportName, StackId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// A published export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub owner: StackId,
    pub name: ExportName,
    pub value: String,
    /// Incremented on every overwrite
    pub revision: u64,
    pub published_at: DateTime<Utc>,
}

/// Serializable registry contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub exports: BTreeMap<ExportName, Export>,
    /// Export name -> stacks holding an import lock on it
    pub locks: BTreeMap<ExportName, BTreeSet<StackId>>,
}

/// Who consumes what, captured at one instant
///
/// Handed to the change set reviewer so risk classification is a pure
/// function of its inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSnapshot {
    owners: BTreeMap<ExportName, StackId>,
    consumers: BTreeMap<ExportName, BTreeSet<StackId>>,
}

impl ConsumerSnapshot {
    /// Record `consumer` importing `export` owned by `owner`.
    pub fn with_consumer(
        mut self,
        owner: impl Into<StackId>,
        export: impl Into<ExportName>,
        consumer: impl Into<StackId>,
    ) -> Self {
        let export = export.into();
        self.owners.insert(export.clone(), owner.into());
        self.consumers
            .entry(export)
            .or_default()
            .insert(consumer.into());
        self
    }

    /// Consumers of `export` other than its owner.
    pub fn foreign_consumers(&self, export: &ExportName) -> Vec<StackId> {
        let owner = self.owners.get(export);
        self.consumers
            .get(export)
            .map(|set| {
                set.iter()
                    .filter(|c| Some(*c) != owner)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any export owned by `stack` has a foreign consumer.
    pub fn stack_has_foreign_consumers(&self, stack: &StackId) -> bool {
        self.owners
            .iter()
            .filter(|(_, owner)| *owner == stack)
            .any(|(export, _)| !self.foreign_consumers(export).is_empty())
    }
}

/// Process-wide registry of exported values
#[derive(Debug, Default)]
pub struct ExportRegistry {
    inner: RwLock<RegistrySnapshot>,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from persisted contents.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    /// Consistent copy of the full registry.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.read().clone()
    }

    /// Record or overwrite an export, bumping its revision.
    pub fn publish(
        &self,
        stack: &StackId,
        name: &ExportName,
        value: impl Into<String>,
    ) -> Result<Export> {
        let mut inner = self.write();
        check_owner(&inner, stack, name)?;

        let revision = inner.exports.get(name).map(|e| e.revision + 1).unwrap_or(1);
        let export = Export {
            owner: stack.clone(),
            name: name.clone(),
            value: value.into(),
            revision,
            published_at: Utc::now(),
        };
        inner.exports.insert(name.clone(), export.clone());

        debug!(stack_id = %stack, export = %name, revision, "Export published");
        Ok(export)
    }

    /// Replace a stack's whole export set in one step.
    ///
    /// New or changed values are written with a bumped revision; unchanged
    /// values keep theirs. Exports the stack previously owned but no longer
    /// declares are removed, which fails if a foreign consumer still holds
    /// them. On error nothing is modified. Returns the exports that changed.
    pub fn publish_all(
        &self,
        stack: &StackId,
        exports: &BTreeMap<ExportName, String>,
    ) -> Result<Vec<Export>> {
        let mut inner = self.write();

        for name in exports.keys() {
            check_owner(&inner, stack, name)?;
        }

        let dropped: Vec<ExportName> = inner
            .exports
            .values()
            .filter(|e| &e.owner == stack && !exports.contains_key(&e.name))
            .map(|e| e.name.clone())
            .collect();
        for name in &dropped {
            check_unlocked(&inner, stack, name)?;
        }

        for name in &dropped {
            inner.exports.remove(name);
            inner.locks.remove(name);
        }

        let now = Utc::now();
        let mut changed = Vec::new();
        for (name, value) in exports {
            let revision = match inner.exports.get(name) {
                Some(existing) if &existing.value == value => continue,
                Some(existing) => existing.revision + 1,
                None => 1,
            };
            let export = Export {
                owner: stack.clone(),
                name: name.clone(),
                value: value.clone(),
                revision,
                published_at: now,
            };
            inner.exports.insert(name.clone(), export.clone());
            changed.push(export);
        }

        info!(
            stack_id = %stack,
            changed = changed.len(),
            removed = dropped.len(),
            "Export set published"
        );
        Ok(changed)
    }

    /// Current value of an export.
    pub fn resolve(&self, name: &ExportName) -> Result<Export> {
        self.read()
            .exports
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownExport(name.clone()))
    }

    /// Whether `name` is currently published.
    pub fn contains(&self, name: &ExportName) -> bool {
        self.read().exports.contains_key(name)
    }

    /// Names of every published export.
    pub fn names(&self) -> BTreeSet<ExportName> {
        self.read().exports.keys().cloned().collect()
    }

    /// Exports owned by `stack`.
    pub fn exports_of(&self, stack: &StackId) -> Vec<Export> {
        self.read()
            .exports
            .values()
            .filter(|e| &e.owner == stack)
            .cloned()
            .collect()
    }

    /// Record that `consumer` imports `name`.
    pub fn lock(&self, name: &ExportName, consumer: &StackId) -> Result<()> {
        let mut inner = self.write();
        if !inner.exports.contains_key(name) {
            return Err(RegistryError::UnknownExport(name.clone()));
        }
        if inner
            .locks
            .entry(name.clone())
            .or_default()
            .insert(consumer.clone())
        {
            debug!(export = %name, consumer = %consumer, "Import lock taken");
        }
        Ok(())
    }

    /// Release `consumer`'s lock on `name`. Returns whether a lock was held.
    pub fn unlock(&self, name: &ExportName, consumer: &StackId) -> bool {
        let mut inner = self.write();
        let released = match inner.locks.get_mut(name) {
            Some(holders) => {
                let released = holders.remove(consumer);
                if holders.is_empty() {
                    inner.locks.remove(name);
                }
                released
            }
            None => false,
        };
        if released {
            debug!(export = %name, consumer = %consumer, "Import lock released");
        }
        released
    }

    /// Release every lock held by `consumer`.
    pub fn release_all(&self, consumer: &StackId) -> Vec<ExportName> {
        let mut inner = self.write();
        let mut released = Vec::new();
        inner.locks.retain(|name, holders| {
            if holders.remove(consumer) {
                released.push(name.clone());
            }
            !holders.is_empty()
        });
        released
    }

    /// Exports `consumer` currently holds locks on.
    pub fn locks_held_by(&self, consumer: &StackId) -> BTreeSet<ExportName> {
        self.read()
            .locks
            .iter()
            .filter(|(_, holders)| holders.contains(consumer))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// True unless some stack other than `stack` holds a lock on one of its
    /// exports. Has no side effects.
    pub fn can_retire(&self, stack: &StackId) -> bool {
        self.blocking_consumers(stack).is_empty()
    }

    /// (export, consumer) pairs preventing `stack` from retiring.
    pub fn blocking_consumers(&self, stack: &StackId) -> Vec<(ExportName, StackId)> {
        let inner = self.read();
        inner
            .exports
            .values()
            .filter(|e| &e.owner == stack)
            .flat_map(|e| {
                inner
                    .locks
                    .get(&e.name)
                    .into_iter()
                    .flatten()
                    .filter(|consumer| *consumer != stack)
                    .map(|consumer| (e.name.clone(), consumer.clone()))
            })
            .collect()
    }

    /// Remove every export owned by `stack`.
    pub fn retire(&self, stack: &StackId) -> Result<Vec<ExportName>> {
        let mut inner = self.write();
        let owned: Vec<ExportName> = inner
            .exports
            .values()
            .filter(|e| &e.owner == stack)
            .map(|e| e.name.clone())
            .collect();

        for name in &owned {
            check_unlocked(&inner, stack, name)?;
        }
        for name in &owned {
            inner.exports.remove(name);
            inner.locks.remove(name);
        }

        info!(stack_id = %stack, retired = owned.len(), "Stack exports retired");
        Ok(owned)
    }

    /// Remove one export owned by `stack`.
    pub fn remove_export(&self, stack: &StackId, name: &ExportName) -> Result<()> {
        let mut inner = self.write();
        let export = inner
            .exports
            .get(name)
            .ok_or_else(|| RegistryError::UnknownExport(name.clone()))?;
        if &export.owner != stack {
            return Err(RegistryError::ExportOwnedElsewhere {
                export: name.clone(),
                owner: export.owner.clone(),
                requested_by: stack.clone(),
            });
        }
        check_unlocked(&inner, stack, name)?;
        inner.exports.remove(name);
        inner.locks.remove(name);
        Ok(())
    }

    /// Consumer map for risk classification.
    pub fn consumers(&self) -> ConsumerSnapshot {
        let inner = self.read();
        ConsumerSnapshot {
            owners: inner
                .exports
                .values()
                .map(|e| (e.name.clone(), e.owner.clone()))
                .collect(),
            consumers: inner.locks.clone(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistrySnapshot> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistrySnapshot> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_owner(inner: &RegistrySnapshot, stack: &StackId, name: &ExportName) -> Result<()> {
    match inner.exports.get(name) {
        Some(existing) if &existing.owner != stack => Err(RegistryError::ExportOwnedElsewhere {
            export: name.clone(),
            owner: existing.owner.clone(),
            requested_by: stack.clone(),
        }),
        _ => Ok(()),
    }
}

fn check_unlocked(inner: &RegistrySnapshot, owner: &StackId, name: &ExportName) -> Result<()> {
    let consumers: Vec<StackId> = inner
        .locks
        .get(name)
        .into_iter()
        .flatten()
        .filter(|c| *c != owner)
        .cloned()
        .collect();
    if consumers.is_empty() {
        Ok(())
    } else {
        Err(RegistryError::ExportInUse {
            export: name.clone(),
            owner: owner.clone(),
            consumers,
        })
    }
}
