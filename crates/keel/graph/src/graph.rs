//! Dependency graph over stacks

use crate::error::{GraphError, Result};
use keel_types::{ExportName, StackId, StackSpec};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A validated, acyclic graph of stacks
///
/// Edges run from a producing stack to every stack importing one of its
/// exports. Orderings are deterministic: among stacks that are ready at the
/// same time the lexicographically smallest id goes first.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// stack -> stacks it imports from
    dependencies: BTreeMap<StackId, BTreeSet<StackId>>,
    /// stack -> stacks importing from it
    dependents: BTreeMap<StackId, BTreeSet<StackId>>,
    /// export -> producing stack within the set
    producers: BTreeMap<ExportName, StackId>,
    order: Vec<StackId>,
}

impl DependencyGraph {
    /// Build the graph for a self-contained stack set.
    pub fn build(stacks: &[StackSpec]) -> Result<Self> {
        Self::build_with_external(stacks, &BTreeSet::new())
    }

    /// Build the graph, treating `external` exports (already published by
    /// stacks outside the set) as resolvable without an edge.
    pub fn build_with_external(
        stacks: &[StackSpec],
        external: &BTreeSet<ExportName>,
    ) -> Result<Self> {
        let mut dependencies: BTreeMap<StackId, BTreeSet<StackId>> = BTreeMap::new();
        for stack in stacks {
            if dependencies.insert(stack.id.clone(), BTreeSet::new()).is_some() {
                return Err(GraphError::DuplicateStack(stack.id.clone()));
            }
            stack.validate()?;
        }

        let mut producers: BTreeMap<ExportName, StackId> = BTreeMap::new();
        for stack in stacks {
            for export in stack.exports.keys() {
                if let Some(first) = producers.insert(export.clone(), stack.id.clone()) {
                    return Err(GraphError::DuplicateExport {
                        export: export.clone(),
                        first,
                        second: stack.id.clone(),
                    });
                }
            }
        }

        let mut dependents: BTreeMap<StackId, BTreeSet<StackId>> = dependencies
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();

        let mut sorted: Vec<&StackSpec> = stacks.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        for stack in sorted {
            for import in &stack.imports {
                match producers.get(import) {
                    Some(producer) => {
                        dependencies
                            .entry(stack.id.clone())
                            .or_default()
                            .insert(producer.clone());
                        dependents
                            .entry(producer.clone())
                            .or_default()
                            .insert(stack.id.clone());
                    }
                    None if external.contains(import) => {}
                    None => {
                        return Err(GraphError::UnresolvedImport {
                            stack: stack.id.clone(),
                            export: import.clone(),
                        });
                    }
                }
            }
        }

        let order = topological_order(&dependencies, &dependents)?;
        debug!(stacks = order.len(), "Dependency graph built");

        Ok(Self {
            dependencies,
            dependents,
            producers,
            order,
        })
    }

    /// Every stack after all stacks it imports from.
    pub fn build_order(&self) -> &[StackId] {
        &self.order
    }

    /// The exact reverse of [`build_order`](Self::build_order).
    pub fn teardown_order(&self) -> Vec<StackId> {
        self.order.iter().rev().cloned().collect()
    }

    /// Stacks grouped into waves.
    ///
    /// A stack's wave is one past the deepest wave among its dependencies,
    /// so members of the same wave share no import path and may be processed
    /// concurrently. Waves are listed in deployment order.
    pub fn levels(&self) -> Vec<Vec<StackId>> {
        let mut depth: BTreeMap<&StackId, usize> = BTreeMap::new();
        let mut levels: Vec<Vec<StackId>> = Vec::new();

        for stack in &self.order {
            let level = self.dependencies[stack]
                .iter()
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(stack, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(stack.clone());
        }

        for level in &mut levels {
            level.sort();
        }
        levels
    }

    /// Stacks `stack` imports from directly.
    pub fn dependencies_of(&self, stack: &StackId) -> BTreeSet<StackId> {
        self.dependencies.get(stack).cloned().unwrap_or_default()
    }

    /// Stacks importing from `stack` directly.
    pub fn dependents_of(&self, stack: &StackId) -> BTreeSet<StackId> {
        self.dependents.get(stack).cloned().unwrap_or_default()
    }

    /// Stack in the set declaring `export`.
    pub fn producer_of(&self, export: &ExportName) -> Option<&StackId> {
        self.producers.get(export)
    }

    pub fn contains(&self, stack: &StackId) -> bool {
        self.dependencies.contains_key(stack)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Kahn's algorithm with a sorted ready set.
fn topological_order(
    dependencies: &BTreeMap<StackId, BTreeSet<StackId>>,
    dependents: &BTreeMap<StackId, BTreeSet<StackId>>,
) -> Result<Vec<StackId>> {
    let mut in_degree: BTreeMap<&StackId, usize> = dependencies
        .iter()
        .map(|(id, deps)| (id, deps.len()))
        .collect();

    let mut ready: BTreeSet<&StackId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(stack) = ready.pop_first() {
        order.push(stack.clone());
        for dependent in dependents.get(stack).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() < dependencies.len() {
        let placed: BTreeSet<&StackId> = order.iter().collect();
        let remaining: BTreeSet<&StackId> = dependencies
            .keys()
            .filter(|id| !placed.contains(id))
            .collect();
        return Err(GraphError::Cycle {
            chain: find_cycle(dependencies, &remaining),
        });
    }

    Ok(order)
}

/// Walk dependency edges among the stacks Kahn's algorithm could not place.
///
/// Every such stack still has an unplaced dependency, so the walk must
/// revisit a stack; the path from its first visit is the cycle.
fn find_cycle(
    dependencies: &BTreeMap<StackId, BTreeSet<StackId>>,
    remaining: &BTreeSet<&StackId>,
) -> Vec<StackId> {
    let Some(start) = remaining.first() else {
        return Vec::new();
    };

    let mut path: Vec<&StackId> = vec![start];
    let mut current: &StackId = start;
    loop {
        let next = dependencies
            .get(current)
            .into_iter()
            .flatten()
            .find(|dep| remaining.contains(dep));
        let Some(next) = next else {
            return path.into_iter().cloned().collect();
        };
        if let Some(pos) = path.iter().position(|p| *p == next) {
            let mut chain: Vec<StackId> = path[pos..].iter().map(|s| (*s).clone()).collect();
            chain.push(next.clone());
            return chain;
        }
        path.push(next);
        current = next;
    }
}
