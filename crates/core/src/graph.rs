//! Migration dependency graph
//!
//! Uses `petgraph::StableGraph` so node indices stay valid while squashed
//! migrations are folded in and their originals removed. Edges point from
//! parent to child: a parent must be applied before any of its children.
//!
//! Edges may be added before both endpoints are known. Missing endpoints
//! become placeholder nodes that remember which migration declared them;
//! [`MigrationGraph::validate_consistency`] turns any placeholder still
//! present into a `NodeNotFound` error. This keeps validation a single
//! pass after squash folding instead of an incremental check.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::Direction;
use tracing::debug;

use crate::error::{MigrationError, Result};
use crate::key::MigrationKey;
use crate::migration::Migration;

/// What a graph node stands for.
enum NodeSlot<S> {
    Migration(Arc<Migration<S>>),
    /// Referenced by an edge but never registered.
    Placeholder { origin: MigrationKey },
}

struct GraphNode<S> {
    key: MigrationKey,
    slot: NodeSlot<S>,
}

impl<S> GraphNode<S> {
    fn migration(&self) -> Option<&Arc<Migration<S>>> {
        match &self.slot {
            NodeSlot::Migration(migration) => Some(migration),
            NodeSlot::Placeholder { .. } => None,
        }
    }
}

pub struct MigrationGraph<S> {
    inner: StableGraph<GraphNode<S>, ()>,
    /// Key to index map for O(1) lookups.
    index: HashMap<MigrationKey, NodeIndex>,
}

impl<S> MigrationGraph<S> {
    pub fn new() -> Self {
        Self {
            inner: StableGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Register a migration. Registering a key twice keeps the last one.
    pub fn add_node(&mut self, key: MigrationKey, migration: Arc<Migration<S>>) {
        match self.index.get(&key) {
            Some(&idx) => {
                if let Some(node) = self.inner.node_weight_mut(idx) {
                    node.slot = NodeSlot::Migration(migration);
                }
            }
            None => {
                let idx = self.inner.add_node(GraphNode {
                    key: key.clone(),
                    slot: NodeSlot::Migration(migration),
                });
                self.index.insert(key, idx);
            }
        }
    }

    /// Record that `parent` must be applied before `child`.
    ///
    /// With `skip_validation` unset, both endpoints must already be
    /// registered migrations. Otherwise missing endpoints are kept as
    /// placeholders attributed to `origin`.
    pub fn add_dependency(
        &mut self,
        origin: &MigrationKey,
        child: &MigrationKey,
        parent: &MigrationKey,
        skip_validation: bool,
    ) -> Result<()> {
        if !skip_validation {
            for key in [child, parent] {
                if !self.contains(key) {
                    return Err(node_not_found(
                        origin,
                        key,
                        format!("Migration {} dependencies reference nonexistent node {}", origin, key),
                    ));
                }
            }
        }
        let child_idx = self.index_or_placeholder(child, origin);
        let parent_idx = self.index_or_placeholder(parent, origin);
        self.inner.update_edge(parent_idx, child_idx, ());
        Ok(())
    }

    fn index_or_placeholder(&mut self, key: &MigrationKey, origin: &MigrationKey) -> NodeIndex {
        if let Some(&idx) = self.index.get(key) {
            return idx;
        }
        let idx = self.inner.add_node(GraphNode {
            key: key.clone(),
            slot: NodeSlot::Placeholder {
                origin: origin.clone(),
            },
        });
        self.index.insert(key.clone(), idx);
        idx
    }

    /// Whether `key` is a registered migration (placeholders do not count).
    pub fn contains(&self, key: &MigrationKey) -> bool {
        self.node(key).is_some()
    }

    pub fn node(&self, key: &MigrationKey) -> Option<&Arc<Migration<S>>> {
        self.index
            .get(key)
            .and_then(|&idx| self.inner.node_weight(idx))
            .and_then(GraphNode::migration)
    }

    /// Every registered migration key, sorted.
    pub fn keys(&self) -> Vec<MigrationKey> {
        let mut keys: Vec<MigrationKey> = self
            .inner
            .node_weights()
            .filter(|n| n.migration().is_some())
            .map(|n| n.key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn node_count(&self) -> usize {
        self.inner
            .node_weights()
            .filter(|n| n.migration().is_some())
            .count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn parents(&self, key: &MigrationKey) -> BTreeSet<MigrationKey> {
        self.neighbors(key, Direction::Incoming)
    }

    pub fn children(&self, key: &MigrationKey) -> BTreeSet<MigrationKey> {
        self.neighbors(key, Direction::Outgoing)
    }

    fn neighbors(&self, key: &MigrationKey, dir: Direction) -> BTreeSet<MigrationKey> {
        let Some(&idx) = self.index.get(key) else {
            return BTreeSet::new();
        };
        self.inner
            .neighbors_directed(idx, dir)
            .filter_map(|n| self.inner.node_weight(n))
            .map(|n| n.key.clone())
            .collect()
    }

    fn remove_key(&mut self, key: &MigrationKey) {
        if let Some(idx) = self.index.remove(key) {
            self.inner.remove_node(idx);
        }
    }

    fn link(&mut self, parent: &MigrationKey, child: &MigrationKey) {
        if let (Some(&p), Some(&c)) = (self.index.get(parent), self.index.get(child)) {
            self.inner.update_edge(p, c, ());
        }
    }

    /// Fold a squash migration in place of the migrations it replaces.
    ///
    /// Dependents of any replaced key now depend on `replacement`, and
    /// `replacement` inherits every parent of the replaced keys that is not
    /// itself replaced. The replaced nodes are then dropped.
    pub fn remove_replaced_nodes(
        &mut self,
        replacement: &MigrationKey,
        replaced: &[MigrationKey],
    ) -> Result<()> {
        if !self.index.contains_key(replacement) {
            return Err(node_not_found(
                replacement,
                replacement,
                format!(
                    "Unable to find replacement node {}. It was either never added to the migration graph, or has been removed.",
                    replacement
                ),
            ));
        }
        let replaced_set: HashSet<&MigrationKey> = replaced.iter().collect();
        for replaced_key in replaced {
            if !self.index.contains_key(replaced_key) {
                continue;
            }
            for child in self.children(replaced_key) {
                if !replaced_set.contains(&child) && &child != replacement {
                    self.link(replacement, &child);
                }
            }
            for parent in self.parents(replaced_key) {
                if !replaced_set.contains(&parent) && &parent != replacement {
                    self.link(&parent, replacement);
                }
            }
            self.remove_key(replaced_key);
        }
        debug!(%replacement, replaced = replaced.len(), "folded squashed migration");
        Ok(())
    }

    /// Drop an unusable squash migration and hand its dependents back to
    /// the original chain.
    ///
    /// Every dependent of `replacement` is re-pointed to the tail of the
    /// replaced chain: the replaced keys still in the graph that are not a
    /// parent of another replaced key. For a linear chain this is the last
    /// key of `replaced`. When none of the replaced keys is in the graph the
    /// last one is linked as a placeholder, so the dependency is reported
    /// instead of dropped.
    pub fn remove_replacement_node(
        &mut self,
        replacement: &MigrationKey,
        replaced: &[MigrationKey],
    ) -> Result<()> {
        if !self.index.contains_key(replacement) {
            return Err(node_not_found(
                replacement,
                replacement,
                format!(
                    "Unable to remove replacement node {}. It was either never added to the migration graph, or has been removed already.",
                    replacement
                ),
            ));
        }
        let present: Vec<&MigrationKey> = replaced
            .iter()
            .filter(|k| self.index.contains_key(*k))
            .collect();
        let mut replaced_parents = HashSet::new();
        for key in &present {
            replaced_parents.extend(self.parents(key));
        }
        let mut tails: Vec<MigrationKey> = present
            .into_iter()
            .filter(|k| !replaced_parents.contains(*k))
            .cloned()
            .collect();
        if tails.is_empty() {
            tails.extend(replaced.last().cloned());
        }

        let children = self.children(replacement);
        self.remove_key(replacement);
        for child in &children {
            for tail in &tails {
                // A tail that is gone from disk stays behind as a placeholder
                let parent_idx = self.index_or_placeholder(tail, child);
                if let Some(&child_idx) = self.index.get(child) {
                    self.inner.update_edge(parent_idx, child_idx, ());
                }
            }
        }
        debug!(%replacement, "removed unusable squashed migration");
        Ok(())
    }

    /// Fail if any edge references a node that was never registered.
    pub fn validate_consistency(&self) -> Result<()> {
        let mut dangling: Vec<(&MigrationKey, &MigrationKey)> = self
            .inner
            .node_weights()
            .filter_map(|n| match &n.slot {
                NodeSlot::Placeholder { origin } => Some((&n.key, origin)),
                NodeSlot::Migration(_) => None,
            })
            .collect();
        dangling.sort();
        match dangling.first() {
            Some((node, origin)) => Err(node_not_found(
                origin,
                node,
                format!(
                    "Migration {} dependencies reference nonexistent parent node {}",
                    origin, node
                ),
            )),
            None => Ok(()),
        }
    }

    /// Depth-first cycle detection. The error lists the offending chain,
    /// closed by repeating its first node.
    pub fn ensure_acyclic(&self) -> Result<()> {
        let mut todo: BTreeSet<MigrationKey> =
            self.inner.node_weights().map(|n| n.key.clone()).collect();
        while let Some(start) = todo.pop_first() {
            let mut stack = vec![start];
            while let Some(top) = stack.last().cloned() {
                let mut descended = false;
                for child in self.children(&top) {
                    if let Some(pos) = stack.iter().position(|k| *k == child) {
                        let mut cycle = stack[pos..].to_vec();
                        cycle.push(child);
                        return Err(MigrationError::CircularDependency { cycle });
                    }
                    if todo.remove(&child) {
                        stack.push(child);
                        descended = true;
                        break;
                    }
                }
                if !descended {
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    /// Migrations with no child in their own component, sorted.
    ///
    /// Children in other components do not count: a component's latest
    /// migration stays its leaf even when another component builds on it.
    pub fn leaf_nodes(&self, component: Option<&str>) -> Vec<MigrationKey> {
        self.boundary_nodes(component, Direction::Outgoing)
    }

    /// Migrations with no parent in their own component, sorted.
    pub fn root_nodes(&self, component: Option<&str>) -> Vec<MigrationKey> {
        self.boundary_nodes(component, Direction::Incoming)
    }

    fn boundary_nodes(&self, component: Option<&str>, dir: Direction) -> Vec<MigrationKey> {
        let mut keys: Vec<MigrationKey> = self
            .inner
            .node_indices()
            .filter_map(|idx| {
                let node = self.inner.node_weight(idx)?;
                node.migration()?;
                if component.is_some_and(|c| c != node.key.component) {
                    return None;
                }
                let has_same_component_neighbor = self
                    .inner
                    .neighbors_directed(idx, dir)
                    .filter_map(|n| self.inner.node_weight(n))
                    .any(|n| n.migration().is_some() && n.key.component == node.key.component);
                (!has_same_component_neighbor).then(|| node.key.clone())
            })
            .collect();
        keys.sort();
        keys
    }

    /// `target` and all its ancestors, parents before children.
    pub fn forwards_plan(&self, target: &MigrationKey) -> Result<Vec<MigrationKey>> {
        self.ordered_closure(target, Direction::Incoming)
    }

    /// `target` and all its descendants, children before parents.
    pub fn backwards_plan(&self, target: &MigrationKey) -> Result<Vec<MigrationKey>> {
        self.ordered_closure(target, Direction::Outgoing)
    }

    /// Iterative post-order DFS: every node is emitted after all of its
    /// neighbours in `dir`. Neighbours are visited in sorted order.
    fn ordered_closure(&self, target: &MigrationKey, dir: Direction) -> Result<Vec<MigrationKey>> {
        if !self.contains(target) {
            return Err(node_not_found(
                target,
                target,
                format!("Node {} not a valid node", target),
            ));
        }
        let mut visited = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(target.clone(), false)];
        while let Some((key, processed)) = stack.pop() {
            if seen.contains(&key) {
                continue;
            }
            if processed {
                seen.insert(key.clone());
                visited.push(key);
                continue;
            }
            let next = self.neighbors(&key, dir);
            stack.push((key, true));
            stack.extend(next.into_iter().map(|k| (k, false)));
        }
        Ok(visited)
    }

    /// The schema state after applying the forwards plans of `nodes`.
    ///
    /// With `at_end` unset the listed nodes themselves are left out, which
    /// gives the state right before them.
    pub fn make_state(&self, nodes: &[MigrationKey], at_end: bool, initial: S) -> Result<S> {
        let mut plan: Vec<MigrationKey> = Vec::new();
        let mut planned = HashSet::new();
        for node in nodes {
            for key in self.forwards_plan(node)? {
                if planned.contains(&key) || (!at_end && nodes.contains(&key)) {
                    continue;
                }
                planned.insert(key.clone());
                plan.push(key);
            }
        }
        let mut state = initial;
        for key in &plan {
            if let Some(migration) = self.node(key) {
                migration.mutate_state_in_place(&mut state);
            }
        }
        Ok(state)
    }
}

impl<S> Default for MigrationGraph<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn node_not_found(origin: &MigrationKey, node: &MigrationKey, message: String) -> MigrationError {
    MigrationError::NodeNotFound {
        origin: origin.clone(),
        node: node.clone(),
        message,
    }
}
