//! Builds the migration graph from authored migrations and the ledger.
//!
//! Squash migrations (those declaring `replaces`) are reconciled against the
//! applied set: when all or none of the replaced migrations are applied the
//! squash stands in for them, otherwise the squash is dropped and the
//! originals stay the graph truth. Rebuild the loader after applying
//! migrations; it holds no hidden state beyond what it was built from.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::LoaderConfig;
use crate::error::{MigrationError, Result};
use crate::graph::MigrationGraph;
use crate::key::{Dependency, MigrationKey};
use crate::ledger::{AppliedMap, AppliedRecord};
use crate::migration::Migration;
use crate::source::{DiskMigrations, MigrationSource};

/// How a squash migration enters the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldDecision {
    /// Every replaced migration is applied; the squash counts as applied.
    FoldApplied,
    /// None is applied; the squash replaces them and is pending.
    FoldUnapplied,
    /// Partially applied; the squash is unusable and removed.
    Unfold,
}

pub fn fold_decision(applied_statuses: &[bool]) -> FoldDecision {
    if applied_statuses.iter().all(|applied| *applied) {
        FoldDecision::FoldApplied
    } else if applied_statuses.iter().all(|applied| !*applied) {
        FoldDecision::FoldUnapplied
    } else {
        FoldDecision::Unfold
    }
}

pub struct MigrationLoader<S> {
    disk: DiskMigrations<S>,
    /// Ledger view with squash status folded in.
    applied: AppliedMap,
    replacements: BTreeMap<MigrationKey, Arc<Migration<S>>>,
    graph: MigrationGraph<S>,
    config: LoaderConfig,
}

impl<S> MigrationLoader<S> {
    /// Build the graph for `disk` given the ledger's applied rows.
    pub fn build(disk: DiskMigrations<S>, applied: AppliedMap, config: LoaderConfig) -> Result<Self> {
        let mut loader = Self {
            disk,
            applied,
            replacements: BTreeMap::new(),
            graph: MigrationGraph::new(),
            config,
        };
        loader.build_graph()?;
        Ok(loader)
    }

    pub fn from_source(
        source: &dyn MigrationSource<S>,
        applied: AppliedMap,
        config: LoaderConfig,
    ) -> Result<Self> {
        Self::build(source.load()?, applied, config)
    }

    /// Rebuild against a fresh ledger snapshot, keeping the disk set.
    pub fn rebuild(&mut self, applied: AppliedMap) -> Result<()> {
        self.applied = applied;
        self.build_graph()
    }

    fn build_graph(&mut self) -> Result<()> {
        self.graph = MigrationGraph::new();
        self.replacements.clear();

        let migrations: Vec<Arc<Migration<S>>> = self.disk.migrations.values().cloned().collect();

        for migration in &migrations {
            self.graph.add_node(migration.key().clone(), Arc::clone(migration));
            if migration.is_squash() {
                self.replacements
                    .insert(migration.key().clone(), Arc::clone(migration));
            }
        }

        // Same-component edges first so sentinel lookups see stable roots
        // and leaves for every component.
        for migration in &migrations {
            self.add_internal_dependencies(migration)?;
        }
        for migration in &migrations {
            self.add_external_dependencies(migration)?;
        }

        if self.config.replace_migrations {
            self.fold_replacements()?;
        }

        if let Err(err) = self.graph.validate_consistency() {
            return Err(self.clarify_missing_node(err));
        }
        self.graph.ensure_acyclic()?;

        info!(
            nodes = self.graph.node_count(),
            edges = self.graph.edge_count(),
            squashes = self.replacements.len(),
            "built migration graph"
        );
        Ok(())
    }

    fn add_internal_dependencies(&mut self, migration: &Migration<S>) -> Result<()> {
        let key = migration.key();
        for dependency in &migration.dependencies {
            if let Dependency::Concrete(parent) = dependency {
                if parent.component == key.component {
                    self.graph.add_dependency(key, key, parent, true)?;
                }
            }
        }
        Ok(())
    }

    fn add_external_dependencies(&mut self, migration: &Migration<S>) -> Result<()> {
        let key = migration.key();
        for dependency in &migration.dependencies {
            if dependency.component() == key.component {
                continue;
            }
            if let Some(parent) = self.check_key(dependency, &key.component)? {
                self.graph.add_dependency(key, key, &parent, true)?;
            }
        }
        for dependent in &migration.run_before {
            if let Some(child) = self.check_key(dependent, &key.component)? {
                self.graph.add_dependency(key, &child, key, true)?;
            }
        }
        Ok(())
    }

    fn fold_replacements(&mut self) -> Result<()> {
        let replacements: Vec<Arc<Migration<S>>> = self.replacements.values().cloned().collect();
        for squash in replacements {
            let key = squash.key();
            let statuses: Vec<bool> = squash
                .replaces
                .iter()
                .map(|replaced| self.applied.contains_key(replaced))
                .collect();
            let decision = fold_decision(&statuses);
            debug!(squash = %key, ?decision, "reconciling squashed migration");

            if decision == FoldDecision::FoldApplied {
                let applied_at = squash
                    .replaces
                    .iter()
                    .filter_map(|replaced| self.applied.get(replaced))
                    .map(|record| record.applied_at)
                    .max();
                let mut record = AppliedRecord::new(key);
                if let Some(applied_at) = applied_at {
                    record.applied_at = applied_at;
                }
                self.applied.insert(key.clone(), record);
            } else {
                self.applied.remove(key);
            }

            match decision {
                FoldDecision::FoldApplied | FoldDecision::FoldUnapplied => {
                    self.graph.remove_replaced_nodes(key, &squash.replaces)?
                }
                FoldDecision::Unfold => self.graph.remove_replacement_node(key, &squash.replaces)?,
            }
        }
        Ok(())
    }

    /// A missing node that an unusable squash would have replaced gets a
    /// message naming the squash.
    fn clarify_missing_node(&self, err: MigrationError) -> MigrationError {
        match err {
            MigrationError::NodeNotFound {
                origin,
                node,
                message,
            } => {
                let candidates: Vec<&MigrationKey> = self
                    .replacements
                    .iter()
                    .filter(|(_, squash)| squash.replaces.contains(&node))
                    .map(|(key, _)| key)
                    .collect();
                if candidates.is_empty() || candidates.iter().any(|c| self.graph.contains(c)) {
                    return MigrationError::NodeNotFound {
                        origin,
                        node,
                        message,
                    };
                }
                let tries: Vec<String> = candidates.iter().map(|c| c.to_string()).collect();
                let message = format!(
                    "Migration {} depends on nonexistent node {}. Tried to replace {} with any of [{}] but was not able to because some of the replaced migrations are already applied.",
                    origin,
                    node,
                    node,
                    tries.join(", ")
                );
                MigrationError::NodeNotFound {
                    origin,
                    node,
                    message,
                }
            }
            other => other,
        }
    }

    /// Resolve a declared dependency from a migration of `current` to a
    /// concrete key, or `None` when it should be ignored.
    pub fn check_key(&self, dependency: &Dependency, current: &str) -> Result<Option<MigrationKey>> {
        let component = match dependency {
            Dependency::Concrete(key) => return Ok(Some(key.clone())),
            Dependency::First(component) | Dependency::Latest(component) => component,
        };
        if component == current {
            return Ok(None);
        }
        // Schema owned elsewhere; nothing to order against.
        if self.disk.unmigrated.contains(component) {
            return Ok(None);
        }
        if self.disk.migrated.contains(component) {
            let candidates = if dependency.is_first() {
                self.graph.root_nodes(Some(component))
            } else {
                self.graph.leaf_nodes(Some(component))
            };
            return match candidates.into_iter().next() {
                Some(key) => Ok(Some(key)),
                None if self.config.ignore_no_migrations => Ok(None),
                None => Err(MigrationError::DependencyOnUnmigratedApp {
                    component: component.clone(),
                }),
            };
        }
        Err(MigrationError::DependencyOnUnknownApp {
            component: component.clone(),
        })
    }

    /// Fail if any applied migration has an unapplied parent.
    ///
    /// A squash parent counts as applied when everything it replaces is.
    pub fn check_consistent_history(&self, applied: &AppliedMap) -> Result<()> {
        for key in applied.keys() {
            if !self.graph.contains(key) {
                continue;
            }
            for parent in self.graph.parents(key) {
                if applied.contains_key(&parent) {
                    continue;
                }
                if let Some(squash) = self.replacements.get(&parent) {
                    if squash.replaces.iter().all(|r| applied.contains_key(r)) {
                        continue;
                    }
                }
                return Err(MigrationError::InconsistentHistory {
                    migration: key.clone(),
                    dependency: parent,
                });
            }
        }
        Ok(())
    }

    /// Components with more than one leaf, mapped to their sorted leaf
    /// names.
    pub fn detect_conflicts(&self) -> BTreeMap<String, Vec<String>> {
        let mut leaves: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in self.graph.leaf_nodes(None) {
            leaves.entry(key.component).or_default().push(key.name);
        }
        leaves.retain(|_, names| names.len() > 1);
        for names in leaves.values_mut() {
            names.sort();
        }
        leaves
    }

    /// The single on-disk migration of `component` whose name starts with
    /// `prefix`.
    pub fn find_by_prefix(&self, component: &str, prefix: &str) -> Result<&Arc<Migration<S>>> {
        let mut matches = self
            .disk
            .migrations
            .iter()
            .filter(|(key, _)| key.component == component && key.name.starts_with(prefix))
            .map(|(_, migration)| migration);
        match (matches.next(), matches.next()) {
            (Some(migration), None) => Ok(migration),
            (Some(_), Some(_)) => Err(MigrationError::AmbiguousPrefix {
                component: component.to_string(),
                prefix: prefix.to_string(),
            }),
            (None, _) => Err(MigrationError::PrefixNotFound {
                component: component.to_string(),
                prefix: prefix.to_string(),
            }),
        }
    }

    /// Resolve a user-supplied target. An unusable squash stands for the
    /// last migration it replaces.
    pub fn resolve_target(&self, component: &str, prefix: &str) -> Result<MigrationKey> {
        let key = self.find_by_prefix(component, prefix)?.key().clone();
        if !self.graph.contains(&key) {
            if let Some(last) = self
                .replacements
                .get(&key)
                .and_then(|squash| squash.replaces.last())
            {
                return Ok(last.clone());
            }
        }
        Ok(key)
    }

    pub fn graph(&self) -> &MigrationGraph<S> {
        &self.graph
    }

    pub fn disk_migrations(&self) -> &BTreeMap<MigrationKey, Arc<Migration<S>>> {
        &self.disk.migrations
    }

    pub fn applied_migrations(&self) -> &AppliedMap {
        &self.applied
    }

    pub fn is_applied(&self, key: &MigrationKey) -> bool {
        self.applied.contains_key(key)
    }

    pub fn replacements(&self) -> &BTreeMap<MigrationKey, Arc<Migration<S>>> {
        &self.replacements
    }

    pub fn migrated_components(&self) -> &BTreeSet<String> {
        &self.disk.migrated
    }

    pub fn unmigrated_components(&self) -> &BTreeSet<String> {
        &self.disk.unmigrated
    }

    pub fn config(&self) -> LoaderConfig {
        self.config
    }
}

impl<S: Default> MigrationLoader<S> {
    /// Schema state represented by `nodes` (all leaves when `None`).
    pub fn project_state(&self, nodes: Option<&[MigrationKey]>, at_end: bool) -> Result<S> {
        match nodes {
            Some(nodes) => self.graph.make_state(nodes, at_end, S::default()),
            None => {
                let leaves = self.graph.leaf_nodes(None);
                self.graph.make_state(&leaves, at_end, S::default())
            }
        }
    }
}
