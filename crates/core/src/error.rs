//! Error types shared by every stage of the migration pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::key::MigrationKey;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// An edge references a migration that is not part of the graph.
    #[error("{message}")]
    NodeNotFound {
        /// The migration that declared the dangling dependency.
        origin: MigrationKey,
        /// The missing migration.
        node: MigrationKey,
        message: String,
    },

    #[error("circular dependency: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<MigrationKey> },

    #[error("more than one migration matches '{prefix}' in component '{component}'")]
    AmbiguousPrefix { component: String, prefix: String },

    #[error("cannot find a migration matching '{prefix}' from component '{component}'")]
    PrefixNotFound { component: String, prefix: String },

    #[error("conflicting migrations detected; multiple leaf nodes in the graph: ({})", format_conflicts(.conflicts))]
    ConflictingLeaves {
        conflicts: BTreeMap<String, Vec<String>>,
    },

    #[error("migration {migration} is applied before its dependency {dependency}")]
    InconsistentHistory {
        migration: MigrationKey,
        dependency: MigrationKey,
    },

    #[error("operation {operation} in {migration} is not reversible")]
    Irreversible {
        operation: String,
        migration: MigrationKey,
    },

    #[error("unable to create the migration ledger table ({reason}); create the ledger table or check the database permissions")]
    LedgerSchemaMissing { reason: String },

    #[error("dependency on component with no migrations: {component}")]
    DependencyOnUnmigratedApp { component: String },

    #[error("dependency on unknown component: {component}")]
    DependencyOnUnknownApp { component: String },

    #[error("component '{component}' is not installed")]
    UnknownComponent { component: String },

    #[error("component '{component}' does not have migrations")]
    UnmigratedComponent { component: String },

    #[error("bad migration file {}: {reason}", .path.display())]
    BadMigration { path: PathBuf, reason: String },

    #[error("invalid migration plan: {0}")]
    InvalidPlan(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, MigrationError>;

fn format_cycle(cycle: &[MigrationKey]) -> String {
    cycle
        .iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_conflicts(conflicts: &BTreeMap<String, Vec<String>>) -> String {
    conflicts
        .iter()
        .map(|(component, names)| format!("{} in {}", names.join(", "), component))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_chain() {
        let err = MigrationError::CircularDependency {
            cycle: vec![
                MigrationKey::new("app", "0001"),
                MigrationKey::new("app", "0002"),
                MigrationKey::new("app", "0001"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "circular dependency: app.0001 -> app.0002 -> app.0001"
        );
    }

    #[test]
    fn test_conflict_message_groups_by_component() {
        let mut conflicts = BTreeMap::new();
        conflicts.insert(
            "blog".to_string(),
            vec!["0002_a".to_string(), "0002_b".to_string()],
        );
        let err = MigrationError::ConflictingLeaves { conflicts };
        assert!(err.to_string().contains("0002_a, 0002_b in blog"));
    }
}
