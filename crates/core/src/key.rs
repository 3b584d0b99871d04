//! Migration identifiers and dependency references.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name used on disk for the "first migration of a component" sentinel.
pub const FIRST_SENTINEL: &str = "__first__";
/// Name used on disk for the "latest migration of a component" sentinel.
pub const LATEST_SENTINEL: &str = "__latest__";

/// Globally unique identifier of a migration: `(component, name)`.
///
/// Ordering is lexicographic on the component label, then on the name,
/// which is what every "deterministic order" in the graph relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MigrationKey {
    pub component: String,
    pub name: String,
}

impl MigrationKey {
    pub fn new(component: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.component, self.name)
    }
}

/// A declared dependency (or `run_before` entry) of a migration.
///
/// Sentinels are resolved exactly once, while the loader wires the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dependency {
    Concrete(MigrationKey),
    /// Earliest migration of the named component.
    First(String),
    /// Current leaf migration of the named component.
    Latest(String),
}

impl Dependency {
    pub fn on(component: impl Into<String>, name: impl Into<String>) -> Self {
        Dependency::Concrete(MigrationKey::new(component, name))
    }

    /// Parse the `[component, name]` form used in migration files.
    pub fn from_parts(component: &str, name: &str) -> Self {
        match name {
            FIRST_SENTINEL => Dependency::First(component.to_string()),
            LATEST_SENTINEL => Dependency::Latest(component.to_string()),
            _ => Dependency::on(component, name),
        }
    }

    pub fn component(&self) -> &str {
        match self {
            Dependency::Concrete(key) => &key.component,
            Dependency::First(component) | Dependency::Latest(component) => component,
        }
    }

    pub fn is_first(&self) -> bool {
        matches!(self, Dependency::First(_))
    }
}

impl From<MigrationKey> for Dependency {
    fn from(key: MigrationKey) -> Self {
        Dependency::Concrete(key)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Concrete(key) => key.fmt(f),
            Dependency::First(component) => write!(f, "{}.{}", component, FIRST_SENTINEL),
            Dependency::Latest(component) => write!(f, "{}.{}", component, LATEST_SENTINEL),
        }
    }
}
