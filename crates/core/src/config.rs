//! Project configuration read from `migrator.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::ledger::DEFAULT_LEDGER_TABLE;

pub const CONFIG_FILE_NAME: &str = "migrator.toml";

/// Directory name holding a component's migrations by default.
pub const MIGRATIONS_DIR_NAME: &str = "migrations";

/// Settings for one project.
///
/// ```toml
/// components = ["auth", "blog"]
/// unmigrated = ["legacy"]
/// ledger_table = "schema_migrations"
///
/// [migration_dirs]
/// auth = "vendor/auth/migrations"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    /// Installed components. Empty means every component found on disk.
    pub components: Vec<String>,
    /// Per-component migrations directory, relative to the project root.
    pub migration_dirs: BTreeMap<String, PathBuf>,
    /// Installed components whose schema is managed outside migrations.
    pub unmigrated: Vec<String>,
    pub ignore_no_migrations: bool,
    pub replace_migrations: bool,
    pub ledger_table: String,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            components: Vec::new(),
            migration_dirs: BTreeMap::new(),
            unmigrated: Vec::new(),
            ignore_no_migrations: false,
            replace_migrations: true,
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

impl MigratorConfig {
    /// Read `migrator.toml` from `root`, falling back to defaults when the
    /// file does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            debug!(root = %root.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            ignore_no_migrations: self.ignore_no_migrations,
            replace_migrations: self.replace_migrations,
        }
    }

    /// Whether a missing migrations directory for `component` was
    /// configured explicitly.
    pub fn has_explicit_dir(&self, component: &str) -> bool {
        self.migration_dirs.contains_key(component)
    }

    pub fn migrations_dir(&self, root: &Path, component: &str) -> PathBuf {
        match self.migration_dirs.get(component) {
            Some(dir) => root.join(dir),
            None => root.join(component).join(MIGRATIONS_DIR_NAME),
        }
    }
}

/// The part of the configuration the loader itself consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Resolve sentinel dependencies on components without migrations to
    /// nothing instead of failing.
    pub ignore_no_migrations: bool,
    /// Fold squashed migrations into the graph.
    pub replace_migrations: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            ignore_no_migrations: false,
            replace_migrations: true,
        }
    }
}
