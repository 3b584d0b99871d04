//! Where authored migrations come from.
//!
//! The loader consumes a [`DiskMigrations`] set. [`FileSystemSource`]
//! produces one from JSON migration files laid out per component; a
//! `DiskMigrations` built in memory is itself a source, which is what
//! embedders and tests use.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{MigratorConfig, MIGRATIONS_DIR_NAME};
use crate::discovery::discover_migration_files;
use crate::error::{MigrationError, Result};
use crate::key::{Dependency, MigrationKey};
use crate::migration::Migration;
use crate::operations::SchemaOperation;
use crate::state::ProjectState;

/// Every migration found for the installed components.
pub struct DiskMigrations<S> {
    pub migrations: BTreeMap<MigrationKey, Arc<Migration<S>>>,
    /// Installed components with a migrations directory.
    pub migrated: BTreeSet<String>,
    /// Installed components without migrations.
    pub unmigrated: BTreeSet<String>,
}

impl<S> DiskMigrations<S> {
    pub fn new() -> Self {
        Self {
            migrations: BTreeMap::new(),
            migrated: BTreeSet::new(),
            unmigrated: BTreeSet::new(),
        }
    }

    /// Add a migration, marking its component as migrated.
    pub fn insert(&mut self, migration: Migration<S>) {
        self.migrated.insert(migration.component().to_string());
        self.migrations
            .insert(migration.key().clone(), Arc::new(migration));
    }

    pub fn with_migration(mut self, migration: Migration<S>) -> Self {
        self.insert(migration);
        self
    }

    /// Declare an installed component that has no migrations.
    pub fn with_unmigrated(mut self, component: impl Into<String>) -> Self {
        self.unmigrated.insert(component.into());
        self
    }

    /// Declare an installed component with an empty migrations directory.
    pub fn with_migrated(mut self, component: impl Into<String>) -> Self {
        self.migrated.insert(component.into());
        self
    }

    pub fn is_installed(&self, component: &str) -> bool {
        self.migrated.contains(component) || self.unmigrated.contains(component)
    }

    pub fn get(&self, key: &MigrationKey) -> Option<&Arc<Migration<S>>> {
        self.migrations.get(key)
    }

    pub fn contains(&self, key: &MigrationKey) -> bool {
        self.migrations.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl<S> Clone for DiskMigrations<S> {
    fn clone(&self) -> Self {
        Self {
            migrations: self.migrations.clone(),
            migrated: self.migrated.clone(),
            unmigrated: self.unmigrated.clone(),
        }
    }
}

impl<S> Default for DiskMigrations<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything that can enumerate authored migrations.
pub trait MigrationSource<S> {
    fn load(&self) -> Result<DiskMigrations<S>>;
}

impl<S> MigrationSource<S> for DiskMigrations<S> {
    fn load(&self) -> Result<DiskMigrations<S>> {
        Ok(self.clone())
    }
}

/// On-disk shape of one migration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MigrationFile {
    #[serde(default)]
    dependencies: Vec<(String, String)>,
    #[serde(default)]
    run_before: Vec<(String, String)>,
    #[serde(default)]
    replaces: Vec<(String, String)>,
    #[serde(default = "default_atomic")]
    atomic: bool,
    #[serde(default)]
    initial: bool,
    #[serde(default)]
    operations: Vec<SchemaOperation>,
}

fn default_atomic() -> bool {
    true
}

impl MigrationFile {
    fn into_migration(self, component: &str, name: &str) -> Migration<ProjectState> {
        let mut migration = Migration::new(component, name)
            .with_atomic(self.atomic)
            .with_initial(self.initial);
        migration.dependencies = self
            .dependencies
            .iter()
            .map(|(c, n)| Dependency::from_parts(c, n))
            .collect();
        migration.run_before = self
            .run_before
            .iter()
            .map(|(c, n)| Dependency::from_parts(c, n))
            .collect();
        migration.replaces = self
            .replaces
            .into_iter()
            .map(|(c, n)| MigrationKey::new(c, n))
            .collect();
        for operation in self.operations {
            migration = migration.with_operation(operation);
        }
        migration
    }
}

/// Reads `<root>/<component>/migrations/*.json`.
#[derive(Debug, Clone)]
pub struct FileSystemSource {
    root: PathBuf,
    config: MigratorConfig,
}

impl FileSystemSource {
    pub fn new(root: impl Into<PathBuf>, config: MigratorConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Installed components: the configured list, or every top-level
    /// directory holding a migrations directory.
    fn installed_components(&self) -> Result<BTreeSet<String>> {
        let mut components: BTreeSet<String> = self.config.components.iter().cloned().collect();
        if !components.is_empty() {
            return Ok(components);
        }
        components.extend(self.config.migration_dirs.keys().cloned());
        components.extend(self.config.unmigrated.iter().cloned());
        if self.root.is_dir() {
            for entry in fs::read_dir(&self.root)? {
                let entry = entry?;
                if !entry.path().join(MIGRATIONS_DIR_NAME).is_dir() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    components.insert(name.to_string());
                }
            }
        }
        Ok(components)
    }
}

impl MigrationSource<ProjectState> for FileSystemSource {
    fn load(&self) -> Result<DiskMigrations<ProjectState>> {
        let mut disk = DiskMigrations::new();
        for component in self.installed_components()? {
            if self.config.unmigrated.contains(&component) {
                disk.unmigrated.insert(component);
                continue;
            }
            let dir = self.config.migrations_dir(&self.root, &component);
            if !dir.is_dir() {
                if self.config.has_explicit_dir(&component) && !self.config.ignore_no_migrations {
                    return Err(MigrationError::BadMigration {
                        path: dir,
                        reason: "configured migrations directory does not exist".to_string(),
                    });
                }
                debug!(%component, "no migrations directory");
                disk.unmigrated.insert(component);
                continue;
            }
            disk.migrated.insert(component.clone());
            for path in discover_migration_files(&dir) {
                disk.insert(read_migration(&component, &path)?);
            }
        }
        info!(
            migrations = disk.len(),
            migrated = disk.migrated.len(),
            unmigrated = disk.unmigrated.len(),
            "loaded migrations from disk"
        );
        Ok(disk)
    }
}

fn read_migration(component: &str, path: &Path) -> Result<Migration<ProjectState>> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| MigrationError::BadMigration {
            path: path.to_path_buf(),
            reason: "file name is not valid UTF-8".to_string(),
        })?;
    let content = fs::read_to_string(path)?;
    let file: MigrationFile =
        serde_json::from_str(&content).map_err(|e| MigrationError::BadMigration {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(file.into_migration(component, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_loads_migrations_per_component() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "blog/migrations/0001_initial.json",
            r#"{"initial": true, "dependencies": [["auth", "__first__"]],
                "operations": [{"op": "create_table", "name": "post",
                                "columns": [{"name": "id", "type": "integer"}]}]}"#,
        );
        write(dir.path(), "blog/migrations/_notes.json", "not json");
        write(dir.path(), "auth/migrations/0001_initial.json", "{}");
        fs::create_dir_all(dir.path().join("static")).unwrap();

        let source = FileSystemSource::new(dir.path(), MigratorConfig::default());
        let disk = source.load().unwrap();

        assert_eq!(disk.len(), 2);
        assert_eq!(
            disk.migrated.iter().collect::<Vec<_>>(),
            vec!["auth", "blog"]
        );
        let initial = disk.get(&MigrationKey::new("blog", "0001_initial")).unwrap();
        assert!(initial.initial);
        assert!(initial.atomic);
        assert_eq!(initial.dependencies, vec![Dependency::First("auth".into())]);
        assert_eq!(initial.operations.len(), 1);
    }

    #[test]
    fn test_configured_components_and_unmigrated() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "blog/migrations/0001_initial.json", "{}");
        write(dir.path(), "other/migrations/0001_initial.json", "{}");

        let config = MigratorConfig {
            components: vec!["blog".into(), "legacy".into(), "shop".into()],
            unmigrated: vec!["legacy".into()],
            ..MigratorConfig::default()
        };
        let disk = FileSystemSource::new(dir.path(), config).load().unwrap();

        assert_eq!(disk.len(), 1);
        assert!(disk.migrated.contains("blog"));
        assert!(disk.unmigrated.contains("legacy"));
        // no directory on disk
        assert!(disk.unmigrated.contains("shop"));
        assert!(!disk.is_installed("other"));
    }

    #[test]
    fn test_missing_explicit_directory() {
        let dir = TempDir::new().unwrap();
        let mut migration_dirs = BTreeMap::new();
        migration_dirs.insert("blog".to_string(), PathBuf::from("vendor/blog"));
        let config = MigratorConfig {
            migration_dirs,
            ..MigratorConfig::default()
        };

        let err = FileSystemSource::new(dir.path(), config.clone())
            .load()
            .err()
            .unwrap();
        assert!(matches!(err, MigrationError::BadMigration { .. }));

        let tolerant = MigratorConfig {
            ignore_no_migrations: true,
            ..config
        };
        let disk = FileSystemSource::new(dir.path(), tolerant).load().unwrap();
        assert!(disk.unmigrated.contains("blog"));
    }

    #[test]
    fn test_malformed_file_is_bad_migration() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "blog/migrations/0001_initial.json",
            r#"{"dependencies": "nope"}"#,
        );

        let err = FileSystemSource::new(dir.path(), MigratorConfig::default())
            .load()
            .err()
            .unwrap();
        match err {
            MigrationError::BadMigration { path, .. } => {
                assert!(path.ends_with("0001_initial.json"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_in_memory_set_is_a_source() {
        let disk: DiskMigrations<ProjectState> = DiskMigrations::new()
            .with_migration(Migration::new("blog", "0001_initial"))
            .with_unmigrated("legacy");
        let loaded = disk.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.is_installed("blog"));
        assert!(loaded.is_installed("legacy"));
    }
}
