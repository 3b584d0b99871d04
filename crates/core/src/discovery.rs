//! File discovery module with gitignore-aware filtering
//!
//! Finds migration definition files on disk while respecting .gitignore
//! patterns. Matching is done with glob patterns relative to the search
//! root; `*` never crosses a path separator.

use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Extension of migration definition files.
pub const MIGRATION_FILE_EXTENSION: &str = "json";

/// Discover files matching glob patterns under `root`
///
/// # Arguments
/// * `root` - Root directory to search
/// * `patterns` - Glob patterns (e.g., &["*/migrations/*.json"])
///
/// # Returns
/// Sorted absolute paths of matching files, excluding those matched by
/// .gitignore. A missing root or invalid patterns yield an empty list.
pub fn discover_files(root: &Path, patterns: &[&str]) -> Vec<PathBuf> {
    // Canonicalize root upfront to ensure all returned paths are absolute
    let canonical_root = match root.canonicalize() {
        Ok(path) => path,
        Err(_) => return Vec::new(),
    };

    let glob_matcher = match build_glob_matcher(patterns) {
        Ok(matcher) => matcher,
        Err(err) => {
            warn!(error = %err, "invalid discovery pattern");
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    for result in build_walker(&canonical_root) {
        match result {
            Ok(entry) => {
                if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                    continue;
                }
                if let Ok(rel_path) = entry.path().strip_prefix(&canonical_root) {
                    if glob_matcher.is_match(rel_path) {
                        files.push(entry.into_path());
                    }
                }
            }
            Err(err) => {
                // Unreadable entries are skipped
                warn!(error = %err, "error walking directory");
            }
        }
    }

    // Load order follows file name
    files.sort();
    files
}

/// Migration files directly inside `dir`.
///
/// Names starting with `_` or `~` are skipped (package markers, editor
/// backups).
pub fn discover_migration_files(dir: &Path) -> Vec<PathBuf> {
    let pattern = format!("*.{}", MIGRATION_FILE_EXTENSION);
    discover_files(dir, &[pattern.as_str()])
        .into_iter()
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('_') && !n.starts_with('~'))
        })
        .collect()
}

/// Build a glob matcher from the provided patterns
fn build_glob_matcher(patterns: &[&str]) -> Result<globset::GlobSet, globset::Error> {
    use globset::{GlobBuilder, GlobSetBuilder};

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
    }
    builder.build()
}

/// Build a WalkBuilder with proper ignore configuration
fn build_walker(root: &Path) -> ignore::Walk {
    let mut builder = WalkBuilder::new(root);
    builder
        .git_ignore(true)
        .git_exclude(true)
        .hidden(false)
        .parents(true); // Also check parent directories for .gitignore

    // Explicitly add .gitignore if it exists (WalkBuilder only honours it
    // automatically inside a git repository)
    let gitignore_path = root.join(".gitignore");
    if gitignore_path.exists() {
        let _ = builder.add_ignore(gitignore_path);
    }

    builder.build()
}
