//! Integration tests for loading, planning and running migrations
//!
//! Read-only scenarios use the pre-created fixture at
//! `tests/test-fixtures/blog-project/`; scenarios that rewrite migration
//! files build their own project in a temporary directory.

use std::fs;
use std::path::Path;

use migration_graph_core::executor::PruneOutcome;
use migration_graph_core::planner::{self, Target};
use migration_graph_core::{
    Ledger, MemoryBackend, MigrationError, MigrationExecutor, MigrationKey, MigrationSource,
    MigratorConfig, FileSystemSource, ProjectState, SchemaEditor,
};
use tempfile::TempDir;

type Executor = MigrationExecutor<ProjectState, MemoryBackend>;

const FIXTURE: &str = "tests/test-fixtures/blog-project";

fn key(component: &str, name: &str) -> MigrationKey {
    MigrationKey::new(component, name)
}

fn open(root: &Path, backend: MemoryBackend) -> Executor {
    let config = MigratorConfig::load(root).expect("config should load");
    let source = FileSystemSource::new(root, config.clone());
    let ledger = Ledger::new(config.ledger_table.clone());
    MigrationExecutor::new(&source, backend, ledger, config.loader_config())
        .expect("project should load")
}

fn migrate_all(executor: &mut Executor) -> ProjectState {
    let targets = planner::leaf_targets(executor.loader().graph(), None);
    let plan = executor.migration_plan(&targets).unwrap();
    executor.migrate(&plan, false).unwrap()
}

fn recorded(executor: &Executor) -> Vec<String> {
    executor
        .recorded_migrations()
        .unwrap()
        .keys()
        .map(|k| k.to_string())
        .collect()
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn test_fixture_loads_components_and_graph() {
    let root = Path::new(FIXTURE);
    assert!(root.exists(), "Fixture directory should exist");

    let config = MigratorConfig::load(root).unwrap();
    let disk = FileSystemSource::new(root, config).load().unwrap();

    // _template.json is skipped
    assert_eq!(disk.len(), 5);
    assert_eq!(disk.migrated.iter().collect::<Vec<_>>(), vec!["auth", "blog"]);
    assert_eq!(disk.unmigrated.iter().collect::<Vec<_>>(), vec!["legacy"]);

    let executor = open(root, MemoryBackend::new());
    let graph = executor.loader().graph();
    assert_eq!(
        graph.parents(&key("blog", "0001_initial")),
        [key("auth", "0002_email")].into_iter().collect()
    );
    assert!(executor.loader().detect_conflicts().is_empty());
}

#[test]
fn test_fixture_plan_order() {
    let executor = open(Path::new(FIXTURE), MemoryBackend::new());
    let targets = planner::leaf_targets(executor.loader().graph(), None);
    let plan = executor.migration_plan(&targets).unwrap();

    let steps: Vec<String> = plan.iter().map(|s| s.to_string()).collect();
    assert_eq!(
        steps,
        vec![
            "apply auth.0001_initial",
            "apply auth.0002_email",
            "apply blog.0001_initial",
            "apply blog.0002_title",
            "apply blog.0003_headline",
        ]
    );
}

#[test]
fn test_fixture_migrate_and_roll_back() {
    let mut executor = open(Path::new(FIXTURE), MemoryBackend::new());

    let state = migrate_all(&mut executor);

    let post = state.table("blog", "post").unwrap();
    assert!(post.column("headline").is_some());
    assert!(post.column("title").is_none());
    assert_eq!(post.indexes["post_title_idx"], vec!["headline".to_string()]);
    assert!(state.table("auth", "user").unwrap().column("email").is_some());

    let backend = executor.adapter();
    assert!(backend.table_exists("auth_user").unwrap());
    assert!(backend.table_exists("blog_post").unwrap());
    assert!(backend
        .journal()
        .contains(&"CREATE INDEX CONCURRENTLY post_title_idx ON blog_post (title)".to_string()));
    // blog.0002 is not atomic; every other migration ran in one transaction.
    assert_eq!(backend.transactions_committed(), 4);

    // Back to blog.0001: the target itself stays applied.
    let target = executor.loader().resolve_target("blog", "0001").unwrap();
    let plan = executor.migration_plan(&[Target::Node(target)]).unwrap();
    let steps: Vec<String> = plan.iter().map(|s| s.to_string()).collect();
    assert_eq!(
        steps,
        vec!["unapply blog.0003_headline", "unapply blog.0002_title"]
    );

    let before = executor.adapter().journal().len();
    let state = executor.migrate(&plan, false).unwrap();
    let reverted: Vec<&str> = executor.adapter().journal()[before..]
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(
        reverted,
        vec![
            "ALTER TABLE blog_post RENAME COLUMN headline TO title",
            "UPDATE blog_post SET title = NULL WHERE title = 'untitled'",
            "DROP INDEX CONCURRENTLY post_title_idx",
            "ALTER TABLE blog_post DROP COLUMN title",
        ]
    );
    assert!(state.table("blog", "post").unwrap().column("title").is_none());
    assert_eq!(
        recorded(&executor),
        vec!["auth.0001_initial", "auth.0002_email", "blog.0001_initial"]
    );
}

#[test]
fn test_persisted_backend_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let database = dir.path().join("state.json");

    let mut executor = open(Path::new(FIXTURE), MemoryBackend::new());
    migrate_all(&mut executor);
    executor.adapter().save(&database).unwrap();

    let reopened = open(Path::new(FIXTURE), MemoryBackend::open(&database).unwrap());
    let targets = planner::leaf_targets(reopened.loader().graph(), None);
    assert!(reopened.migration_plan(&targets).unwrap().is_empty());
    assert_eq!(recorded(&reopened).len(), 5);
    assert!(reopened.check_consistent_history().is_ok());
}

#[test]
fn test_fake_then_zero() {
    let mut executor = open(Path::new(FIXTURE), MemoryBackend::new());
    let targets = planner::leaf_targets(executor.loader().graph(), None);
    let plan = executor.migration_plan(&targets).unwrap();
    executor.migrate(&plan, true).unwrap();

    assert_eq!(recorded(&executor).len(), 5);
    assert!(!executor.adapter().table_exists("blog_post").unwrap());

    let plan = executor
        .migration_plan(&[Target::Zero("blog".into())])
        .unwrap();
    assert_eq!(plan.len(), 3);
    executor.migrate(&plan, true).unwrap();
    assert_eq!(
        recorded(&executor),
        vec!["auth.0001_initial", "auth.0002_email"]
    );
}

#[test]
fn test_inconsistent_ledger_is_reported() {
    let mut backend = MemoryBackend::new();
    Ledger::default()
        .record_applied(&mut backend, &key("blog", "0001_initial"))
        .unwrap();
    let executor = open(Path::new(FIXTURE), backend);

    match executor.check_consistent_history() {
        Err(MigrationError::InconsistentHistory {
            migration,
            dependency,
        }) => {
            assert_eq!(migration, key("blog", "0001_initial"));
            assert_eq!(dependency, key("auth", "0002_email"));
        }
        other => panic!("unexpected result: {:?}", other.err()),
    }
}

#[test]
fn test_conflicting_leaves_in_project() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "blog/migrations/0001_initial.json", "{}");
    write(
        root,
        "blog/migrations/0002_b.json",
        r#"{"dependencies": [["blog", "0001_initial"]]}"#,
    );
    write(
        root,
        "blog/migrations/0002_a.json",
        r#"{"dependencies": [["blog", "0001_initial"]]}"#,
    );

    let executor = open(root, MemoryBackend::new());
    let conflicts = executor.loader().detect_conflicts();

    assert_eq!(conflicts["blog"], vec!["0002_a", "0002_b"]);
    let err = MigrationError::ConflictingLeaves { conflicts };
    assert!(err.to_string().contains("0002_a, 0002_b in blog"));
}

const CREATE_POST: &str = r#"{"op": "create_table", "name": "post", "columns": [{"name": "id", "type": "integer"}]}"#;
const ADD_TITLE: &str = r#"{"op": "add_column", "table": "post", "column": {"name": "title", "type": "text"}}"#;
const ADD_BODY: &str = r#"{"op": "add_column", "table": "post", "column": {"name": "body", "type": "text"}}"#;

#[test]
fn test_squash_lifecycle_with_prune() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(
        root,
        "blog/migrations/0001_initial.json",
        &format!(r#"{{"operations": [{CREATE_POST}]}}"#),
    );
    write(
        root,
        "blog/migrations/0002_title.json",
        &format!(r#"{{"dependencies": [["blog", "0001_initial"]], "operations": [{ADD_TITLE}]}}"#),
    );
    write(
        root,
        "blog/migrations/0001_squashed_0002_title.json",
        &format!(
            r#"{{"replaces": [["blog", "0001_initial"], ["blog", "0002_title"]],
                "operations": [{CREATE_POST}, {ADD_TITLE}]}}"#
        ),
    );
    write(
        root,
        "blog/migrations/0003_body.json",
        &format!(r#"{{"dependencies": [["blog", "0002_title"]], "operations": [{ADD_BODY}]}}"#),
    );
    let squash = key("blog", "0001_squashed_0002_title");

    // Only the first original is applied: the squash is unusable.
    let mut backend = MemoryBackend::new();
    backend.execute("CREATE TABLE blog_post (id integer)").unwrap();
    Ledger::default()
        .record_applied(&mut backend, &key("blog", "0001_initial"))
        .unwrap();
    let mut executor = open(root, backend);
    assert!(!executor.loader().graph().contains(&squash));

    let targets = planner::leaf_targets(executor.loader().graph(), None);
    let plan = executor.migration_plan(&targets).unwrap();
    let steps: Vec<String> = plan.iter().map(|s| s.to_string()).collect();
    assert_eq!(steps, vec!["apply blog.0002_title", "apply blog.0003_body"]);
    executor.migrate(&plan, false).unwrap();

    // Every original is applied now, so the squash was recorded and folds in.
    assert!(recorded(&executor).contains(&squash.to_string()));
    assert!(executor.loader().graph().contains(&squash));
    assert!(executor.loader().is_applied(&squash));
    let backend = executor.into_adapter();

    // The originals are deleted but the squash still lists them.
    fs::remove_file(root.join("blog/migrations/0001_initial.json")).unwrap();
    fs::remove_file(root.join("blog/migrations/0002_title.json")).unwrap();
    let mut executor = open(root, backend);
    assert_eq!(
        executor.loader().graph().parents(&key("blog", "0003_body")),
        [squash.clone()].into_iter().collect()
    );
    assert_eq!(
        executor.prune("blog").unwrap(),
        PruneOutcome::Blocked(vec![squash.clone()])
    );

    // Finishing the transition: drop `replaces` and depend on the squash.
    write(
        root,
        "blog/migrations/0001_squashed_0002_title.json",
        &format!(r#"{{"operations": [{CREATE_POST}, {ADD_TITLE}]}}"#),
    );
    write(
        root,
        "blog/migrations/0003_body.json",
        &format!(
            r#"{{"dependencies": [["blog", "0001_squashed_0002_title"]], "operations": [{ADD_BODY}]}}"#
        ),
    );
    let mut executor = open(root, executor.into_adapter());
    assert_eq!(
        executor.prune("blog").unwrap(),
        PruneOutcome::Pruned(vec![key("blog", "0001_initial"), key("blog", "0002_title")])
    );
    assert_eq!(
        recorded(&executor),
        vec!["blog.0001_squashed_0002_title", "blog.0003_body"]
    );
    assert!(executor.check_consistent_history().is_ok());
}
