//! Runs migration plans against a storage adapter.
//!
//! The executor owns the loader, the ledger and the adapter for one
//! storage target. Steps run strictly in plan order; forwards steps thread
//! one state through the whole plan, backwards steps rebuild the state
//! each migration was applied on top of from its ancestors.
//!
//! An atomic migration on an adapter with transactional DDL runs inside a
//! single transaction together with its ledger write. Otherwise each
//! operation decides for itself (see [`crate::migration`]) and the ledger
//! row is written once every operation succeeded.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::adapter::StorageAdapter;
use crate::config::LoaderConfig;
use crate::error::{MigrationError, Result};
use crate::key::MigrationKey;
use crate::ledger::{AppliedMap, Ledger};
use crate::loader::MigrationLoader;
use crate::migration::Migration;
use crate::planner::{self, Direction, Plan, PlanStep, Target};
use crate::source::MigrationSource;

/// Progress notifications emitted while a plan runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationEvent {
    ApplyStart { key: MigrationKey, fake: bool },
    ApplySuccess { key: MigrationKey, fake: bool },
    UnapplyStart { key: MigrationKey, fake: bool },
    UnapplySuccess { key: MigrationKey, fake: bool },
}

pub trait MigrationObserver<S> {
    fn on_event(&mut self, event: &MigrationEvent);

    /// Called once after a plan ran to completion.
    fn post_run(&mut self, _state: &S, _plan: &[PlanStep]) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl<S> MigrationObserver<S> for NoopObserver {
    fn on_event(&mut self, _event: &MigrationEvent) {}
}

/// Result of [`MigrationExecutor::prune`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneOutcome {
    /// Ledger rows deleted, sorted.
    Pruned(Vec<MigrationKey>),
    /// Squash migrations still listing stale rows in `replaces`.
    Blocked(Vec<MigrationKey>),
}

pub struct MigrationExecutor<S, A> {
    loader: MigrationLoader<S>,
    ledger: Ledger,
    adapter: A,
    observer: Box<dyn MigrationObserver<S>>,
}

impl<S, A> MigrationExecutor<S, A>
where
    S: Clone + Default,
    A: StorageAdapter,
{
    /// Read the ledger through `adapter` and build the graph from `source`.
    pub fn new(
        source: &dyn MigrationSource<S>,
        adapter: A,
        ledger: Ledger,
        config: LoaderConfig,
    ) -> Result<Self> {
        let applied = ledger.applied_migrations(&adapter)?;
        let loader = MigrationLoader::from_source(source, applied, config)?;
        Ok(Self {
            loader,
            ledger,
            adapter,
            observer: Box::new(NoopObserver),
        })
    }

    pub fn with_observer(mut self, observer: impl MigrationObserver<S> + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn loader(&self) -> &MigrationLoader<S> {
        &self.loader
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn into_adapter(self) -> A {
        self.adapter
    }

    /// Raw ledger rows, without squash folding.
    pub fn recorded_migrations(&self) -> Result<AppliedMap> {
        self.ledger.applied_migrations(&self.adapter)
    }

    /// Re-read the ledger and rebuild the graph.
    pub fn refresh(&mut self) -> Result<()> {
        let applied = self.recorded_migrations()?;
        self.loader.rebuild(applied)
    }

    pub fn check_consistent_history(&self) -> Result<()> {
        self.loader
            .check_consistent_history(&self.recorded_migrations()?)
    }

    pub fn migration_plan(&self, targets: &[Target]) -> Result<Plan> {
        planner::plan(
            self.loader.graph(),
            self.loader.applied_migrations(),
            targets,
        )
    }

    /// State described by every applied migration, replayed in graph
    /// order.
    pub fn applied_state(&self) -> Result<S> {
        let graph = self.loader.graph();
        let targets = planner::leaf_targets(graph, None);
        let full_plan = planner::plan(graph, &AppliedMap::new(), &targets)?;
        let mut state = S::default();
        for step in full_plan {
            if !self.loader.is_applied(&step.key) {
                continue;
            }
            if let Some(migration) = graph.node(&step.key) {
                migration.mutate_state_in_place(&mut state);
            }
        }
        Ok(state)
    }

    /// Execute `plan`, returning the resulting state.
    ///
    /// With `fake` set, physical work is skipped but state mutation and
    /// ledger bookkeeping still happen. Plans mixing directions are
    /// rejected.
    #[instrument(skip(self, plan), fields(steps = plan.len()))]
    pub fn migrate(&mut self, plan: &[PlanStep], fake: bool) -> Result<S> {
        let forwards = plan.iter().any(|s| s.direction == Direction::Apply);
        let backwards = plan.iter().any(|s| s.direction == Direction::Unapply);
        if forwards && backwards {
            return Err(MigrationError::InvalidPlan(
                "migration plans with both forwards and backwards migrations are not supported"
                    .to_string(),
            ));
        }
        if !plan.is_empty() {
            self.ledger.ensure_schema(&mut self.adapter)?;
        }

        let state = if backwards {
            self.migrate_all_backwards(plan, fake)?;
            self.check_replacements()?;
            self.refresh()?;
            self.applied_state()?
        } else {
            let state = self.applied_state()?;
            let state = self.migrate_all_forwards(state, plan, fake)?;
            self.check_replacements()?;
            self.refresh()?;
            state
        };

        info!(steps = plan.len(), fake, "migration plan finished");
        self.observer.post_run(&state, plan);
        Ok(state)
    }

    fn planned_migration(&self, key: &MigrationKey) -> Result<Arc<Migration<S>>> {
        self.loader
            .graph()
            .node(key)
            .cloned()
            .ok_or_else(|| MigrationError::NodeNotFound {
                origin: key.clone(),
                node: key.clone(),
                message: format!("Planned migration {} is not in the graph", key),
            })
    }

    fn migrate_all_forwards(&mut self, mut state: S, plan: &[PlanStep], fake: bool) -> Result<S> {
        for step in plan {
            let migration = self.planned_migration(&step.key)?;
            state = self.apply_migration(state, &migration, fake)?;
        }
        Ok(state)
    }

    fn migrate_all_backwards(&mut self, plan: &[PlanStep], fake: bool) -> Result<()> {
        for step in plan {
            let migration = self.planned_migration(&step.key)?;
            let state =
                self.loader
                    .graph()
                    .make_state(std::slice::from_ref(&step.key), false, S::default())?;
            self.unapply_migration(state, &migration, fake)?;
        }
        Ok(())
    }

    fn runs_in_one_transaction(&self, migration: &Migration<S>) -> bool {
        migration.atomic && self.adapter.supports_transactional_ddl()
    }

    fn apply_migration(&mut self, state: S, migration: &Migration<S>, fake: bool) -> Result<S> {
        let key = migration.key().clone();
        self.observer.on_event(&MigrationEvent::ApplyStart {
            key: key.clone(),
            fake,
        });

        let ledger = &self.ledger;
        let state = if fake {
            let state = migration.mutate_state(&state);
            record_applied(ledger, &mut self.adapter, migration)?;
            state
        } else if self.runs_in_one_transaction(migration) {
            debug!(migration = %key, "applying inside one transaction");
            transaction(&mut self.adapter, |adapter| {
                let state = migration.apply(state, adapter.as_editor())?;
                record_applied(ledger, adapter, migration)?;
                Ok(state)
            })?
        } else {
            let state = migration.apply(state, self.adapter.as_editor())?;
            record_applied(ledger, &mut self.adapter, migration)?;
            state
        };

        info!(migration = %key, fake, "applied migration");
        self.observer
            .on_event(&MigrationEvent::ApplySuccess { key, fake });
        Ok(state)
    }

    fn unapply_migration(&mut self, state: S, migration: &Migration<S>, fake: bool) -> Result<S> {
        let key = migration.key().clone();
        self.observer.on_event(&MigrationEvent::UnapplyStart {
            key: key.clone(),
            fake,
        });

        let ledger = &self.ledger;
        let state = if fake {
            // Still rejects irreversible migrations
            migration.reversal_steps(&state)?;
            record_unapplied(ledger, &mut self.adapter, migration)?;
            state
        } else if self.runs_in_one_transaction(migration) {
            debug!(migration = %key, "unapplying inside one transaction");
            transaction(&mut self.adapter, |adapter| {
                let state = migration.unapply(state, adapter.as_editor())?;
                record_unapplied(ledger, adapter, migration)?;
                Ok(state)
            })?
        } else {
            let state = migration.unapply(state, self.adapter.as_editor())?;
            record_unapplied(ledger, &mut self.adapter, migration)?;
            state
        };

        info!(migration = %key, fake, "unapplied migration");
        self.observer
            .on_event(&MigrationEvent::UnapplySuccess { key, fake });
        Ok(state)
    }

    /// Record a squash as applied once everything it replaces is, even if
    /// the replaced migrations were applied one by one.
    pub fn check_replacements(&mut self) -> Result<()> {
        let recorded = self.recorded_migrations()?;
        let pending: Vec<MigrationKey> = self
            .loader
            .replacements()
            .iter()
            .filter(|(key, squash)| {
                !recorded.contains_key(*key)
                    && squash.replaces.iter().all(|r| recorded.contains_key(r))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in pending {
            debug!(squash = %key, "recording completed squash");
            self.ledger.record_applied(&mut self.adapter, &key)?;
        }
        Ok(())
    }

    /// Delete ledger rows of `component` whose migrations are gone from
    /// disk.
    #[instrument(skip(self))]
    pub fn prune(&mut self, component: &str) -> Result<PruneOutcome> {
        let recorded = self.recorded_migrations()?;
        let disk = self.loader.disk_migrations();
        let stale: BTreeSet<MigrationKey> = recorded
            .keys()
            .filter(|key| !disk.contains_key(*key))
            .cloned()
            .collect();

        let blocked: Vec<MigrationKey> = self
            .loader
            .replacements()
            .iter()
            .filter(|(_, squash)| squash.replaces.iter().any(|r| stale.contains(r)))
            .map(|(key, _)| key.clone())
            .collect();
        if !blocked.is_empty() {
            warn!(squashes = blocked.len(), "prune blocked by squashed migrations");
            return Ok(PruneOutcome::Blocked(blocked));
        }

        let pruned: Vec<MigrationKey> = stale
            .into_iter()
            .filter(|key| key.component == component)
            .collect();
        for key in &pruned {
            info!(migration = %key, "pruning ledger row");
            self.ledger.record_unapplied(&mut self.adapter, key)?;
        }
        self.refresh()?;
        Ok(PruneOutcome::Pruned(pruned))
    }
}

/// Applying a squash records what it replaces; the squash row itself is
/// added by `check_replacements`.
fn record_applied<S, A: StorageAdapter + ?Sized>(
    ledger: &Ledger,
    adapter: &mut A,
    migration: &Migration<S>,
) -> Result<()> {
    if migration.is_squash() {
        for replaced in &migration.replaces {
            ledger.record_applied(adapter, replaced)?;
        }
        Ok(())
    } else {
        ledger.record_applied(adapter, migration.key())
    }
}

fn record_unapplied<S, A: StorageAdapter + ?Sized>(
    ledger: &Ledger,
    adapter: &mut A,
    migration: &Migration<S>,
) -> Result<()> {
    for replaced in &migration.replaces {
        ledger.record_unapplied(adapter, replaced)?;
    }
    ledger.record_unapplied(adapter, migration.key())
}

/// Like [`crate::adapter::atomic`], with the whole adapter available to
/// `f` so the ledger write joins the transaction.
fn transaction<A, T, F>(adapter: &mut A, f: F) -> Result<T>
where
    A: StorageAdapter,
    F: FnOnce(&mut A) -> Result<T>,
{
    adapter.begin()?;
    match f(adapter) {
        Ok(value) => {
            adapter.commit()?;
            Ok(value)
        }
        Err(err) => {
            debug!(error = %err, "rolling back migration transaction");
            if let Err(rollback_err) = adapter.rollback() {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SchemaEditor;
    use crate::backend::MemoryBackend;
    use crate::key::Dependency;
    use crate::operations::{ColumnDef, SchemaOperation};
    use crate::source::DiskMigrations;
    use crate::state::ProjectState;
    use std::sync::Mutex;

    type Executor = MigrationExecutor<ProjectState, MemoryBackend>;

    fn key(component: &str, name: &str) -> MigrationKey {
        MigrationKey::new(component, name)
    }

    fn create_post() -> SchemaOperation {
        SchemaOperation::CreateTable {
            name: "post".into(),
            columns: vec![ColumnDef::new("id", "integer").not_null()],
        }
    }

    fn add_title() -> SchemaOperation {
        SchemaOperation::AddColumn {
            table: "post".into(),
            column: ColumnDef::new("title", "text"),
        }
    }

    fn add_body() -> SchemaOperation {
        SchemaOperation::AddColumn {
            table: "post".into(),
            column: ColumnDef::new("body", "text"),
        }
    }

    fn blog() -> DiskMigrations<ProjectState> {
        DiskMigrations::new()
            .with_migration(Migration::new("blog", "0001_initial").with_operation(create_post()))
            .with_migration(
                Migration::new("blog", "0002_title_body")
                    .with_dependency(key("blog", "0001_initial"))
                    .with_operation(add_title())
                    .with_operation(add_body()),
            )
    }

    fn executor(disk: DiskMigrations<ProjectState>, backend: MemoryBackend) -> Executor {
        Executor::new(&disk, backend, Ledger::default(), LoaderConfig::default()).unwrap()
    }

    fn migrate_all(executor: &mut Executor, fake: bool) -> ProjectState {
        let targets = planner::leaf_targets(executor.loader().graph(), None);
        let plan = executor.migration_plan(&targets).unwrap();
        executor.migrate(&plan, fake).unwrap()
    }

    fn recorded(executor: &Executor) -> Vec<String> {
        executor
            .recorded_migrations()
            .unwrap()
            .keys()
            .map(|k| k.to_string())
            .collect()
    }

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<MigrationEvent>>>,
        post_runs: Arc<Mutex<usize>>,
    }

    impl MigrationObserver<ProjectState> for Recorder {
        fn on_event(&mut self, event: &MigrationEvent) {
            self.events.lock().unwrap().push(event.clone());
        }

        fn post_run(&mut self, _state: &ProjectState, _plan: &[PlanStep]) {
            *self.post_runs.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_migrate_forwards_applies_and_records() {
        let recorder = Recorder::default();
        let mut executor = executor(blog(), MemoryBackend::new()).with_observer(recorder.clone());

        let state = migrate_all(&mut executor, false);

        let post = state.table("blog", "post").unwrap();
        assert!(post.column("title").is_some());
        assert!(post.column("body").is_some());
        assert_eq!(
            recorded(&executor),
            vec!["blog.0001_initial", "blog.0002_title_body"]
        );
        assert!(executor.adapter().table_exists("blog_post").unwrap());
        assert!(executor
            .adapter()
            .journal()
            .contains(&"ALTER TABLE blog_post ADD COLUMN body text".to_string()));
        // One transaction per atomic migration.
        assert_eq!(executor.adapter().transactions_committed(), 2);

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            MigrationEvent::ApplyStart {
                key: key("blog", "0001_initial"),
                fake: false
            }
        );
        assert_eq!(*recorder.post_runs.lock().unwrap(), 1);
    }

    #[test]
    fn test_nothing_to_do_after_migrating() {
        let mut executor = executor(blog(), MemoryBackend::new());
        migrate_all(&mut executor, false);

        let targets = planner::leaf_targets(executor.loader().graph(), None);
        assert!(executor.migration_plan(&targets).unwrap().is_empty());
    }

    #[test]
    fn test_failed_atomic_migration_rolls_back_with_ledger_row() {
        let mut backend = MemoryBackend::new();
        backend.fail_on("ADD COLUMN body");
        let mut executor = executor(blog(), backend);

        let targets = planner::leaf_targets(executor.loader().graph(), None);
        let plan = executor.migration_plan(&targets).unwrap();
        assert!(executor.migrate(&plan, false).is_err());

        let journal = executor.adapter().journal();
        assert!(!journal.iter().any(|s| s.contains("ADD COLUMN title")));
        assert!(!executor.adapter().in_transaction());
        assert_eq!(recorded(&executor), vec!["blog.0001_initial"]);
    }

    #[test]
    fn test_without_transactional_ddl_each_operation_commits() {
        let mut backend = MemoryBackend::without_transactional_ddl();
        backend.fail_on("ADD COLUMN body");
        let mut executor = executor(blog(), backend);

        let targets = planner::leaf_targets(executor.loader().graph(), None);
        let plan = executor.migration_plan(&targets).unwrap();
        assert!(executor.migrate(&plan, false).is_err());

        // The first column stays: its own transaction already committed.
        assert!(executor
            .adapter()
            .journal()
            .iter()
            .any(|s| s.contains("ADD COLUMN title")));
        assert_eq!(recorded(&executor), vec!["blog.0001_initial"]);
    }

    #[test]
    fn test_non_atomic_migration_runs_bare() {
        let disk = DiskMigrations::new().with_migration(
            Migration::new("blog", "0001_initial")
                .with_atomic(false)
                .with_operation(create_post()),
        );
        let mut executor = executor(disk, MemoryBackend::new());
        migrate_all(&mut executor, false);
        assert_eq!(executor.adapter().transactions_committed(), 0);
    }

    #[test]
    fn test_migrate_to_zero_reverts_everything() {
        let recorder = Recorder::default();
        let mut executor = executor(blog(), MemoryBackend::new()).with_observer(recorder.clone());
        migrate_all(&mut executor, false);

        let plan = executor
            .migration_plan(&[Target::Zero("blog".into())])
            .unwrap();
        let state = executor.migrate(&plan, false).unwrap();

        assert!(state.is_empty());
        assert!(recorded(&executor).is_empty());
        assert!(!executor.adapter().table_exists("blog_post").unwrap());
        let journal = executor.adapter().journal();
        let tail: Vec<&str> = journal[journal.len() - 3..]
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(
            tail,
            vec![
                "ALTER TABLE blog_post DROP COLUMN body",
                "ALTER TABLE blog_post DROP COLUMN title",
                "DROP TABLE blog_post",
            ]
        );
        assert!(recorder
            .events
            .lock()
            .unwrap()
            .contains(&MigrationEvent::UnapplySuccess {
                key: key("blog", "0001_initial"),
                fake: false
            }));
    }

    #[test]
    fn test_irreversible_migration_stops_before_any_physical_change() {
        let disk = blog().with_migration(
            Migration::new("blog", "0003_data")
                .with_dependency(key("blog", "0002_title_body"))
                .with_operation(add_title_index())
                .with_operation(SchemaOperation::RunSql {
                    sql: "UPDATE blog_post SET title = ''".into(),
                    reverse_sql: None,
                    atomic: None,
                }),
        );
        let mut executor = executor(disk, MemoryBackend::new());
        migrate_all(&mut executor, false);
        let journal_len = executor.adapter().journal().len();

        let plan = executor
            .migration_plan(&[Target::Zero("blog".into())])
            .unwrap();
        let err = executor.migrate(&plan, false).unwrap_err();

        assert!(matches!(err, MigrationError::Irreversible { .. }));
        assert_eq!(executor.adapter().journal().len(), journal_len);
        assert_eq!(recorded(&executor).len(), 3);
    }

    fn add_title_index() -> SchemaOperation {
        SchemaOperation::CreateIndex {
            table: "post".into(),
            name: "blog_post_title_idx".into(),
            columns: vec!["title".into()],
            concurrently: false,
        }
    }

    #[test]
    fn test_fake_records_without_touching_storage() {
        let recorder = Recorder::default();
        let mut executor = executor(blog(), MemoryBackend::new()).with_observer(recorder.clone());

        let state = migrate_all(&mut executor, true);

        assert!(state.table("blog", "post").is_some());
        assert_eq!(recorded(&executor).len(), 2);
        assert!(!executor.adapter().table_exists("blog_post").unwrap());
        assert!(recorder
            .events
            .lock()
            .unwrap()
            .iter()
            .all(|e| matches!(e, MigrationEvent::ApplyStart { fake: true, .. }
                | MigrationEvent::ApplySuccess { fake: true, .. })));
    }

    #[test]
    fn test_mixed_plan_is_rejected() {
        let mut executor = executor(blog(), MemoryBackend::new());
        let plan = vec![
            PlanStep::apply(key("blog", "0001_initial")),
            PlanStep::unapply(key("blog", "0002_title_body")),
        ];
        assert!(matches!(
            executor.migrate(&plan, false),
            Err(MigrationError::InvalidPlan(_))
        ));
        assert!(!executor.ledger().has_table(executor.adapter()).unwrap());
    }

    #[test]
    fn test_empty_plan_leaves_storage_untouched() {
        let mut executor = executor(blog(), MemoryBackend::new());

        executor.migrate(&[], false).unwrap();

        assert!(!executor.ledger().has_table(executor.adapter()).unwrap());
        assert!(executor.adapter().journal().is_empty());
    }

    #[test]
    fn test_fake_unapply_still_rejects_irreversible_migration() {
        let disk = blog().with_migration(
            Migration::new("blog", "0003_data")
                .with_dependency(key("blog", "0002_title_body"))
                .with_operation(SchemaOperation::RunSql {
                    sql: "UPDATE blog_post SET title = ''".into(),
                    reverse_sql: None,
                    atomic: None,
                }),
        );
        let mut executor = executor(disk, MemoryBackend::new());
        migrate_all(&mut executor, false);

        let plan = executor
            .migration_plan(&[Target::Zero("blog".into())])
            .unwrap();
        let err = executor.migrate(&plan, true).unwrap_err();

        match err {
            MigrationError::Irreversible { migration, .. } => {
                assert_eq!(migration, key("blog", "0003_data"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(recorded(&executor).len(), 3);
    }

    fn squashed_only() -> DiskMigrations<ProjectState> {
        DiskMigrations::new().with_migration(
            Migration::new("blog", "0001_squashed_0002")
                .with_replaces(key("blog", "0001_initial"))
                .with_replaces(key("blog", "0002_title_body"))
                .with_operation(create_post())
                .with_operation(add_title()),
        )
    }

    #[test]
    fn test_squash_bookkeeping() {
        let mut executor = executor(squashed_only(), MemoryBackend::new());
        migrate_all(&mut executor, false);

        assert_eq!(
            recorded(&executor),
            vec![
                "blog.0001_initial",
                "blog.0001_squashed_0002",
                "blog.0002_title_body"
            ]
        );
        assert!(executor
            .loader()
            .is_applied(&key("blog", "0001_squashed_0002")));

        let plan = executor
            .migration_plan(&[Target::Zero("blog".into())])
            .unwrap();
        executor.migrate(&plan, false).unwrap();
        assert!(recorded(&executor).is_empty());
    }

    #[test]
    fn test_check_replacements_records_completed_squash() {
        let mut backend = MemoryBackend::new();
        let ledger = Ledger::default();
        ledger
            .record_applied(&mut backend, &key("blog", "0001_initial"))
            .unwrap();
        ledger
            .record_applied(&mut backend, &key("blog", "0002_title_body"))
            .unwrap();
        let mut executor = executor(squashed_only(), backend);

        executor.check_replacements().unwrap();

        assert!(recorded(&executor).contains(&"blog.0001_squashed_0002".to_string()));
    }

    #[test]
    fn test_prune_stale_rows() {
        let mut backend = MemoryBackend::new();
        let ledger = Ledger::default();
        ledger
            .record_applied(&mut backend, &key("blog", "0001_initial"))
            .unwrap();
        ledger
            .record_applied(&mut backend, &key("blog", "0000_removed"))
            .unwrap();
        ledger
            .record_applied(&mut backend, &key("shop", "0001_removed"))
            .unwrap();
        let mut executor = executor(blog(), backend);

        let outcome = executor.prune("blog").unwrap();

        assert_eq!(outcome, PruneOutcome::Pruned(vec![key("blog", "0000_removed")]));
        assert_eq!(
            recorded(&executor),
            vec!["blog.0001_initial", "shop.0001_removed"]
        );
    }

    #[test]
    fn test_prune_blocked_by_squash() {
        let mut backend = MemoryBackend::new();
        let ledger = Ledger::default();
        ledger
            .record_applied(&mut backend, &key("blog", "0001_initial"))
            .unwrap();
        let mut executor = executor(squashed_only(), backend);

        let outcome = executor.prune("blog").unwrap();

        assert_eq!(
            outcome,
            PruneOutcome::Blocked(vec![key("blog", "0001_squashed_0002")])
        );
        assert_eq!(recorded(&executor), vec!["blog.0001_initial"]);
    }

    #[test]
    fn test_cross_component_plan_threads_state() {
        let disk = blog()
            .with_migration(
                Migration::new("shop", "0001_initial")
                    .with_dependency(Dependency::Latest("blog".into()))
                    .with_operation(SchemaOperation::CreateTable {
                        name: "order".into(),
                        columns: vec![ColumnDef::new("post_id", "integer")],
                    }),
            );
        let mut executor = executor(disk, MemoryBackend::new());

        let plan = executor
            .migration_plan(&[Target::Node(key("shop", "0001_initial"))])
            .unwrap();
        assert_eq!(plan.len(), 3);
        let state = executor.migrate(&plan, false).unwrap();

        assert!(state.table("blog", "post").is_some());
        assert!(state.table("shop", "order").is_some());
        assert!(executor.check_consistent_history().is_ok());
    }
}
