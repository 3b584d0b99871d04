//! A single authored migration and its forward/backward execution.
//!
//! A migration is a named, ordered batch of operations plus dependency
//! metadata. Executing it threads a schema snapshot through every operation
//! and issues the physical change through a [`SchemaEditor`].
//!
//! # Atomicity
//!
//! Each operation runs inside its own scoped transaction when it is atomic
//! and the editor is not already inside a transaction spanning the whole
//! migration. An operation's explicit `atomic()` always wins over the
//! migration's flag; `Some(false)` lets storage-level work that cannot run
//! inside a transaction (such as concurrent index builds) execute bare.
//! A failure aborts the remaining operations; earlier non-atomic effects are
//! not undone.
//!
//! # Reversal
//!
//! Backward operations need both the state before and after themselves,
//! which no longer exist once later operations have run. Unapplying
//! therefore happens in two phases: the operations are replayed forward to
//! record a [`ReversalStep`] per operation, then the steps run in reverse.
//! Irreversible operations are detected during the first phase, before any
//! physical change.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use tracing::debug;

use crate::adapter::{self, SchemaEditor};
use crate::error::{MigrationError, Result};
use crate::key::{Dependency, MigrationKey};
use crate::operation::Operation;

/// Composed names longer than this are cut short with `_and_more`.
const MAX_SUGGESTED_NAME_LEN: usize = 52;

#[derive(Debug)]
pub struct Migration<S> {
    key: MigrationKey,
    pub operations: Vec<Box<dyn Operation<S>>>,
    pub dependencies: Vec<Dependency>,
    /// Migrations that must run after this one, mirrored into dependencies.
    pub run_before: Vec<Dependency>,
    /// Migrations this one squashes.
    pub replaces: Vec<MigrationKey>,
    pub atomic: bool,
    pub initial: bool,
}

/// One recorded operation of an unapply run.
pub struct ReversalStep<'a, S> {
    pub operation: &'a dyn Operation<S>,
    pub state_before: S,
    pub state_after: S,
}

impl<S> Migration<S> {
    pub fn new(component: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: MigrationKey::new(component, name),
            operations: Vec::new(),
            dependencies: Vec::new(),
            run_before: Vec::new(),
            replaces: Vec::new(),
            atomic: true,
            initial: false,
        }
    }

    pub fn key(&self) -> &MigrationKey {
        &self.key
    }

    pub fn component(&self) -> &str {
        &self.key.component
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn with_operation(mut self, operation: impl Operation<S> + 'static) -> Self {
        self.operations.push(Box::new(operation));
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<Dependency>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_run_before(mut self, dependency: impl Into<Dependency>) -> Self {
        self.run_before.push(dependency.into());
        self
    }

    pub fn with_replaces(mut self, key: MigrationKey) -> Self {
        self.replaces.push(key);
        self
    }

    pub fn with_atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    pub fn with_initial(mut self, initial: bool) -> Self {
        self.initial = initial;
        self
    }

    pub fn is_squash(&self) -> bool {
        !self.replaces.is_empty()
    }

    /// Run every operation's state transition against `state`.
    pub fn mutate_state_in_place(&self, state: &mut S) {
        for operation in &self.operations {
            operation.state_forwards(self.component(), state);
        }
    }

    fn runs_atomically(&self, operation: &dyn Operation<S>) -> bool {
        operation.atomic().unwrap_or(self.atomic)
    }

    fn run_physical<F>(
        &self,
        editor: &mut dyn SchemaEditor,
        operation: &dyn Operation<S>,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut dyn SchemaEditor) -> Result<()>,
    {
        if !editor.in_transaction() && self.runs_atomically(operation) {
            adapter::atomic(editor, f)
        } else {
            f(editor)
        }
    }

    /// Suggest a file name for this migration from its operations.
    pub fn suggest_name(&self) -> String {
        if self.initial {
            return "initial".to_string();
        }
        let fragments: Vec<String> = self
            .operations
            .iter()
            .filter_map(|op| op.name_fragment())
            .filter(|f| !f.is_empty())
            .map(|f| non_word().replace_all(&f, "_").into_owned())
            .collect();
        if fragments.is_empty() || fragments.len() != self.operations.len() {
            return format!("auto_{}", Utc::now().format("%Y%m%d_%H%M"));
        }
        let mut name = fragments[0].clone();
        for fragment in &fragments[1..] {
            let candidate = format!("{}_{}", name, fragment);
            if candidate.len() > MAX_SUGGESTED_NAME_LEN {
                name.push_str("_and_more");
                break;
            }
            name = candidate;
        }
        name
    }
}

impl<S: Clone> Migration<S> {
    /// Return a copy of `state` with this migration's state changes applied.
    pub fn mutate_state(&self, state: &S) -> S {
        let mut new_state = state.clone();
        self.mutate_state_in_place(&mut new_state);
        new_state
    }

    /// Apply the migration forwards, returning the resulting state.
    ///
    /// `state` must represent every migration this one depends on.
    pub fn apply(&self, mut state: S, editor: &mut dyn SchemaEditor) -> Result<S> {
        for operation in &self.operations {
            let operation = operation.as_ref();
            let before = state.clone();
            operation.state_forwards(self.component(), &mut state);
            debug!(
                migration = %self.key,
                operation = %operation.describe(),
                atomic = self.runs_atomically(operation),
                "applying operation"
            );
            self.run_physical(editor, operation, |editor| {
                operation.database_forwards(self.component(), editor, &before, &state)
            })?;
        }
        Ok(state)
    }

    /// Record the intermediate states of every operation, failing on the
    /// first irreversible one. Pure.
    pub fn reversal_steps(&self, state: &S) -> Result<Vec<ReversalStep<'_, S>>> {
        let mut steps = Vec::with_capacity(self.operations.len());
        let mut current = state.clone();
        for operation in &self.operations {
            let operation = operation.as_ref();
            if !operation.reversible() {
                return Err(MigrationError::Irreversible {
                    operation: operation.describe(),
                    migration: self.key.clone(),
                });
            }
            let state_before = current.clone();
            operation.state_forwards(self.component(), &mut current);
            steps.push(ReversalStep {
                operation,
                state_before,
                state_after: current.clone(),
            });
        }
        Ok(steps)
    }

    /// Unapply the migration, returning the pre-migration state.
    ///
    /// `state` must represent every migration before this one, i.e. the
    /// state this migration was originally applied on top of.
    pub fn unapply(&self, state: S, editor: &mut dyn SchemaEditor) -> Result<S> {
        let steps = self.reversal_steps(&state)?;
        for step in steps.iter().rev() {
            let operation = step.operation;
            debug!(
                migration = %self.key,
                operation = %operation.describe(),
                atomic = self.runs_atomically(operation),
                "reverting operation"
            );
            self.run_physical(editor, operation, |editor| {
                operation.database_backwards(
                    self.component(),
                    editor,
                    &step.state_after,
                    &step.state_before,
                )
            })?;
        }
        Ok(state)
    }
}

fn non_word() -> &'static Regex {
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    NON_WORD.get_or_init(|| Regex::new(r"\W+").expect("valid regex"))
}
