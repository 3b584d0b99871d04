//! Storage adapter contracts.
//!
//! The core never emits DDL by itself. Physical work goes through a
//! [`SchemaEditor`], and the applied-migration ledger goes through a
//! [`LedgerBackend`]. A concrete storage target implements both and is
//! then usable as a [`StorageAdapter`].

use tracing::debug;

use crate::error::Result;
use crate::key::MigrationKey;
use crate::ledger::AppliedRecord;

/// Physical schema access with explicit transaction control.
pub trait SchemaEditor {
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;

    /// True while a transaction opened with [`SchemaEditor::begin`] is live.
    fn in_transaction(&self) -> bool;

    /// Whether DDL can run inside a transaction and be rolled back.
    fn supports_transactional_ddl(&self) -> bool;

    fn execute(&mut self, sql: &str) -> Result<()>;

    fn table_exists(&self, name: &str) -> Result<bool>;
}

/// Row-level access to the ledger table.
pub trait LedgerBackend {
    fn create_ledger_table(&mut self, table: &str) -> Result<()>;
    fn ledger_rows(&self, table: &str) -> Result<Vec<AppliedRecord>>;
    fn insert_ledger_row(&mut self, table: &str, record: AppliedRecord) -> Result<()>;
    fn delete_ledger_row(&mut self, table: &str, key: &MigrationKey) -> Result<()>;
    fn clear_ledger(&mut self, table: &str) -> Result<()>;
}

pub trait StorageAdapter: SchemaEditor + LedgerBackend {
    fn as_editor(&mut self) -> &mut dyn SchemaEditor;
}

impl<T: SchemaEditor + LedgerBackend> StorageAdapter for T {
    fn as_editor(&mut self) -> &mut dyn SchemaEditor {
        self
    }
}

/// Run `f` inside a scoped transaction: commit on success, roll back on
/// failure. The original error is returned even if the rollback fails.
pub fn atomic<T, F>(editor: &mut dyn SchemaEditor, f: F) -> Result<T>
where
    F: FnOnce(&mut dyn SchemaEditor) -> Result<T>,
{
    editor.begin()?;
    match f(editor) {
        Ok(value) => {
            editor.commit()?;
            Ok(value)
        }
        Err(err) => {
            debug!(error = %err, "rolling back transaction");
            if let Err(rollback_err) = editor.rollback() {
                debug!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
