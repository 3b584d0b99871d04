//! The applied-migration ledger.
//!
//! One row per migration that has physically run against a storage target,
//! keyed by `(component, name)`. The table is created lazily the first time
//! a row is written.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::StorageAdapter;
use crate::error::{MigrationError, Result};
use crate::key::MigrationKey;

pub const DEFAULT_LEDGER_TABLE: &str = "schema_migrations";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub component: String,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

impl AppliedRecord {
    pub fn new(key: &MigrationKey) -> Self {
        Self {
            component: key.component.clone(),
            name: key.name.clone(),
            applied_at: Utc::now(),
        }
    }

    pub fn key(&self) -> MigrationKey {
        MigrationKey::new(self.component.clone(), self.name.clone())
    }
}

/// Applied migrations indexed by key.
pub type AppliedMap = BTreeMap<MigrationKey, AppliedRecord>;

#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Ledger {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn has_table<A: StorageAdapter + ?Sized>(&self, adapter: &A) -> Result<bool> {
        adapter.table_exists(&self.table)
    }

    /// Create the ledger table unless it already exists.
    pub fn ensure_schema<A: StorageAdapter + ?Sized>(&self, adapter: &mut A) -> Result<()> {
        if self.has_table(adapter)? {
            return Ok(());
        }
        debug!(table = %self.table, "creating migration ledger table");
        adapter
            .create_ledger_table(&self.table)
            .map_err(|e| MigrationError::LedgerSchemaMissing {
                reason: e.to_string(),
            })
    }

    /// Every applied migration. A missing table means nothing has run yet.
    pub fn applied_migrations<A: StorageAdapter + ?Sized>(&self, adapter: &A) -> Result<AppliedMap> {
        if !self.has_table(adapter)? {
            return Ok(AppliedMap::new());
        }
        Ok(adapter
            .ledger_rows(&self.table)?
            .into_iter()
            .map(|record| (record.key(), record))
            .collect())
    }

    pub fn record_applied<A: StorageAdapter + ?Sized>(
        &self,
        adapter: &mut A,
        key: &MigrationKey,
    ) -> Result<()> {
        self.ensure_schema(adapter)?;
        adapter.insert_ledger_row(&self.table, AppliedRecord::new(key))
    }

    pub fn record_unapplied<A: StorageAdapter + ?Sized>(
        &self,
        adapter: &mut A,
        key: &MigrationKey,
    ) -> Result<()> {
        self.ensure_schema(adapter)?;
        adapter.delete_ledger_row(&self.table, key)
    }

    /// Delete every row. Only meant for resetting test databases.
    pub fn flush<A: StorageAdapter + ?Sized>(&self, adapter: &mut A) -> Result<()> {
        if !self.has_table(adapter)? {
            return Ok(());
        }
        adapter.clear_ledger(&self.table)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_TABLE)
    }
}
