//! In-memory storage backend
//!
//! Journals every executed statement and tracks which tables exist, so it
//! can stand in for a real database in tests and in the CLI. Transactions
//! snapshot the backend on `begin` and restore it on `rollback`; when
//! transactional DDL is disabled, executed statements survive a rollback
//! while ledger rows do not, like databases that auto-commit DDL.
//!
//! The whole backend can be persisted to a JSON file between runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::{LedgerBackend, SchemaEditor};
use crate::error::{MigrationError, Result};
use crate::key::MigrationKey;
use crate::ledger::AppliedRecord;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    tables: BTreeSet<String>,
    ledgers: BTreeMap<String, Vec<AppliedRecord>>,
    journal_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBackend {
    tables: BTreeSet<String>,
    ledgers: BTreeMap<String, Vec<AppliedRecord>>,
    journal: Vec<String>,
    #[serde(default = "default_transactional_ddl")]
    transactional_ddl: bool,
    #[serde(skip)]
    transaction: Option<Snapshot>,
    #[serde(skip)]
    committed: usize,
    #[serde(skip)]
    fail_on: Option<String>,
}

fn default_transactional_ddl() -> bool {
    true
}

fn table_ddl() -> &'static Regex {
    static TABLE_DDL: OnceLock<Regex> = OnceLock::new();
    TABLE_DDL.get_or_init(|| {
        Regex::new(r"(?i)^\s*(CREATE|DROP)\s+TABLE\s+(\w+)").expect("valid regex")
    })
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: BTreeSet::new(),
            ledgers: BTreeMap::new(),
            journal: Vec::new(),
            transactional_ddl: true,
            transaction: None,
            committed: 0,
            fail_on: None,
        }
    }

    /// A backend whose DDL is not rolled back with the transaction.
    pub fn without_transactional_ddl() -> Self {
        Self {
            transactional_ddl: false,
            ..Self::new()
        }
    }

    /// Make every statement containing `needle` fail.
    pub fn fail_on(&mut self, needle: impl Into<String>) {
        self.fail_on = Some(needle.into());
    }

    pub fn clear_failure(&mut self) {
        self.fail_on = None;
    }

    /// Statements executed so far, rolled-back ones excluded.
    pub fn journal(&self) -> &[String] {
        &self.journal
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }

    pub fn transactions_committed(&self) -> usize {
        self.committed
    }

    /// Load a backend from `path`, or start empty when the file is absent.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write the backend to `path` via a temporary file and a rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if self.transaction.is_some() {
            return Err(MigrationError::Backend(
                "cannot save while a transaction is open".to_string(),
            ));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(self)?;
        let mut file = File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn track_table_ddl(&mut self, sql: &str) {
        if let Some(caps) = table_ddl().captures(sql) {
            let table = caps[2].to_string();
            if caps[1].eq_ignore_ascii_case("create") {
                self.tables.insert(table);
            } else {
                self.tables.remove(&table);
            }
        }
    }

    fn ledger_mut(&mut self, table: &str) -> Result<&mut Vec<AppliedRecord>> {
        self.ledgers
            .get_mut(table)
            .ok_or_else(|| MigrationError::Backend(format!("no such table: {}", table)))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaEditor for MemoryBackend {
    fn begin(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(MigrationError::Backend(
                "a transaction is already open".to_string(),
            ));
        }
        self.transaction = Some(Snapshot {
            tables: self.tables.clone(),
            ledgers: self.ledgers.clone(),
            journal_len: self.journal.len(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.transaction
            .take()
            .ok_or_else(|| MigrationError::Backend("no transaction to commit".to_string()))?;
        self.committed += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let snapshot = self
            .transaction
            .take()
            .ok_or_else(|| MigrationError::Backend("no transaction to roll back".to_string()))?;
        self.ledgers = snapshot.ledgers;
        if self.transactional_ddl {
            self.tables = snapshot.tables;
            self.journal.truncate(snapshot.journal_len);
        }
        debug!(transactional_ddl = self.transactional_ddl, "transaction rolled back");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn supports_transactional_ddl(&self) -> bool {
        self.transactional_ddl
    }

    fn execute(&mut self, sql: &str) -> Result<()> {
        if let Some(needle) = &self.fail_on {
            if sql.contains(needle.as_str()) {
                return Err(MigrationError::Backend(format!(
                    "statement failed: {}",
                    sql
                )));
            }
        }
        self.track_table_ddl(sql);
        self.journal.push(sql.to_string());
        Ok(())
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.tables.contains(name))
    }
}

impl LedgerBackend for MemoryBackend {
    fn create_ledger_table(&mut self, table: &str) -> Result<()> {
        self.execute(&format!(
            "CREATE TABLE {} (component varchar(255), name varchar(255), applied_at timestamp)",
            table
        ))?;
        self.ledgers.entry(table.to_string()).or_default();
        Ok(())
    }

    fn ledger_rows(&self, table: &str) -> Result<Vec<AppliedRecord>> {
        Ok(self.ledgers.get(table).cloned().unwrap_or_default())
    }

    fn insert_ledger_row(&mut self, table: &str, record: AppliedRecord) -> Result<()> {
        let rows = self.ledger_mut(table)?;
        rows.retain(|r| r.component != record.component || r.name != record.name);
        rows.push(record);
        Ok(())
    }

    fn delete_ledger_row(&mut self, table: &str, key: &MigrationKey) -> Result<()> {
        let rows = self.ledger_mut(table)?;
        rows.retain(|r| r.component != key.component || r.name != key.name);
        Ok(())
    }

    fn clear_ledger(&mut self, table: &str) -> Result<()> {
        self.ledger_mut(table)?.clear();
        Ok(())
    }
}
