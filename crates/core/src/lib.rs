//! Migration Graph Core Library
//!
//! This library provides the core data structures and functionality for
//! graphing, validating, planning and applying dependency-linked schema
//! migrations across independently versioned components.

pub mod adapter;
pub mod backend;
pub mod config;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod graph;
pub mod key;
pub mod ledger;
pub mod loader;
pub mod migration;
pub mod operation;
pub mod operations;
pub mod planner;
pub mod source;
pub mod state;

// Re-export commonly used types
pub use adapter::{LedgerBackend, SchemaEditor, StorageAdapter};
pub use backend::MemoryBackend;
pub use config::{LoaderConfig, MigratorConfig};
pub use error::{MigrationError, Result};
pub use executor::{MigrationEvent, MigrationExecutor, MigrationObserver, PruneOutcome};
pub use graph::MigrationGraph;
pub use key::{Dependency, MigrationKey};
pub use ledger::{AppliedMap, AppliedRecord, Ledger};
pub use loader::{fold_decision, FoldDecision, MigrationLoader};
pub use migration::Migration;
pub use operation::Operation;
pub use operations::SchemaOperation;
pub use planner::{Direction, Plan, PlanStep, Target};
pub use source::{DiskMigrations, FileSystemSource, MigrationSource};
pub use state::ProjectState;
