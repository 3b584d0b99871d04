//! Concrete schema operations over [`ProjectState`].
//!
//! Physical table names are `<component>_<table>`.

use serde::{Deserialize, Serialize};

use crate::adapter::SchemaEditor;
use crate::error::{MigrationError, Result};
use crate::operation::Operation;
use crate::state::{ProjectState, TableState};

pub use crate::state::ColumnDef;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaOperation {
    CreateTable {
        name: String,
        #[serde(default)]
        columns: Vec<ColumnDef>,
    },
    DropTable {
        name: String,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    RemoveColumn {
        table: String,
        column: String,
    },
    RenameColumn {
        table: String,
        old_name: String,
        new_name: String,
    },
    CreateIndex {
        table: String,
        name: String,
        columns: Vec<String>,
        /// Built without locking the table; cannot run inside a transaction.
        #[serde(default)]
        concurrently: bool,
    },
    RunSql {
        sql: String,
        #[serde(default)]
        reverse_sql: Option<String>,
        #[serde(default)]
        atomic: Option<bool>,
    },
}

fn db_table(component: &str, table: &str) -> String {
    format!("{}_{}", component, table)
}

fn missing_table(component: &str, table: &str) -> MigrationError {
    MigrationError::Backend(format!(
        "no state recorded for table {}",
        db_table(component, table)
    ))
}

fn create_table_sql(component: &str, name: &str, table: &TableState) -> String {
    let columns: Vec<String> = table.columns.iter().map(ColumnDef::to_sql).collect();
    format!(
        "CREATE TABLE {} ({})",
        db_table(component, name),
        columns.join(", ")
    )
}

fn create_index_sql(component: &str, table: &str, name: &str, columns: &[String], concurrently: bool) -> String {
    format!(
        "CREATE INDEX {}{} ON {} ({})",
        if concurrently { "CONCURRENTLY " } else { "" },
        name,
        db_table(component, table),
        columns.join(", ")
    )
}

impl Operation<ProjectState> for SchemaOperation {
    fn state_forwards(&self, component: &str, state: &mut ProjectState) {
        match self {
            SchemaOperation::CreateTable { name, columns } => {
                state.add_table(
                    component,
                    name,
                    TableState {
                        columns: columns.clone(),
                        ..TableState::default()
                    },
                );
            }
            SchemaOperation::DropTable { name } => {
                state.remove_table(component, name);
            }
            SchemaOperation::AddColumn { table, column } => {
                if let Some(t) = state.table_mut(component, table) {
                    t.columns.retain(|c| c.name != column.name);
                    t.columns.push(column.clone());
                }
            }
            SchemaOperation::RemoveColumn { table, column } => {
                if let Some(t) = state.table_mut(component, table) {
                    t.columns.retain(|c| &c.name != column);
                    for index_columns in t.indexes.values_mut() {
                        index_columns.retain(|c| c != column);
                    }
                }
            }
            SchemaOperation::RenameColumn {
                table,
                old_name,
                new_name,
            } => {
                if let Some(t) = state.table_mut(component, table) {
                    for c in t.columns.iter_mut().filter(|c| &c.name == old_name) {
                        c.name = new_name.clone();
                    }
                    for index_columns in t.indexes.values_mut() {
                        for c in index_columns.iter_mut().filter(|c| *c == old_name) {
                            *c = new_name.clone();
                        }
                    }
                }
            }
            SchemaOperation::CreateIndex {
                table, name, columns, ..
            } => {
                if let Some(t) = state.table_mut(component, table) {
                    t.indexes.insert(name.clone(), columns.clone());
                }
            }
            SchemaOperation::RunSql { .. } => {}
        }
    }

    fn database_forwards(
        &self,
        component: &str,
        editor: &mut dyn SchemaEditor,
        _from: &ProjectState,
        to: &ProjectState,
    ) -> Result<()> {
        match self {
            SchemaOperation::CreateTable { name, .. } => {
                let table = to
                    .table(component, name)
                    .ok_or_else(|| missing_table(component, name))?;
                editor.execute(&create_table_sql(component, name, table))
            }
            SchemaOperation::DropTable { name } => {
                editor.execute(&format!("DROP TABLE {}", db_table(component, name)))
            }
            SchemaOperation::AddColumn { table, column } => editor.execute(&format!(
                "ALTER TABLE {} ADD COLUMN {}",
                db_table(component, table),
                column.to_sql()
            )),
            SchemaOperation::RemoveColumn { table, column } => editor.execute(&format!(
                "ALTER TABLE {} DROP COLUMN {}",
                db_table(component, table),
                column
            )),
            SchemaOperation::RenameColumn {
                table,
                old_name,
                new_name,
            } => editor.execute(&format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                db_table(component, table),
                old_name,
                new_name
            )),
            SchemaOperation::CreateIndex {
                table,
                name,
                columns,
                concurrently,
            } => editor.execute(&create_index_sql(component, table, name, columns, *concurrently)),
            SchemaOperation::RunSql { sql, .. } => editor.execute(sql),
        }
    }

    fn database_backwards(
        &self,
        component: &str,
        editor: &mut dyn SchemaEditor,
        _from: &ProjectState,
        to: &ProjectState,
    ) -> Result<()> {
        match self {
            SchemaOperation::CreateTable { name, .. } => {
                editor.execute(&format!("DROP TABLE {}", db_table(component, name)))
            }
            SchemaOperation::DropTable { name } => {
                let table = to
                    .table(component, name)
                    .ok_or_else(|| missing_table(component, name))?;
                editor.execute(&create_table_sql(component, name, table))?;
                for (index, columns) in &table.indexes {
                    editor.execute(&create_index_sql(component, name, index, columns, false))?;
                }
                Ok(())
            }
            SchemaOperation::AddColumn { table, column } => editor.execute(&format!(
                "ALTER TABLE {} DROP COLUMN {}",
                db_table(component, table),
                column.name
            )),
            SchemaOperation::RemoveColumn { table, column } => {
                let def = to
                    .table(component, table)
                    .and_then(|t| t.column(column))
                    .ok_or_else(|| missing_table(component, table))?;
                editor.execute(&format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    db_table(component, table),
                    def.to_sql()
                ))
            }
            SchemaOperation::RenameColumn {
                table,
                old_name,
                new_name,
            } => editor.execute(&format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                db_table(component, table),
                new_name,
                old_name
            )),
            SchemaOperation::CreateIndex {
                name, concurrently, ..
            } => editor.execute(&format!(
                "DROP INDEX {}{}",
                if *concurrently { "CONCURRENTLY " } else { "" },
                name
            )),
            SchemaOperation::RunSql { reverse_sql, .. } => match reverse_sql {
                Some(sql) => editor.execute(sql),
                None => Ok(()),
            },
        }
    }

    fn reversible(&self) -> bool {
        match self {
            SchemaOperation::RunSql { reverse_sql, .. } => reverse_sql.is_some(),
            _ => true,
        }
    }

    fn atomic(&self) -> Option<bool> {
        match self {
            SchemaOperation::CreateIndex { concurrently: true, .. } => Some(false),
            SchemaOperation::RunSql { atomic, .. } => *atomic,
            _ => None,
        }
    }

    fn name_fragment(&self) -> Option<String> {
        match self {
            SchemaOperation::CreateTable { name, .. } => Some(name.to_lowercase()),
            SchemaOperation::DropTable { name } => Some(format!("delete_{}", name.to_lowercase())),
            SchemaOperation::AddColumn { table, column } => {
                Some(format!("{}_{}", table.to_lowercase(), column.name.to_lowercase()))
            }
            SchemaOperation::RemoveColumn { table, column } => Some(format!(
                "remove_{}_{}",
                table.to_lowercase(),
                column.to_lowercase()
            )),
            SchemaOperation::RenameColumn {
                table,
                old_name,
                new_name,
            } => Some(format!(
                "rename_{}_{}_{}",
                old_name.to_lowercase(),
                table.to_lowercase(),
                new_name.to_lowercase()
            )),
            SchemaOperation::CreateIndex { name, .. } => Some(name.to_lowercase()),
            SchemaOperation::RunSql { .. } => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            SchemaOperation::CreateTable { name, .. } => format!("Create table {}", name),
            SchemaOperation::DropTable { name } => format!("Delete table {}", name),
            SchemaOperation::AddColumn { table, column } => {
                format!("Add column {} to {}", column.name, table)
            }
            SchemaOperation::RemoveColumn { table, column } => {
                format!("Remove column {} from {}", column, table)
            }
            SchemaOperation::RenameColumn {
                table,
                old_name,
                new_name,
            } => format!("Rename column {} on {} to {}", old_name, table, new_name),
            SchemaOperation::CreateIndex { table, name, .. } => {
                format!("Create index {} on {}", name, table)
            }
            SchemaOperation::RunSql { .. } => "Raw SQL operation".to_string(),
        }
    }
}
