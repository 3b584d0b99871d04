//! Reference schema snapshot: components own tables, tables own columns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// `name type [NOT NULL]`
    pub fn to_sql(&self) -> String {
        if self.nullable {
            format!("{} {}", self.name, self.kind)
        } else {
            format!("{} {} NOT NULL", self.name, self.kind)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableState {
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub indexes: BTreeMap<String, Vec<String>>,
}

impl TableState {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// The shape of every table as described by a set of applied migrations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    components: BTreeMap<String, BTreeMap<String, TableState>>,
}

impl ProjectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, component: &str, name: &str) -> Option<&TableState> {
        self.components.get(component)?.get(name)
    }

    pub fn table_mut(&mut self, component: &str, name: &str) -> Option<&mut TableState> {
        self.components.get_mut(component)?.get_mut(name)
    }

    pub fn add_table(&mut self, component: &str, name: &str, table: TableState) {
        self.components
            .entry(component.to_string())
            .or_default()
            .insert(name.to_string(), table);
    }

    pub fn remove_table(&mut self, component: &str, name: &str) -> Option<TableState> {
        let tables = self.components.get_mut(component)?;
        let removed = tables.remove(name);
        if tables.is_empty() {
            self.components.remove(component);
        }
        removed
    }

    /// Table names of one component, sorted.
    pub fn tables(&self, component: &str) -> Vec<&str> {
        self.components
            .get(component)
            .map(|tables| tables.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
