//! Schema catalog: tables, columns, joins and variables.
//!
//! A `Schema` is immutable once built. "Mutations" such as [`Schema::add_table`]
//! return a new value with a fresh identity, so caches keyed on
//! [`Schema::uid`] never observe a changed schema.

pub mod localized;
pub mod table;
pub mod variable;

pub use localized::LocalizedString;
pub use table::{
    Column, ColumnSource, ColumnType, ContentItem, EnumValue, Join, JoinKind, Section, SectionTag, Table,
};
pub use variable::Variable;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SCHEMA_UID: AtomicU64 = AtomicU64::new(1);

fn next_uid() -> u64 {
    NEXT_SCHEMA_UID.fetch_add(1, Ordering::Relaxed)
}

/// Persisted form of a schema
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaJson {
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SchemaJson", into = "SchemaJson")]
pub struct Schema {
    uid: u64,
    tables: Vec<Table>,
    variables: Vec<Variable>,
    table_index: HashMap<String, usize>,
    /// Flattened columns per table, in document order
    column_index: HashMap<String, IndexMap<String, Column>>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.tables == other.tables && self.variables == other.variables
    }
}

impl From<SchemaJson> for Schema {
    fn from(json: SchemaJson) -> Self {
        Self::build(json.tables, json.variables)
    }
}

impl From<Schema> for SchemaJson {
    fn from(schema: Schema) -> Self {
        SchemaJson {
            tables: schema.tables,
            variables: schema.variables,
        }
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::build(Vec::new(), Vec::new())
    }

    fn build(tables: Vec<Table>, variables: Vec<Variable>) -> Self {
        let mut table_index = HashMap::new();
        let mut column_index = HashMap::new();
        for (i, table) in tables.iter().enumerate() {
            table_index.insert(table.id.clone(), i);
            let columns: IndexMap<String, Column> = table
                .columns()
                .into_iter()
                .map(|c| (c.id.clone(), c.clone()))
                .collect();
            column_index.insert(table.id.clone(), columns);
        }

        Self {
            uid: next_uid(),
            tables,
            variables,
            table_index,
            column_index,
        }
    }

    /// Process-unique identity of this schema value
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn get_tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn get_table(&self, table_id: &str) -> Option<&Table> {
        self.table_index.get(table_id).map(|&i| &self.tables[i])
    }

    pub fn get_column(&self, table_id: &str, column_id: &str) -> Option<&Column> {
        self.column_index.get(table_id)?.get(column_id)
    }

    /// Columns of a table flattened out of sections, in document order
    pub fn get_columns(&self, table_id: &str) -> Vec<&Column> {
        self.column_index
            .get(table_id)
            .map(|columns| columns.values().collect())
            .unwrap_or_default()
    }

    pub fn get_variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn get_variable(&self, variable_id: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.id == variable_id)
    }

    /// New schema with `table` added, replacing any table with the same id
    pub fn add_table(&self, table: Table) -> Schema {
        self.add_tables(vec![table])
    }

    pub fn add_tables(&self, tables: Vec<Table>) -> Schema {
        let mut all = self.tables.clone();
        for table in tables {
            match all.iter().position(|t| t.id == table.id) {
                Some(i) => all[i] = table,
                None => all.push(table),
            }
        }
        Self::build(all, self.variables.clone())
    }

    /// New schema with `variable` added, replacing any with the same id
    pub fn add_variable(&self, variable: Variable) -> Schema {
        let mut variables = self.variables.clone();
        match variables.iter().position(|v| v.id == variable.id) {
            Some(i) => variables[i] = variable,
            None => variables.push(variable),
        }
        Self::build(self.tables.clone(), variables)
    }

    pub fn to_json(&self) -> SchemaJson {
        SchemaJson::from(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::LiteralType;
    use serde_json::json;

    fn sample() -> Schema {
        Schema::new().add_table(
            Table::new("t1", "T1")
                .with_column(Column::new("text", LiteralType::Text))
                .with_column(Column::new("number", LiteralType::Number)),
        )
    }

    #[test]
    fn test_lookup() {
        let schema = sample();
        assert!(schema.get_table("t1").is_some());
        assert!(schema.get_table("t2").is_none());
        assert_eq!(
            schema.get_column("t1", "number").unwrap().literal_type(),
            Some(LiteralType::Number)
        );
        assert!(schema.get_column("t1", "missing").is_none());
        assert!(schema.get_column("t2", "number").is_none());
        let ids: Vec<_> = schema.get_columns("t1").iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec!["text", "number"]);
    }

    #[test]
    fn test_mutation_returns_new_identity() {
        let schema = sample();
        let extended = schema.add_table(Table::new("t2", "T2"));
        assert_ne!(schema.uid(), extended.uid());
        assert!(schema.get_table("t2").is_none());
        assert!(extended.get_table("t2").is_some());

        let replaced = extended.add_table(Table::new("t1", "Replaced"));
        assert_eq!(replaced.get_tables().len(), 2);
        assert!(replaced.get_columns("t1").is_empty());

        let with_var = schema.add_variable(Variable::new("v1", LiteralType::Number));
        assert!(with_var.get_variable("v1").is_some());
        assert!(schema.get_variables().is_empty());
    }

    #[test]
    fn test_json_roundtrip() {
        let json = json!({
            "tables": [{
                "id": "t1",
                "name": { "en": "T1" },
                "ordering": "number",
                "contents": [
                    { "id": "number", "name": { "en": "Number" }, "type": "number" }
                ]
            }],
            "variables": [{ "id": "v1", "name": { "en": "V1" }, "type": "number" }]
        });
        let schema: Schema = serde_json::from_value(json).unwrap();
        assert_eq!(schema.get_table("t1").unwrap().ordering.as_deref(), Some("number"));
        assert_eq!(schema.get_variables().len(), 1);

        let again: Schema = serde_json::from_value(serde_json::to_value(&schema).unwrap()).unwrap();
        assert_eq!(again, schema);
        assert_ne!(again.uid(), schema.uid());
    }
}
