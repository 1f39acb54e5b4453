//! Row access capability supplied by the host.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of following a join column from a row
#[derive(Clone, Default)]
pub enum Joined {
    #[default]
    None,
    One(Arc<dyn Row>),
    Many(Vec<Arc<dyn Row>>),
}

impl Joined {
    pub fn into_rows(self) -> Vec<Arc<dyn Row>> {
        match self {
            Joined::None => Vec::new(),
            Joined::One(row) => vec![row],
            Joined::Many(rows) => rows,
        }
    }
}

/// A row the evaluator can read lazily.
///
/// Every access may suspend; failures are reported by the host and
/// surfaced unchanged as [`super::EvalError::Row`].
#[async_trait]
pub trait Row: Send + Sync {
    async fn get_primary_key(&self) -> anyhow::Result<Value>;

    /// Stored value of a non-join column, `Null` when absent
    async fn get_field(&self, column_id: &str) -> anyhow::Result<Value>;

    async fn follow_join(&self, column_id: &str) -> anyhow::Result<Joined>;
}

/// Row held in memory, mostly useful for hosts that already loaded their data
#[derive(Clone, Default)]
pub struct MemoryRow {
    primary_key: Value,
    values: Map<String, Value>,
    joins: HashMap<String, Joined>,
}

impl MemoryRow {
    pub fn new(primary_key: impl Into<Value>, values: Map<String, Value>) -> Self {
        Self {
            primary_key: primary_key.into(),
            values,
            joins: HashMap::new(),
        }
    }

    /// Build from a JSON object; `_id` becomes the primary key
    pub fn from_json(value: Value) -> Self {
        let values = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let primary_key = values.get("_id").cloned().unwrap_or(Value::Null);
        Self::new(primary_key, values)
    }

    pub fn with_join(mut self, column_id: impl Into<String>, joined: Joined) -> Self {
        self.joins.insert(column_id.into(), joined);
        self
    }

    pub fn into_row(self) -> Arc<dyn Row> {
        Arc::new(self)
    }
}

#[async_trait]
impl Row for MemoryRow {
    async fn get_primary_key(&self) -> anyhow::Result<Value> {
        Ok(self.primary_key.clone())
    }

    async fn get_field(&self, column_id: &str) -> anyhow::Result<Value> {
        Ok(self.values.get(column_id).cloned().unwrap_or(Value::Null))
    }

    async fn follow_join(&self, column_id: &str) -> anyhow::Result<Joined> {
        Ok(self.joins.get(column_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_row() {
        let child = MemoryRow::from_json(json!({ "_id": "c1" })).into_row();
        let row = MemoryRow::from_json(json!({ "_id": "r1", "number": 3 }))
            .with_join("children", Joined::Many(vec![child]));

        assert_eq!(row.get_primary_key().await.unwrap(), json!("r1"));
        assert_eq!(row.get_field("number").await.unwrap(), json!(3));
        assert_eq!(row.get_field("missing").await.unwrap(), Value::Null);
        assert_eq!(row.follow_join("children").await.unwrap().into_rows().len(), 1);
        assert!(matches!(row.follow_join("parent").await.unwrap(), Joined::None));
    }
}
