use crate::expression::LiteralType;
use crate::schema::{EnumValue, LocalizedString};
use serde::{Deserialize, Serialize};

/// Named, typed placeholder resolved to an expression or value at
/// compile/evaluate time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: String,
    #[serde(default)]
    pub name: LocalizedString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<LocalizedString>,
    #[serde(rename = "type")]
    pub value_type: LiteralType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<EnumValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_table: Option<String>,
    /// When set, the variable stands for a non-aggregate expression over
    /// this table rather than a constant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl Variable {
    pub fn new(id: impl Into<String>, value_type: LiteralType) -> Self {
        let id = id.into();
        Self {
            name: LocalizedString::new(id.clone()),
            id,
            desc: None,
            value_type,
            enum_values: None,
            id_table: None,
            table: None,
        }
    }

    pub fn for_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}
