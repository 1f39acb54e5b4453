//! Table, column and join definitions.

use crate::expression::{Expr, LiteralType};
use crate::jsonql::JsonQl;
use crate::schema::LocalizedString;
use serde::{Deserialize, Serialize};
use std::fmt;

fn default_primary_key() -> ColumnSource {
    ColumnSource::Column("_id".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,
    #[serde(default)]
    pub name: LocalizedString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<LocalizedString>,
    /// Primary key column, or a fragment using `{alias}`
    #[serde(default = "default_primary_key")]
    pub primary_key: ColumnSource,
    /// Column giving the natural order of rows, required by ordered operators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering: Option<String>,
    /// Legacy: jsonb column holding the ids of all ancestors (self included)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestry: Option<String>,
    /// Legacy: like `ancestry`, but holding text ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestry_text: Option<String>,
    /// Table of `(ancestor, descendant)` pairs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestry_table: Option<String>,
    /// Column used to label rows in summaries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub contents: Vec<ContentItem>,
    /// Query replacing the physical table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonql: Option<JsonQl>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deprecated: bool,
}

impl Table {
    pub fn new(id: impl Into<String>, name: impl Into<LocalizedString>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            desc: None,
            primary_key: default_primary_key(),
            ordering: None,
            ancestry: None,
            ancestry_text: None,
            ancestry_table: None,
            label: None,
            contents: Vec::new(),
            jsonql: None,
            deprecated: false,
        }
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.contents.push(ContentItem::Column(column));
        self
    }

    pub fn with_ordering(mut self, column: impl Into<String>) -> Self {
        self.ordering = Some(column.into());
        self
    }

    /// Whether rows of this table form a hierarchy usable by `within`
    pub fn is_hierarchical(&self) -> bool {
        self.ancestry.is_some() || self.ancestry_text.is_some() || self.ancestry_table.is_some()
    }

    /// Columns flattened out of nested sections, in document order
    pub fn columns(&self) -> Vec<&Column> {
        let mut out = Vec::new();
        collect_columns(&self.contents, &mut out);
        out
    }
}

fn collect_columns<'a>(items: &'a [ContentItem], out: &mut Vec<&'a Column>) {
    for item in items {
        match item {
            ContentItem::Section(section) => collect_columns(&section.contents, out),
            ContentItem::Column(column) => out.push(column),
        }
    }
}

/// Either a plain column id or a query fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSource {
    Column(String),
    JsonQl(JsonQl),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentItem {
    Section(Section),
    Column(Column),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionTag {
    Section,
}

/// Named group of columns; purely presentational
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(rename = "type")]
    pub tag: SectionTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: LocalizedString,
    #[serde(default)]
    pub contents: Vec<ContentItem>,
}

/// What a column holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    Literal(LiteralType),
    /// Link to rows of another table
    Join,
    /// Computed from an expression over the same table
    Expr,
}

impl TryFrom<String> for ColumnType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "join" => Ok(ColumnType::Join),
            "expr" => Ok(ColumnType::Expr),
            other => other.parse().map(ColumnType::Literal),
        }
    }
}

impl From<ColumnType> for String {
    fn from(t: ColumnType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Literal(t) => write!(f, "{}", t),
            ColumnType::Join => f.write_str("join"),
            ColumnType::Expr => f.write_str("expr"),
        }
    }
}

/// One allowed value of an enum column or variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValue {
    pub id: String,
    pub name: LocalizedString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl EnumValue {
    pub fn new(id: impl Into<String>, name: impl Into<LocalizedString>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            code: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: String,
    #[serde(default)]
    pub name: LocalizedString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<LocalizedString>,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<EnumValue>>,
    /// Referenced table of `id` / `id[]` columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<Join>,
    /// Expression of computed columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<Expr>,
    /// Fragment using `{alias}` that replaces the physical column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonql: Option<JsonQl>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deprecated: bool,
}

impl Column {
    /// Column holding plain values of `value_type`
    pub fn new(id: impl Into<String>, value_type: LiteralType) -> Self {
        Self::with_type(id, ColumnType::Literal(value_type))
    }

    fn with_type(id: impl Into<String>, column_type: ColumnType) -> Self {
        let id = id.into();
        Self {
            name: LocalizedString::new(id.clone()),
            id,
            desc: None,
            column_type,
            enum_values: None,
            id_table: None,
            join: None,
            expr: None,
            jsonql: None,
            required: false,
            deprecated: false,
        }
    }

    pub fn enum_column(id: impl Into<String>, values: Vec<EnumValue>) -> Self {
        let mut column = Self::new(id, LiteralType::Enum);
        column.enum_values = Some(values);
        column
    }

    pub fn join_column(id: impl Into<String>, join: Join) -> Self {
        let mut column = Self::with_type(id, ColumnType::Join);
        column.join = Some(join);
        column
    }

    pub fn expr_column(id: impl Into<String>, expr: Expr) -> Self {
        let mut column = Self::with_type(id, ColumnType::Expr);
        column.expr = Some(expr);
        column
    }

    /// `id` / `id[]` column referencing `id_table`
    pub fn id_column(id: impl Into<String>, value_type: LiteralType, id_table: impl Into<String>) -> Self {
        let mut column = Self::new(id, value_type);
        column.id_table = Some(id_table.into());
        column
    }

    pub fn literal_type(&self) -> Option<LiteralType> {
        match self.column_type {
            ColumnType::Literal(t) => Some(t),
            _ => None,
        }
    }
}

/// Cardinality of a join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinKind {
    #[serde(rename = "1-1")]
    OneToOne,
    #[serde(rename = "1-n")]
    OneToMany,
    #[serde(rename = "n-1")]
    ManyToOne,
    #[serde(rename = "n-n")]
    ManyToMany,
}

impl JoinKind {
    /// Whether following the join can yield several rows
    pub fn is_multiple(&self) -> bool {
        matches!(self, JoinKind::OneToMany | JoinKind::ManyToMany)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    #[serde(rename = "type")]
    pub kind: JoinKind,
    pub to_table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_column: Option<ColumnSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_column: Option<ColumnSource>,
    /// Join condition using `{from}` and `{to}` placeholders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonql: Option<JsonQl>,
}

impl Join {
    pub fn new(
        kind: JoinKind,
        to_table: impl Into<String>,
        from_column: impl Into<String>,
        to_column: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            to_table: to_table.into(),
            from_column: Some(ColumnSource::Column(from_column.into())),
            to_column: Some(ColumnSource::Column(to_column.into())),
            jsonql: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_wire_format() {
        let column: Column = serde_json::from_value(json!({
            "id": "status",
            "name": { "_base": "en", "en": "Status" },
            "type": "enum",
            "enumValues": [{ "id": "ok", "name": { "en": "OK" } }]
        }))
        .unwrap();
        assert_eq!(column.column_type, ColumnType::Literal(LiteralType::Enum));
        assert_eq!(column.enum_values.as_ref().unwrap()[0].id, "ok");

        let join: Column = serde_json::from_value(json!({
            "id": "children",
            "type": "join",
            "join": { "type": "1-n", "toTable": "t2", "fromColumn": "id", "toColumn": "t1" }
        }))
        .unwrap();
        let j = join.join.unwrap();
        assert!(j.kind.is_multiple());
        assert_eq!(j.from_column, Some(ColumnSource::Column("id".into())));
    }

    #[test]
    fn test_sections_flatten_in_order() {
        let table: Table = serde_json::from_value(json!({
            "id": "t1",
            "contents": [
                { "id": "a", "type": "text" },
                { "type": "section", "name": { "en": "S" }, "contents": [
                    { "id": "b", "type": "number" },
                    { "type": "section", "contents": [{ "id": "c", "type": "date" }] }
                ] },
                { "id": "d", "type": "boolean" }
            ]
        }))
        .unwrap();
        let ids: Vec<_> = table.columns().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(table.primary_key, ColumnSource::Column("_id".into()));
    }

    #[test]
    fn test_unknown_column_type_rejected() {
        let result: Result<Column, _> = serde_json::from_value(json!({ "id": "x", "type": "blob" }));
        assert!(result.is_err());
    }
}
