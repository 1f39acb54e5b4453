//! Relational query AST.
//!
//! The compiler emits this tree; an external executor turns it into SQL and
//! runs it. Alias placeholders (`{alias}`, `{from}`, `{to}`) in schema-supplied
//! fragments are replaced by [`JsonQl::inject_table_alias`] and
//! [`JsonQl::inject_table_aliases`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Query AST node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JsonQl {
    /// Bound parameter value
    Literal { value: Value },

    /// Column of an aliased source; without a column, the whole row
    Field {
        #[serde(rename = "tableAlias")]
        table_alias: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<String>,
    },

    /// Fixed keyword such as `*` or `null`
    Token { token: String },

    /// Operator or function call
    Op {
        op: String,
        #[serde(default)]
        exprs: Vec<JsonQl>,
        /// `distinct`, `any`, ...
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modifier: Option<String>,
        #[serde(rename = "orderBy", default, skip_serializing_if = "Vec::is_empty")]
        order_by: Vec<OrderBy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        over: Option<Over>,
    },

    Case {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Box<JsonQl>>,
        cases: Vec<WhenThen>,
        #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
        else_: Option<Box<JsonQl>>,
    },

    /// Correlated subquery producing a single value
    Scalar {
        expr: Box<JsonQl>,
        from: Box<JsonQl>,
        #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
        where_: Option<Box<JsonQl>>,
        #[serde(rename = "orderBy", default, skip_serializing_if = "Vec::is_empty")]
        order_by: Vec<OrderBy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
    },

    Query {
        selects: Vec<Select>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<Box<JsonQl>>,
        #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
        where_: Option<Box<JsonQl>>,
        #[serde(rename = "groupBy", default, skip_serializing_if = "Vec::is_empty")]
        group_by: Vec<JsonQl>,
        #[serde(rename = "orderBy", default, skip_serializing_if = "Vec::is_empty")]
        order_by: Vec<OrderBy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
    },

    /// Physical table source
    Table { table: String, alias: String },

    Join {
        kind: String,
        left: Box<JsonQl>,
        right: Box<JsonQl>,
        on: Box<JsonQl>,
    },

    /// Query used as a source
    Subquery { query: Box<JsonQl>, alias: String },

    /// Expression used as a source (e.g. `jsonb_array_elements`)
    Subexpr { expr: Box<JsonQl>, alias: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenThen {
    pub when: JsonQl,
    pub then: JsonQl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub expr: JsonQl,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nulls {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub expr: JsonQl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nulls: Option<Nulls>,
}

/// Window specification of an op
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Over {
    #[serde(rename = "partitionBy", default, skip_serializing_if = "Vec::is_empty")]
    pub partition_by: Vec<JsonQl>,
    #[serde(rename = "orderBy", default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
}

impl OrderBy {
    pub fn asc(expr: JsonQl) -> Self {
        Self {
            expr,
            direction: Some(Direction::Asc),
            nulls: None,
        }
    }

    pub fn desc(expr: JsonQl) -> Self {
        Self {
            expr,
            direction: Some(Direction::Desc),
            nulls: None,
        }
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls = Some(Nulls::Last);
        self
    }
}

impl JsonQl {
    pub fn literal(value: impl Into<Value>) -> Self {
        JsonQl::Literal {
            value: value.into(),
        }
    }

    pub fn null() -> Self {
        JsonQl::Literal { value: Value::Null }
    }

    pub fn token(token: impl Into<String>) -> Self {
        JsonQl::Token {
            token: token.into(),
        }
    }

    pub fn field(table_alias: impl Into<String>, column: impl Into<String>) -> Self {
        JsonQl::Field {
            table_alias: table_alias.into(),
            column: Some(column.into()),
        }
    }

    pub fn op(op: impl Into<String>, exprs: Vec<JsonQl>) -> Self {
        JsonQl::Op {
            op: op.into(),
            exprs,
            modifier: None,
            order_by: Vec::new(),
            over: None,
        }
    }

    /// Postgres-style cast, e.g. `cast(e, "decimal")` is `e::decimal`
    pub fn cast(expr: JsonQl, to: &str) -> Self {
        Self::op(format!("::{}", to), vec![expr])
    }

    pub fn table(table: impl Into<String>, alias: impl Into<String>) -> Self {
        JsonQl::Table {
            table: table.into(),
            alias: alias.into(),
        }
    }

    /// Whether this is the literal `null`
    pub fn is_null(&self) -> bool {
        matches!(self, JsonQl::Literal { value: Value::Null })
    }

    /// Add an ordering to an op node (used for ordered aggregates)
    pub fn with_order_by(mut self, orderings: Vec<OrderBy>) -> Self {
        if let JsonQl::Op { order_by, .. } = &mut self {
            *order_by = orderings;
        }
        self
    }

    /// Add a window specification to an op node
    pub fn with_over(mut self, window: Over) -> Self {
        if let JsonQl::Op { over, .. } = &mut self {
            *over = Some(window);
        }
        self
    }

    /// Replace the `{alias}` placeholder with `alias`
    pub fn inject_table_alias(&self, alias: &str) -> JsonQl {
        self.map_aliases(&|a| if a == "{alias}" { Some(alias.to_string()) } else { None })
    }

    /// Replace named placeholders, e.g. `{from}` and `{to}` in join conditions
    pub fn inject_table_aliases(&self, aliases: &HashMap<&str, &str>) -> JsonQl {
        self.map_aliases(&|a| aliases.get(a).map(|s| s.to_string()))
    }

    fn map_aliases(&self, f: &dyn Fn(&str) -> Option<String>) -> JsonQl {
        let boxed = |e: &JsonQl| Box::new(e.map_aliases(f));
        let orders = |o: &[OrderBy]| -> Vec<OrderBy> {
            o.iter()
                .map(|o| OrderBy {
                    expr: o.expr.map_aliases(f),
                    ..o.clone()
                })
                .collect()
        };

        match self {
            JsonQl::Field {
                table_alias,
                column,
            } => JsonQl::Field {
                table_alias: f(table_alias).unwrap_or_else(|| table_alias.clone()),
                column: column.clone(),
            },
            JsonQl::Table { table, alias } => JsonQl::Table {
                table: table.clone(),
                alias: f(alias).unwrap_or_else(|| alias.clone()),
            },
            JsonQl::Op {
                op,
                exprs,
                modifier,
                order_by,
                over,
            } => JsonQl::Op {
                op: op.clone(),
                exprs: exprs.iter().map(|e| e.map_aliases(f)).collect(),
                modifier: modifier.clone(),
                order_by: orders(order_by),
                over: over.as_ref().map(|w| Over {
                    partition_by: w.partition_by.iter().map(|e| e.map_aliases(f)).collect(),
                    order_by: orders(&w.order_by),
                }),
            },
            JsonQl::Case {
                input,
                cases,
                else_,
            } => JsonQl::Case {
                input: input.as_deref().map(boxed),
                cases: cases
                    .iter()
                    .map(|c| WhenThen {
                        when: c.when.map_aliases(f),
                        then: c.then.map_aliases(f),
                    })
                    .collect(),
                else_: else_.as_deref().map(boxed),
            },
            JsonQl::Scalar {
                expr,
                from,
                where_,
                order_by,
                limit,
            } => JsonQl::Scalar {
                expr: boxed(expr),
                from: boxed(from),
                where_: where_.as_deref().map(boxed),
                order_by: orders(order_by),
                limit: *limit,
            },
            JsonQl::Query {
                selects,
                from,
                where_,
                group_by,
                order_by,
                limit,
            } => JsonQl::Query {
                selects: selects
                    .iter()
                    .map(|s| Select {
                        expr: s.expr.map_aliases(f),
                        alias: s.alias.clone(),
                    })
                    .collect(),
                from: from.as_deref().map(boxed),
                where_: where_.as_deref().map(boxed),
                group_by: group_by.iter().map(|e| e.map_aliases(f)).collect(),
                order_by: orders(order_by),
                limit: *limit,
            },
            JsonQl::Join {
                kind,
                left,
                right,
                on,
            } => JsonQl::Join {
                kind: kind.clone(),
                left: boxed(left),
                right: boxed(right),
                on: boxed(on),
            },
            JsonQl::Subquery { query, alias } => JsonQl::Subquery {
                query: boxed(query),
                alias: f(alias).unwrap_or_else(|| alias.clone()),
            },
            JsonQl::Subexpr { expr, alias } => JsonQl::Subexpr {
                expr: boxed(expr),
                alias: f(alias).unwrap_or_else(|| alias.clone()),
            },
            JsonQl::Literal { .. } | JsonQl::Token { .. } => self.clone(),
        }
    }
}

/// `a and b and ...`, dropping to the single operand when there is only one
pub fn and_all(mut exprs: Vec<JsonQl>) -> Option<JsonQl> {
    match exprs.len() {
        0 => None,
        1 => exprs.pop(),
        _ => Some(JsonQl::op("and", exprs)),
    }
}
