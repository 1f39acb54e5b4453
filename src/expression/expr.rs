//! Expression AST definitions.

use crate::expression::LiteralType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Expression tree node.
///
/// An absent expression ("nothing chosen yet") is represented as `None`
/// wherever an `Option<Expr>` appears; every component accepts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    /// Typed constant
    #[serde(rename = "literal")]
    Literal(LiteralExpr),

    /// Column of a table
    #[serde(rename = "field")]
    Field(FieldExpr),

    /// Primary key of a table
    #[serde(rename = "id")]
    Id(IdExpr),

    /// Named operator applied to operands
    #[serde(rename = "op")]
    Op(OpExpr),

    /// Follow joins then evaluate at the destination table
    #[serde(rename = "scalar")]
    Scalar(ScalarExpr),

    /// Ordered when/then pairs with an else
    #[serde(rename = "case")]
    Case(CaseExpr),

    /// Numeric score of an enum/enumset input
    #[serde(rename = "score")]
    Score(ScoreExpr),

    /// Enumset assembled from boolean conditions
    #[serde(rename = "build enumset")]
    BuildEnumset(BuildEnumsetExpr),

    /// Reference to a declared variable
    #[serde(rename = "variable")]
    Variable(VariableExpr),

    /// Delegated to a registered extension
    #[serde(rename = "extension")]
    Extension(ExtensionExpr),

    /// Legacy binary comparison, upgraded to `op` by the cleaner
    #[serde(rename = "comparison")]
    Comparison(ComparisonExpr),

    /// Legacy and/or, upgraded to `op` by the cleaner
    #[serde(rename = "logical")]
    Logical(LogicalExpr),

    /// Legacy row count, upgraded to `id` by the cleaner
    #[serde(rename = "count")]
    Count(CountExpr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiteralExpr {
    pub value_type: LiteralType,
    /// Table of the referenced rows for `id` / `id[]` literals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_table: Option<String>,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldExpr {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdExpr {
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpExpr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub op: String,
    #[serde(default)]
    pub exprs: Vec<Option<Expr>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarExpr {
    pub table: String,
    #[serde(default)]
    pub joins: Vec<String>,
    #[serde(default)]
    pub expr: Option<Box<Expr>>,
    /// Legacy aggregation marker, moved into a wrapping op by the cleaner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggr: Option<String>,
    /// Legacy filter on the destination rows
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_: Option<Box<Expr>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseItem {
    #[serde(default)]
    pub when: Option<Expr>,
    #[serde(default)]
    pub then: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseExpr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub cases: Vec<CaseItem>,
    #[serde(rename = "else", default)]
    pub else_: Option<Box<Expr>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreExpr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub input: Option<Box<Expr>>,
    /// Enum value id to score expression
    #[serde(default)]
    pub scores: IndexMap<String, Option<Expr>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEnumsetExpr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Enum value id to boolean condition
    #[serde(default)]
    pub values: IndexMap<String, Option<Expr>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableExpr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub variable_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionExpr {
    pub extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Extension-specific payload
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonExpr {
    pub table: String,
    pub op: String,
    #[serde(default)]
    pub lhs: Option<Box<Expr>>,
    #[serde(default)]
    pub rhs: Option<Box<Expr>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalExpr {
    pub table: String,
    pub op: String,
    #[serde(default)]
    pub exprs: Vec<Option<Expr>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountExpr {
    pub table: String,
}

impl Expr {
    /// Create a literal expression
    pub fn literal(value_type: LiteralType, value: Value) -> Self {
        Expr::Literal(LiteralExpr {
            value_type,
            id_table: None,
            value,
        })
    }

    /// Create a number literal
    pub fn number(value: f64) -> Self {
        Self::literal(LiteralType::Number, Value::from(value))
    }

    /// Create a text literal
    pub fn text(value: impl Into<String>) -> Self {
        Self::literal(LiteralType::Text, Value::String(value.into()))
    }

    /// Create a boolean literal
    pub fn boolean(value: bool) -> Self {
        Self::literal(LiteralType::Boolean, Value::Bool(value))
    }

    /// Create an enum literal
    pub fn enum_value(id: impl Into<String>) -> Self {
        Self::literal(LiteralType::Enum, Value::String(id.into()))
    }

    /// Create an enumset literal
    pub fn enumset<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = ids.into_iter().map(|id| Value::String(id.into())).collect();
        Self::literal(LiteralType::Enumset, Value::Array(ids))
    }

    /// Create a date literal (`YYYY-MM-DD`)
    pub fn date(value: impl Into<String>) -> Self {
        Self::literal(LiteralType::Date, Value::String(value.into()))
    }

    /// Create an id literal pointing into `id_table`
    pub fn id_literal(id_table: impl Into<String>, value: Value) -> Self {
        Expr::Literal(LiteralExpr {
            value_type: LiteralType::Id,
            id_table: Some(id_table.into()),
            value,
        })
    }

    /// Create a field expression
    pub fn field(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Field(FieldExpr {
            table: table.into(),
            column: column.into(),
        })
    }

    /// Create an id expression
    pub fn id(table: impl Into<String>) -> Self {
        Expr::Id(IdExpr {
            table: table.into(),
        })
    }

    /// Create an op expression owned by `table`
    pub fn op(table: Option<&str>, op: impl Into<String>, exprs: Vec<Option<Expr>>) -> Self {
        Expr::Op(OpExpr {
            table: table.map(str::to_string),
            op: op.into(),
            exprs,
        })
    }

    /// Create an op expression whose operands are all present
    pub fn op_of(table: Option<&str>, op: impl Into<String>, exprs: Vec<Expr>) -> Self {
        Self::op(table, op, exprs.into_iter().map(Some).collect())
    }

    /// Create a scalar expression
    pub fn scalar(table: impl Into<String>, joins: Vec<String>, expr: Option<Expr>) -> Self {
        Expr::Scalar(ScalarExpr {
            table: table.into(),
            joins,
            expr: expr.map(Box::new),
            aggr: None,
            where_: None,
        })
    }

    /// Create a variable reference
    pub fn variable(table: Option<&str>, variable_id: impl Into<String>) -> Self {
        Expr::Variable(VariableExpr {
            table: table.map(str::to_string),
            variable_id: variable_id.into(),
        })
    }

    /// The table this expression is evaluated against, if it has one
    pub fn table(&self) -> Option<&str> {
        match self {
            Expr::Literal(_) => None,
            Expr::Field(e) => Some(&e.table),
            Expr::Id(e) => Some(&e.table),
            Expr::Op(e) => e.table.as_deref(),
            Expr::Scalar(e) => Some(&e.table),
            Expr::Case(e) => e.table.as_deref(),
            Expr::Score(e) => e.table.as_deref(),
            Expr::BuildEnumset(e) => e.table.as_deref(),
            Expr::Variable(e) => e.table.as_deref(),
            Expr::Extension(e) => e.table.as_deref(),
            Expr::Comparison(e) => Some(&e.table),
            Expr::Logical(e) => Some(&e.table),
            Expr::Count(e) => Some(&e.table),
        }
    }

    /// The wire tag of this node
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Literal(_) => "literal",
            Expr::Field(_) => "field",
            Expr::Id(_) => "id",
            Expr::Op(_) => "op",
            Expr::Scalar(_) => "scalar",
            Expr::Case(_) => "case",
            Expr::Score(_) => "score",
            Expr::BuildEnumset(_) => "build enumset",
            Expr::Variable(_) => "variable",
            Expr::Extension(_) => "extension",
            Expr::Comparison(_) => "comparison",
            Expr::Logical(_) => "logical",
            Expr::Count(_) => "count",
        }
    }

    /// Whether this is one of the legacy variants
    pub fn is_legacy(&self) -> bool {
        matches!(self, Expr::Comparison(_) | Expr::Logical(_) | Expr::Count(_))
    }

    /// Rebuild the tree, letting `f` replace any node.
    ///
    /// `f` returns `Some(replacement)` to substitute a node (the replacement is
    /// not visited further) or `None` to keep the node and recurse into it.
    pub fn rewrite<F>(&self, f: &mut F) -> Option<Expr>
    where
        F: FnMut(&Expr) -> Option<Option<Expr>>,
    {
        if let Some(replacement) = f(self) {
            return replacement;
        }

        let rebuilt = match self {
            Expr::Op(op) => Expr::Op(OpExpr {
                exprs: op.exprs.iter().map(|e| rewrite_opt(e, f)).collect(),
                ..op.clone()
            }),
            Expr::Scalar(s) => Expr::Scalar(ScalarExpr {
                expr: s.expr.as_ref().and_then(|e| e.rewrite(f)).map(Box::new),
                where_: s.where_.as_ref().and_then(|e| e.rewrite(f)).map(Box::new),
                ..s.clone()
            }),
            Expr::Case(c) => Expr::Case(CaseExpr {
                table: c.table.clone(),
                cases: c
                    .cases
                    .iter()
                    .map(|item| CaseItem {
                        when: item.when.as_ref().and_then(|e| e.rewrite(f)),
                        then: item.then.as_ref().and_then(|e| e.rewrite(f)),
                    })
                    .collect(),
                else_: c.else_.as_ref().and_then(|e| e.rewrite(f)).map(Box::new),
            }),
            Expr::Score(s) => Expr::Score(ScoreExpr {
                table: s.table.clone(),
                input: s.input.as_ref().and_then(|e| e.rewrite(f)).map(Box::new),
                scores: s
                    .scores
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_ref().and_then(|e| e.rewrite(f))))
                    .collect(),
            }),
            Expr::BuildEnumset(b) => Expr::BuildEnumset(BuildEnumsetExpr {
                table: b.table.clone(),
                values: b
                    .values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_ref().and_then(|e| e.rewrite(f))))
                    .collect(),
            }),
            Expr::Comparison(c) => Expr::Comparison(ComparisonExpr {
                lhs: c.lhs.as_ref().and_then(|e| e.rewrite(f)).map(Box::new),
                rhs: c.rhs.as_ref().and_then(|e| e.rewrite(f)).map(Box::new),
                ..c.clone()
            }),
            Expr::Logical(l) => Expr::Logical(LogicalExpr {
                exprs: l.exprs.iter().map(|e| rewrite_opt(e, f)).collect(),
                ..l.clone()
            }),
            other => other.clone(),
        };
        Some(rebuilt)
    }
}

fn rewrite_opt<F>(expr: &Option<Expr>, f: &mut F) -> Option<Expr>
where
    F: FnMut(&Expr) -> Option<Option<Expr>>,
{
    expr.as_ref().and_then(|e| e.rewrite(f))
}

impl LiteralExpr {
    /// Literal values of array types as a list of strings
    pub fn string_items(&self) -> Vec<String> {
        match &self.value {
            Value::Array(items) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}
