//! Short human-readable labels for expressions and literal values.

use crate::expression::operator::op_items;
use crate::expression::{upgrade_legacy, Expr, LiteralType};
use crate::extension::get_extension;
use crate::inference::ExprUtils;
use crate::schema::EnumValue;
use chrono::{DateTime, NaiveDate};
use serde_json::Value;

impl ExprUtils<'_> {
    /// Label such as `"Total Amount"` or `"Client > Name"`
    pub fn summarize_expr(&self, expr: Option<&Expr>, locale: Option<&str>) -> String {
        let Some(expr) = expr else {
            return "None".to_string();
        };

        match expr {
            Expr::Field(field) => self
                .schema()
                .get_column(&field.table, &field.column)
                .map(|c| c.name.localize(locale).to_string())
                .unwrap_or_else(|| field.column.clone()),
            Expr::Id(id) => self
                .schema()
                .get_table(&id.table)
                .map(|t| t.name.localize(locale).to_string())
                .unwrap_or_else(|| id.table.clone()),
            Expr::Scalar(scalar) => {
                let mut parts = Vec::new();
                let mut table = scalar.table.clone();
                for join in &scalar.joins {
                    match self.schema().get_column(&table, join) {
                        Some(column) => parts.push(column.name.localize(locale).to_string()),
                        None => parts.push(join.clone()),
                    }
                    match self.follow_joins(&table, std::slice::from_ref(join)) {
                        Some(next) => table = next,
                        None => break,
                    }
                }
                // A lone id at the end of the chain adds nothing to the path
                if !matches!(scalar.expr.as_deref(), Some(Expr::Id(_))) || parts.is_empty() {
                    parts.push(self.summarize_expr(scalar.expr.as_deref(), locale));
                }
                parts.join(" > ")
            }
            Expr::Op(op) => {
                let Some(item) = op_items().iter().find(|i| i.op == op.op) else {
                    return op.op.clone();
                };
                if op.op == "count" {
                    let table = op
                        .table
                        .as_deref()
                        .and_then(|t| self.schema().get_table(t))
                        .map(|t| t.name.localize(locale).to_string())
                        .unwrap_or_default();
                    return format!("Number of {}", table).trim_end().to_string();
                }

                let operands: Vec<String> = op
                    .exprs
                    .iter()
                    .map(|e| self.summarize_expr(e.as_ref(), locale))
                    .collect();
                if item.aggr || item.prefix {
                    let label = item.prefix_label.unwrap_or(item.name);
                    let joiner = item.joiner.map(|j| format!(" {} ", j)).unwrap_or_else(|| ", ".to_string());
                    format!("{} {}", label, operands.join(&joiner))
                } else if operands.len() == 1 {
                    format!("{} {}", operands[0], item.name)
                } else {
                    operands.join(&format!(" {} ", item.name))
                }
            }
            Expr::Literal(lit) => self.stringify_literal_value(lit.value_type, &lit.value, None, locale),
            Expr::Case(_) => "Conditional".to_string(),
            Expr::Score(_) => "Score".to_string(),
            Expr::BuildEnumset(_) => "Build Enumset".to_string(),
            Expr::Variable(var) => self
                .get_variable(&var.variable_id)
                .map(|v| v.name.localize(locale).to_string())
                .unwrap_or_else(|| var.variable_id.clone()),
            Expr::Extension(ext) => match get_extension(&ext.extension) {
                Ok(handler) => handler.summarize(ext, self, locale),
                Err(_) => ext.extension.clone(),
            },
            Expr::Comparison(_) | Expr::Logical(_) | Expr::Count(_) => {
                self.summarize_expr(upgrade_legacy(expr).as_ref(), locale)
            }
        }
    }

    /// Display form of a literal value of type `value_type`
    pub fn stringify_literal_value(
        &self,
        value_type: LiteralType,
        value: &Value,
        enum_values: Option<&[EnumValue]>,
        locale: Option<&str>,
    ) -> String {
        if value.is_null() {
            return "None".to_string();
        }

        let enum_name = |id: &Value| -> String {
            let id = value_as_string(id);
            enum_values
                .and_then(|values| values.iter().find(|v| v.id == id))
                .map(|v| v.name.localize(locale).to_string())
                .unwrap_or_else(|| if enum_values.is_some() { "???".to_string() } else { id })
        };

        match (value_type, value) {
            (LiteralType::Boolean, Value::Bool(b)) => String::from(if *b { "True" } else { "False" }),
            (LiteralType::Enum, v) => enum_name(v),
            (LiteralType::Enumset, Value::Array(items)) => {
                items.iter().map(enum_name).collect::<Vec<_>>().join(", ")
            }
            (LiteralType::TextArray, Value::Array(items)) | (LiteralType::IdArray, Value::Array(items)) => {
                items.iter().map(value_as_string).collect::<Vec<_>>().join(", ")
            }
            (LiteralType::Date, Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| d.format("%b %-d, %Y").to_string())
                .unwrap_or_else(|_| s.clone()),
            (LiteralType::Datetime, Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|d| d.format("%b %-d, %Y %H:%M").to_string())
                .unwrap_or_else(|_| s.clone()),
            (_, v) => value_as_string(v),
        }
    }
}

/// Strings unquoted, everything else as JSON
pub(crate) fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
