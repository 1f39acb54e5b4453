use super::dates::relative_window;
use super::{to_jsonb, CompileError, CompileResult, ExprCompiler, Frame};
use crate::expression::operator::{self, RELATIVE_DATE_OPS};
use crate::expression::{Expr, LiteralType, OpExpr};
use crate::jsonql::{and_all, JsonQl, OrderBy, Over, Select, WhenThen};
use crate::schema::Table;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Alias of the ranked rows inside an `is latest` query
const LATEST_INNER_ALIAS: &str = "innerrn";
const LATEST_OUTER_ALIAS: &str = "innerrnq";
const WITHIN_ALIAS: &str = "subwithin";

impl ExprCompiler<'_> {
    pub(super) fn compile_op(&self, op: &OpExpr, alias: &str, frame: Frame) -> CompileResult<Option<JsonQl>> {
        let name = op.op.as_str();
        if !operator::is_known_op(name) {
            log::error!("cannot compile unknown op {}", name);
            return Err(CompileError::UnknownOp(op.op.clone()));
        }

        if RELATIVE_DATE_OPS.iter().any(|(relative, _)| *relative == name) {
            return self.compile_relative_date(op, alias, frame);
        }
        match name {
            "is latest" => return self.compile_is_latest(op, alias, frame),
            "last" | "last where" | "first" | "first where" | "previous" => {
                return self.compile_ordered_aggr(op, alias, frame)
            }
            _ => {}
        }

        let exprs = op
            .exprs
            .iter()
            .map(|e| self.compile_opt(e.as_ref(), alias, frame))
            .collect::<CompileResult<Vec<_>>>()?;
        let arg = |i: usize| exprs.get(i).cloned().flatten();
        let present = || exprs.iter().flatten().cloned().collect::<Vec<_>>();
        let lhs_type = || self.utils.get_expr_type(op.exprs.first().and_then(Option::as_ref));

        let compiled = match name {
            "and" | "or" => {
                let mut terms = present();
                match terms.len() {
                    0 => None,
                    1 => terms.pop(),
                    _ => Some(JsonQl::op(name, terms)),
                }
            }
            "+" | "*" => {
                // Missing operands are skipped, so they act as 0 (or 1)
                let identity = if name == "+" { 0 } else { 1 };
                let terms: Vec<JsonQl> = present()
                    .into_iter()
                    .map(|e| JsonQl::op("coalesce", vec![decimal(e), JsonQl::literal(identity)]))
                    .collect();
                (!terms.is_empty()).then(|| JsonQl::op(name, terms))
            }
            "-" => both(arg(0), arg(1)).map(|(a, b)| JsonQl::op("-", vec![decimal(a), decimal(b)])),
            "/" => both(arg(0), arg(1)).map(|(a, b)| {
                let denominator = JsonQl::op("nullif", vec![b, JsonQl::literal(0)]);
                JsonQl::op("/", vec![decimal(a), decimal(denominator)])
            }),
            "=" | "<>" | ">" | "<" | ">=" | "<=" | "~*" => {
                both(arg(0), arg(1)).map(|(a, b)| JsonQl::op(name, vec![a, b]))
            }
            "= false" => arg(0).map(|a| JsonQl::op("=", vec![a, JsonQl::literal(false)])),
            "between" => match (arg(0), arg(1), arg(2)) {
                (Some(a), Some(lo), Some(hi)) => Some(JsonQl::op("between", vec![a, lo, hi])),
                (Some(a), Some(lo), None) => Some(JsonQl::op(">=", vec![a, lo])),
                (Some(a), None, Some(hi)) => Some(JsonQl::op("<=", vec![a, hi])),
                _ => None,
            },
            "is null" | "is not null" => arg(0).map(|a| JsonQl::op(name, vec![a])),
            "not" => arg(0).map(|a| JsonQl::op("not", vec![JsonQl::op("coalesce", vec![a, JsonQl::literal(false)])])),
            "round" | "floor" | "ceiling" => arg(0).map(|a| JsonQl::op(name, vec![decimal(a)])),
            "least" | "greatest" => {
                let terms = present();
                (!terms.is_empty()).then(|| JsonQl::op(name, terms))
            }

            "days difference" | "months difference" | "years difference" => both(arg(0), arg(1))
                .map(|(a, b)| date_difference(a, b, lhs_type() == Some(LiteralType::Datetime), days_per_unit(name))),
            "days since" => arg(0).map(|a| {
                let datetime = lhs_type() == Some(LiteralType::Datetime);
                date_difference(now_literal(frame.now, datetime), a, datetime, 1.0)
            }),
            "month" => arg(0).map(|a| to_char(a, "MM")),
            "yearmonth" => arg(0).map(|a| to_char(a, "YYYY-MM-01")),
            "year" => arg(0).map(|a| to_char(a, "YYYY-01-01")),
            "weekofmonth" => arg(0).map(|a| to_char(a, "W")),
            "dayofmonth" => arg(0).map(|a| to_char(a, "DD")),
            "to date" => arg(0).map(|a| JsonQl::op("substr", vec![a, JsonQl::literal(1), JsonQl::literal(10)])),
            "current date" => Some(JsonQl::literal(frame.now.format("%Y-%m-%d").to_string())),
            "current datetime" => Some(JsonQl::literal(frame.now.to_rfc3339())),

            "latitude" => arg(0).map(|a| JsonQl::op("ST_Y", vec![JsonQl::op("ST_Centroid", vec![to_wgs84(a)])])),
            "longitude" => arg(0).map(|a| JsonQl::op("ST_X", vec![JsonQl::op("ST_Centroid", vec![to_wgs84(a)])])),
            "distance" => both(arg(0), arg(1))
                .map(|(a, b)| JsonQl::op("ST_DistanceSphere", vec![to_wgs84(a), to_wgs84(b)])),
            "line length" => arg(0).map(|a| JsonQl::op("ST_Length", vec![JsonQl::cast(to_wgs84(a), "geography")])),

            "length" => arg(0).map(|a| {
                JsonQl::op(
                    "coalesce",
                    vec![JsonQl::op("jsonb_array_length", vec![to_jsonb(a)]), JsonQl::literal(0)],
                )
            }),
            "to text" => arg(0).map(|a| self.compile_to_text(op, a)),
            "= any" => match both(arg(0), arg(1)) {
                Some((_, b)) if is_empty_array(&b) => Some(JsonQl::literal(false)),
                Some((a, b)) => Some(any_of(a, b)),
                None => None,
            },
            "contains" => match both(arg(0), arg(1)) {
                Some((_, b)) if is_empty_array(&b) => None,
                Some((a, b)) => Some(JsonQl::op("@>", vec![to_jsonb(a), to_jsonb(b)])),
                None => None,
            },
            "intersects" => match both(arg(0), arg(1)) {
                Some((_, b)) if is_empty_array(&b) => Some(JsonQl::literal(false)),
                Some((a, b)) => Some(JsonQl::op("?|", vec![to_jsonb(a), text_array(b)])),
                None => None,
            },
            "includes" => both(arg(0), arg(1))
                .map(|(a, b)| JsonQl::op("@>", vec![to_jsonb(a), JsonQl::op("jsonb_build_array", vec![b])])),
            "within" | "within any" => match both(arg(0), arg(1)) {
                Some((a, b)) => Some(self.compile_within(op, a, b)?),
                None => None,
            },

            "count" => Some(JsonQl::op("count", vec![JsonQl::token("*")])),
            "sum" | "avg" => arg(0).map(|a| JsonQl::op(name, vec![decimal(a)])),
            "min" | "max" => arg(0).map(|a| JsonQl::op(name, vec![a])),
            "count distinct" => arg(0).map(|a| with_modifier(JsonQl::op("count", vec![a]), "distinct")),
            "array_agg" => arg(0).map(|a| JsonQl::op("to_jsonb", vec![JsonQl::op("array_agg", vec![a])])),
            // Filtered counts and sums are 0 over an empty set, not null
            "count where" => Some(match arg(0) {
                Some(cond) => zero_if_null(JsonQl::op(
                    "sum",
                    vec![case_when(cond, JsonQl::literal(1), Some(JsonQl::literal(0)))],
                )),
                None => JsonQl::op("count", vec![JsonQl::token("*")]),
            }),
            "sum where" => arg(0).map(|a| {
                let summed = match arg(1) {
                    Some(cond) => case_when(cond, decimal(a), Some(JsonQl::literal(0))),
                    None => decimal(a),
                };
                zero_if_null(JsonQl::op("sum", vec![summed]))
            }),
            "percent where" => arg(0).map(|cond| {
                let (cond, base) = match arg(1) {
                    Some(base) => (JsonQl::op("and", vec![cond, base.clone()]), Some(base)),
                    None => (cond, None),
                };
                let numerator = JsonQl::op("sum", vec![case_when(cond, JsonQl::literal(100), Some(JsonQl::literal(0)))]);
                let denominator = match base {
                    Some(base) => JsonQl::op("sum", vec![case_when(base, JsonQl::literal(1), Some(JsonQl::literal(0)))]),
                    None => JsonQl::op("count", vec![JsonQl::token("*")]),
                };
                JsonQl::op(
                    "/",
                    vec![decimal(numerator), JsonQl::op("nullif", vec![denominator, JsonQl::literal(0)])],
                )
            }),
            _ => return Err(CompileError::UnknownOp(op.op.clone())),
        };
        Ok(compiled)
    }

    fn ordered_table(&self, op: &OpExpr) -> CompileResult<(&Table, String)> {
        let table_id = op
            .table
            .clone()
            .or_else(|| op.exprs.first().and_then(Option::as_ref).and_then(Expr::table).map(str::to_string))
            .unwrap_or_default();
        let table = self.get_table(&table_id)?;
        match &table.ordering {
            Some(ordering) => Ok((table, ordering.clone())),
            None => {
                log::error!("{} needs an ordering on table {}", op.op, table_id);
                Err(CompileError::NoOrdering(table_id))
            }
        }
    }

    fn compile_ordering(&self, table: &Table, ordering: &str, alias: &str, frame: Frame) -> CompileResult<JsonQl> {
        self.compile_expr(&Expr::field(table.id.clone(), ordering), alias, frame)?
            .ok_or_else(|| CompileError::NoOrdering(table.id.clone()))
    }

    /// `last`, `first`, `previous` and their `where` forms: collect values
    /// ordered by the table's ordering and index into the array. Rows failing
    /// the condition contribute nulls sorted after the matching rows; null
    /// values sort after non-null ones.
    fn compile_ordered_aggr(&self, op: &OpExpr, alias: &str, frame: Frame) -> CompileResult<Option<JsonQl>> {
        let (table, ordering) = self.ordered_table(op)?;
        let ordering = self.compile_ordering(table, &ordering, alias, frame)?;

        let Some(value) = self.compile_opt(op.exprs.first().and_then(Option::as_ref), alias, frame)? else {
            return Ok(None);
        };
        let condition = if op.op.ends_with(" where") {
            self.compile_opt(op.exprs.get(1).and_then(Option::as_ref), alias, frame)?
        } else {
            None
        };

        let mut order_by = Vec::new();
        let collected = match condition {
            Some(cond) => {
                order_by.push(OrderBy::asc(case_when(
                    cond.clone(),
                    JsonQl::literal(0),
                    Some(JsonQl::literal(1)),
                )));
                case_when(cond, value.clone(), None)
            }
            None => value.clone(),
        };
        order_by.push(OrderBy::asc(case_when(
            JsonQl::op("is null", vec![value]),
            JsonQl::literal(1),
            Some(JsonQl::literal(0)),
        )));
        order_by.push(match op.op.as_str() {
            "first" | "first where" => OrderBy::asc(ordering).nulls_last(),
            _ => OrderBy::desc(ordering).nulls_last(),
        });

        let position = if op.op == "previous" { 2 } else { 1 };
        Ok(Some(JsonQl::op(
            "[]",
            vec![
                JsonQl::op("array_agg", vec![collected]).with_order_by(order_by),
                JsonQl::literal(position),
            ],
        )))
    }

    /// Whether the row is the latest (by ordering) among rows sharing the
    /// left operand's value, optionally restricted by a condition
    fn compile_is_latest(&self, op: &OpExpr, alias: &str, frame: Frame) -> CompileResult<Option<JsonQl>> {
        let (table, ordering) = self.ordered_table(op)?;
        let Some(partition) =
            self.compile_opt(op.exprs.first().and_then(Option::as_ref), LATEST_INNER_ALIAS, frame)?
        else {
            return Ok(None);
        };
        let filter = self.compile_opt(op.exprs.get(1).and_then(Option::as_ref), LATEST_INNER_ALIAS, frame)?;
        let ordering = self.compile_ordering(table, &ordering, LATEST_INNER_ALIAS, frame)?;

        let ranked = JsonQl::Query {
            selects: vec![
                Select {
                    expr: self.compile_primary_key(&table.id, LATEST_INNER_ALIAS)?,
                    alias: "id".to_string(),
                },
                Select {
                    expr: JsonQl::op("row_number", Vec::new()).with_over(Over {
                        partition_by: vec![partition],
                        order_by: vec![OrderBy::desc(ordering)],
                    }),
                    alias: "rn".to_string(),
                },
            ],
            from: Some(Box::new(self.compile_table(&table.id, LATEST_INNER_ALIAS)?)),
            where_: filter.map(Box::new),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        };
        let latest = JsonQl::Query {
            selects: vec![Select {
                expr: JsonQl::field(LATEST_OUTER_ALIAS, "id"),
                alias: "value".to_string(),
            }],
            from: Some(Box::new(JsonQl::Subquery {
                query: Box::new(ranked),
                alias: LATEST_OUTER_ALIAS.to_string(),
            })),
            where_: Some(Box::new(JsonQl::op(
                "=",
                vec![JsonQl::field(LATEST_OUTER_ALIAS, "rn"), JsonQl::literal(1)],
            ))),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        };

        Ok(Some(JsonQl::op(
            "in",
            vec![self.compile_primary_key(&table.id, alias)?, latest],
        )))
    }

    /// `within` / `within any` over the hierarchy of the left operand's table
    fn compile_within(&self, op: &OpExpr, lhs: JsonQl, rhs: JsonQl) -> CompileResult<JsonQl> {
        let lhs_expr = op.exprs.first().and_then(Option::as_ref);
        let id_table = self
            .utils
            .get_expr_id_table(lhs_expr)
            .ok_or_else(|| CompileError::TableNotFound(op.table.clone().unwrap_or_default()))?;
        let table = self.get_table(&id_table)?;
        let any = op.op == "within any";

        if let Some(ancestry_table) = &table.ancestry_table {
            let ancestor = JsonQl::field(WITHIN_ALIAS, "ancestor");
            let ancestor_match = if any {
                any_of(ancestor, rhs)
            } else {
                JsonQl::op("=", vec![ancestor, rhs])
            };
            let condition = JsonQl::op(
                "and",
                vec![
                    ancestor_match,
                    JsonQl::op("=", vec![JsonQl::field(WITHIN_ALIAS, "descendant"), lhs]),
                ],
            );
            return Ok(JsonQl::op(
                "exists",
                vec![JsonQl::Query {
                    selects: vec![Select {
                        expr: JsonQl::null(),
                        alias: "value".to_string(),
                    }],
                    from: Some(Box::new(JsonQl::table(ancestry_table.clone(), WITHIN_ALIAS))),
                    where_: Some(Box::new(condition)),
                    group_by: Vec::new(),
                    order_by: Vec::new(),
                    limit: None,
                }],
            ));
        }

        // Legacy layout: each row stores the ids of its ancestors
        let column = table
            .ancestry
            .clone()
            .or_else(|| table.ancestry_text.clone())
            .ok_or_else(|| CompileError::ColumnNotFound {
                table: id_table.clone(),
                column: "ancestry".to_string(),
            })?;
        let ancestors = to_jsonb(JsonQl::field(WITHIN_ALIAS, column));
        let matches = if any {
            JsonQl::op("?|", vec![ancestors, text_array(rhs)])
        } else {
            JsonQl::op(
                "@>",
                vec![ancestors, JsonQl::op("jsonb_build_array", vec![JsonQl::cast(rhs, "text")])],
            )
        };
        Ok(JsonQl::op(
            "in",
            vec![
                lhs,
                JsonQl::Query {
                    selects: vec![Select {
                        expr: self.compile_primary_key(&id_table, WITHIN_ALIAS)?,
                        alias: "value".to_string(),
                    }],
                    from: Some(Box::new(self.compile_table(&id_table, WITHIN_ALIAS)?)),
                    where_: Some(Box::new(matches)),
                    group_by: Vec::new(),
                    order_by: Vec::new(),
                    limit: None,
                },
            ],
        ))
    }

    fn compile_to_text(&self, op: &OpExpr, value: JsonQl) -> JsonQl {
        let lhs = op.exprs.first().and_then(Option::as_ref);
        match self.utils.get_expr_type(lhs) {
            Some(LiteralType::Enum) => {
                let locale = self.options.locale.as_deref();
                let cases = self
                    .utils
                    .get_expr_enum_values(lhs)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|v| WhenThen {
                        when: JsonQl::literal(v.id),
                        then: JsonQl::literal(v.name.localize(locale)),
                    })
                    .collect();
                JsonQl::Case {
                    input: Some(Box::new(value)),
                    cases,
                    else_: None,
                }
            }
            Some(LiteralType::TextArray) => JsonQl::Scalar {
                expr: Box::new(JsonQl::op(
                    "string_agg",
                    vec![JsonQl::field("elems", "value"), JsonQl::literal(", ")],
                )),
                from: Box::new(array_elements(value)),
                where_: None,
                order_by: Vec::new(),
                limit: None,
            },
            _ => JsonQl::cast(value, "text"),
        }
    }

    fn compile_relative_date(&self, op: &OpExpr, alias: &str, frame: Frame) -> CompileResult<Option<JsonQl>> {
        let lhs = op.exprs.first().and_then(Option::as_ref);
        let Some(value) = self.compile_opt(lhs, alias, frame)? else {
            return Ok(None);
        };
        let datetime = self.utils.get_expr_type(lhs) == Some(LiteralType::Datetime);
        let window = relative_window(&op.op, frame.now, datetime).ok_or_else(|| CompileError::UnknownOp(op.op.clone()))?;

        let bound = |at: NaiveDateTime| {
            if datetime {
                let at = DateTime::<Utc>::from_naive_utc_and_offset(at, Utc);
                JsonQl::cast(JsonQl::literal(at.to_rfc3339()), "timestamptz")
            } else {
                JsonQl::literal(at.format("%Y-%m-%d").to_string())
            }
        };

        let mut conditions = Vec::new();
        if let Some(start) = window.start {
            conditions.push(JsonQl::op(">=", vec![value.clone(), bound(start)]));
        }
        if let Some(end) = window.end {
            conditions.push(JsonQl::op("<", vec![value, bound(end)]));
        }
        Ok(and_all(conditions))
    }
}

fn both(a: Option<JsonQl>, b: Option<JsonQl>) -> Option<(JsonQl, JsonQl)> {
    Some((a?, b?))
}

fn decimal(expr: JsonQl) -> JsonQl {
    JsonQl::cast(expr, "decimal")
}

fn with_modifier(expr: JsonQl, modifier: &str) -> JsonQl {
    match expr {
        JsonQl::Op {
            op,
            exprs,
            order_by,
            over,
            ..
        } => JsonQl::Op {
            op,
            exprs,
            modifier: Some(modifier.to_string()),
            order_by,
            over,
        },
        other => other,
    }
}

fn case_when(when: JsonQl, then: JsonQl, else_: Option<JsonQl>) -> JsonQl {
    JsonQl::Case {
        input: None,
        cases: vec![WhenThen { when, then }],
        else_: else_.map(Box::new),
    }
}

fn is_empty_array(expr: &JsonQl) -> bool {
    matches!(expr, JsonQl::Literal { value: Value::Array(items) } if items.is_empty())
}

/// `value = any(list)` for literal lists, JSONB containment otherwise
fn any_of(value: JsonQl, list: JsonQl) -> JsonQl {
    match list {
        literal @ JsonQl::Literal {
            value: Value::Array(_),
        } => with_modifier(JsonQl::op("=", vec![value, literal]), "any"),
        other => JsonQl::op("@>", vec![to_jsonb(other), JsonQl::op("to_jsonb", vec![value])]),
    }
}

/// Rows of `jsonb_array_elements_text(expr)` aliased `elems`
fn array_elements(expr: JsonQl) -> JsonQl {
    JsonQl::Subexpr {
        expr: Box::new(JsonQl::op("jsonb_array_elements_text", vec![to_jsonb(expr)])),
        alias: "elems".to_string(),
    }
}

/// Postgres text array of a JSON array value
fn text_array(expr: JsonQl) -> JsonQl {
    match expr {
        literal @ JsonQl::Literal {
            value: Value::Array(_),
        } => literal,
        other => JsonQl::op(
            "array",
            vec![JsonQl::Query {
                selects: vec![Select {
                    expr: JsonQl::field("elems", "value"),
                    alias: "value".to_string(),
                }],
                from: Some(Box::new(array_elements(other))),
                where_: None,
                group_by: Vec::new(),
                order_by: Vec::new(),
                limit: None,
            }],
        ),
    }
}

fn to_char(expr: JsonQl, format: &str) -> JsonQl {
    JsonQl::op("to_char", vec![JsonQl::cast(expr, "timestamp"), JsonQl::literal(format)])
}

fn to_wgs84(expr: JsonQl) -> JsonQl {
    JsonQl::op("ST_Transform", vec![expr, JsonQl::literal(4326)])
}

fn zero_if_null(expr: JsonQl) -> JsonQl {
    JsonQl::op("coalesce", vec![expr, JsonQl::literal(0)])
}

fn now_literal(now: DateTime<Utc>, datetime: bool) -> JsonQl {
    if datetime {
        JsonQl::literal(now.to_rfc3339())
    } else {
        JsonQl::literal(now.format("%Y-%m-%d").to_string())
    }
}

fn days_per_unit(op: &str) -> f64 {
    match op {
        "months difference" => 30.5,
        "years difference" => 365.0,
        _ => 1.0,
    }
}

/// `(a - b)` in days, divided by `unit` days
fn date_difference(a: JsonQl, b: JsonQl, datetime: bool, unit: f64) -> JsonQl {
    let days = if datetime {
        let epoch = |e: JsonQl| JsonQl::op("date_part", vec![JsonQl::literal("epoch"), JsonQl::cast(e, "timestamp")]);
        JsonQl::op("/", vec![JsonQl::op("-", vec![epoch(a), epoch(b)]), JsonQl::literal(86400)])
    } else {
        JsonQl::op("-", vec![JsonQl::cast(a, "date"), JsonQl::cast(b, "date")])
    };
    if unit == 1.0 {
        days
    } else {
        JsonQl::op("/", vec![decimal(days), JsonQl::literal(unit)])
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::{CompileError, CompilerOptions, ExprCompiler};
    use crate::expression::{Expr, LiteralType};
    use crate::jsonql::{JsonQl, OrderBy};
    use crate::schema::{Column, EnumValue, Schema, Table};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new().add_tables(vec![
            Table::new("t1", "T1")
                .with_ordering("ordering")
                .with_column(Column::new("ordering", LiteralType::Number))
                .with_column(Column::new("number", LiteralType::Number))
                .with_column(Column::new("date", LiteralType::Date))
                .with_column(Column::new("boolean", LiteralType::Boolean))
                .with_column(Column::enum_column(
                    "enum",
                    vec![EnumValue::new("a", "Apple"), EnumValue::new("b", "Banana")],
                ))
                .with_column(Column::new("enumset", LiteralType::Enumset)),
            Table::new("t2", "T2").with_column(Column::new("number", LiteralType::Number)),
        ])
    }

    fn compile(schema: &Schema, expr: &Expr) -> Option<JsonQl> {
        ExprCompiler::new(schema).compile(Some(expr), "T1").unwrap()
    }

    fn decimal(expr: JsonQl) -> JsonQl {
        JsonQl::cast(expr, "decimal")
    }

    #[test]
    fn test_arithmetic() {
        let schema = schema();
        let plus = Expr::op(Some("t1"), "+", vec![Some(Expr::number(3.0)), None]);
        assert_eq!(
            compile(&schema, &plus),
            Some(JsonQl::op(
                "+",
                vec![JsonQl::op("coalesce", vec![decimal(JsonQl::literal(3.0)), JsonQl::literal(0)])]
            ))
        );

        let minus = Expr::op(Some("t1"), "-", vec![Some(Expr::number(3.0)), None]);
        assert_eq!(compile(&schema, &minus), None);

        let divide = Expr::op_of(Some("t1"), "/", vec![Expr::field("t1", "number"), Expr::number(2.0)]);
        assert_eq!(
            compile(&schema, &divide),
            Some(JsonQl::op(
                "/",
                vec![
                    decimal(JsonQl::field("T1", "number")),
                    decimal(JsonQl::op("nullif", vec![JsonQl::literal(2.0), JsonQl::literal(0)]))
                ]
            ))
        );
    }

    #[test]
    fn test_set_ops_with_empty_literals() {
        let schema = schema();
        let any = Expr::op_of(
            Some("t1"),
            "= any",
            vec![Expr::field("t1", "enum"), Expr::enumset(Vec::<String>::new())],
        );
        assert_eq!(compile(&schema, &any), Some(JsonQl::literal(false)));

        let contains = Expr::op_of(
            Some("t1"),
            "contains",
            vec![Expr::field("t1", "enumset"), Expr::enumset(Vec::<String>::new())],
        );
        assert_eq!(compile(&schema, &contains), None);

        let contains = Expr::op_of(
            Some("t1"),
            "contains",
            vec![Expr::field("t1", "enumset"), Expr::enumset(["a"])],
        );
        assert_eq!(
            compile(&schema, &contains),
            Some(JsonQl::op(
                "@>",
                vec![
                    JsonQl::op("to_jsonb", vec![JsonQl::field("T1", "enumset")]),
                    JsonQl::cast(JsonQl::literal("[\"a\"]"), "jsonb"),
                ]
            ))
        );
    }

    #[test]
    fn test_ordered_aggregates() {
        let schema = schema();
        let last = Expr::op_of(Some("t1"), "last", vec![Expr::field("t1", "number")]);
        match compile(&schema, &last) {
            Some(JsonQl::Op { op, exprs, .. }) => {
                assert_eq!(op, "[]");
                assert_eq!(exprs[1], JsonQl::literal(1));
                match &exprs[0] {
                    JsonQl::Op { op, order_by, .. } => {
                        assert_eq!(op, "array_agg");
                        assert_eq!(
                            order_by.last(),
                            Some(&OrderBy::desc(JsonQl::field("T1", "ordering")).nulls_last())
                        );
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }

        let previous = Expr::op_of(Some("t1"), "previous", vec![Expr::field("t1", "number")]);
        match compile(&schema, &previous) {
            Some(JsonQl::Op { exprs, .. }) => assert_eq!(exprs[1], JsonQl::literal(2)),
            other => panic!("unexpected {:?}", other),
        }

        // Filtered variant sorts matching rows first
        let last_where = Expr::op_of(
            Some("t1"),
            "last where",
            vec![Expr::field("t1", "number"), Expr::field("t1", "boolean")],
        );
        match compile(&schema, &last_where) {
            Some(JsonQl::Op { exprs, .. }) => match &exprs[0] {
                JsonQl::Op { order_by, .. } => assert_eq!(order_by.len(), 3),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }

        let unordered = Expr::op_of(Some("t2"), "last", vec![Expr::field("t2", "number")]);
        assert_eq!(
            ExprCompiler::new(&schema).compile(Some(&unordered), "T2"),
            Err(CompileError::NoOrdering("t2".into()))
        );
    }

    #[test]
    fn test_relative_dates_share_now() {
        let schema = schema();
        let options = CompilerOptions {
            now: Some(Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()),
            ..Default::default()
        };
        let compiler = ExprCompiler::with_options(&schema, &options);
        let this_month = Expr::op_of(Some("t1"), "thismonth", vec![Expr::field("t1", "date")]);
        assert_eq!(
            compiler.compile(Some(&this_month), "T1").unwrap(),
            Some(JsonQl::op(
                "and",
                vec![
                    JsonQl::op(">=", vec![JsonQl::field("T1", "date"), JsonQl::literal("2024-03-01")]),
                    JsonQl::op("<", vec![JsonQl::field("T1", "date"), JsonQl::literal("2024-04-01")]),
                ]
            ))
        );
    }

    #[test]
    fn test_enum_to_text() {
        let schema = schema();
        let to_text = Expr::op_of(Some("t1"), "to text", vec![Expr::field("t1", "enum")]);
        let compiled = serde_json::to_value(compile(&schema, &to_text).unwrap()).unwrap();
        assert_eq!(compiled["type"], "case");
        assert_eq!(compiled["cases"][1], json!({
            "when": { "type": "literal", "value": "b" },
            "then": { "type": "literal", "value": "Banana" }
        }));
    }

    #[test]
    fn test_is_latest() {
        let schema = schema();
        let latest = Expr::op(Some("t1"), "is latest", vec![Some(Expr::field("t1", "enum")), None]);
        let compiled = serde_json::to_value(compile(&schema, &latest).unwrap()).unwrap();
        assert_eq!(compiled["op"], "in");
        assert_eq!(compiled["exprs"][0], json!({ "type": "field", "tableAlias": "T1", "column": "_id" }));
        let ranked = &compiled["exprs"][1]["from"]["query"];
        assert_eq!(ranked["selects"][1]["expr"]["op"], "row_number");
        assert_eq!(
            ranked["selects"][1]["expr"]["over"]["partitionBy"][0],
            json!({ "type": "field", "tableAlias": "innerrn", "column": "enum" })
        );
    }

    #[test]
    fn test_unknown_op_is_fatal() {
        let schema = schema();
        let bogus = Expr::op(Some("t1"), "frobnicate", vec![]);
        assert_eq!(
            ExprCompiler::new(&schema).compile(Some(&bogus), "T1"),
            Err(CompileError::UnknownOp("frobnicate".into()))
        );
    }
}
