//! Expression compilation.
//!
//! [`ExprCompiler`] turns a cleaned expression into a [`JsonQl`] tree for an
//! external query executor. Absent or empty expressions compile to `None`.
//! The compiler trusts its input to have been cleaned, except that unknown
//! tables and columns raise [`CompileError`] instead of producing a broken
//! query.
//!
//! The current time is read once per [`ExprCompiler::compile`] call (or taken
//! from [`CompilerOptions::now`]) and reused for every date boundary in the
//! resulting tree.

mod dates;
mod op;

pub use dates::{parse_date_value, relative_window, DateWindow};

use crate::cleaner::normalize_join_ids;
use crate::expression::{
    upgrade_legacy, AggrStatus, BuildEnumsetExpr, CaseExpr, Expr, FieldExpr, LiteralType, ScalarExpr, ScoreExpr,
    MAX_DEPTH,
};
use crate::extension::{get_extension, ExtensionError};
use crate::inference::joins::JoinHop;
use crate::inference::ExprUtils;
use crate::jsonql::{JsonQl, WhenThen};
use crate::schema::{ColumnSource, ColumnType, Schema, Table, Variable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("column {column} not found in table {table}")]
    ColumnNotFound { table: String, column: String },

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("table {0} must have an ordering")]
    NoOrdering(String),

    #[error("unknown op {0}")]
    UnknownOp(String),

    #[error("expression nested too deeply or references itself")]
    CircularReference,

    #[error(transparent)]
    Extension(#[from] ExtensionError),
}

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompilerOptions {
    /// Variables in scope; the schema's own when empty
    pub variables: Vec<Variable>,
    /// Values substituted for variable references
    pub variable_values: HashMap<String, Expr>,
    /// Fixed current time; read from the clock on each compile when unset
    pub now: Option<DateTime<Utc>>,
    /// Locale of enum labels produced by `to text`
    pub locale: Option<String>,
}

/// Per-call state threaded through compilation
#[derive(Clone, Copy)]
struct Frame {
    now: DateTime<Utc>,
    depth: usize,
}

impl Frame {
    fn deeper(self) -> CompileResult<Self> {
        if self.depth >= MAX_DEPTH {
            log::error!("compilation exceeded depth {}", MAX_DEPTH);
            return Err(CompileError::CircularReference);
        }
        Ok(Self {
            depth: self.depth + 1,
            ..self
        })
    }
}

static DEFAULT_OPTIONS: LazyLock<CompilerOptions> = LazyLock::new(CompilerOptions::default);

pub struct ExprCompiler<'a> {
    utils: ExprUtils<'a>,
    options: &'a CompilerOptions,
}

impl<'a> ExprCompiler<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self::with_options(schema, &DEFAULT_OPTIONS)
    }

    pub fn with_options(schema: &'a Schema, options: &'a CompilerOptions) -> Self {
        let utils = if options.variables.is_empty() {
            ExprUtils::new(schema)
        } else {
            ExprUtils::with_variables(schema, &options.variables)
        };
        Self { utils, options }
    }

    pub fn utils(&self) -> &ExprUtils<'a> {
        &self.utils
    }

    fn schema(&self) -> &'a Schema {
        self.utils.schema()
    }

    /// Compile `expr` evaluated against rows aliased `table_alias`
    pub fn compile(&self, expr: Option<&Expr>, table_alias: &str) -> CompileResult<Option<JsonQl>> {
        let Some(expr) = expr else {
            return Ok(None);
        };
        let now = self.options.now.unwrap_or_else(Utc::now);
        self.compile_expr(expr, table_alias, Frame { now, depth: 0 })
    }

    /// Source clause for `table_id`, wrapping a table's own query if it has one
    pub fn compile_table(&self, table_id: &str, alias: &str) -> CompileResult<JsonQl> {
        let table = self.get_table(table_id)?;
        Ok(match &table.jsonql {
            Some(query) => JsonQl::Subquery {
                query: Box::new(query.clone()),
                alias: alias.to_string(),
            },
            None => JsonQl::table(table_id, alias),
        })
    }

    fn get_table(&self, table_id: &str) -> CompileResult<&'a Table> {
        self.schema()
            .get_table(table_id)
            .ok_or_else(|| CompileError::TableNotFound(table_id.to_string()))
    }

    fn compile_opt(&self, expr: Option<&Expr>, alias: &str, frame: Frame) -> CompileResult<Option<JsonQl>> {
        match expr {
            Some(expr) => self.compile_expr(expr, alias, frame),
            None => Ok(None),
        }
    }

    fn compile_expr(&self, expr: &Expr, alias: &str, frame: Frame) -> CompileResult<Option<JsonQl>> {
        let frame = frame.deeper()?;
        match expr {
            Expr::Literal(lit) => Ok(match &lit.value {
                Value::Null => None,
                value => Some(JsonQl::literal(value.clone())),
            }),
            Expr::Field(field) => self.compile_field(field, alias, frame),
            Expr::Id(id) => self.compile_primary_key(&id.table, alias).map(Some),
            Expr::Op(op) => self.compile_op(op, alias, frame),
            Expr::Scalar(scalar) => self.compile_scalar(scalar, alias, frame),
            Expr::Case(case) => self.compile_case(case, alias, frame),
            Expr::Score(score) => self.compile_score(score, alias, frame),
            Expr::BuildEnumset(build) => self.compile_build_enumset(build, alias, frame),
            Expr::Variable(var) => match self.options.variable_values.get(&var.variable_id) {
                Some(value) => self.compile_expr(value, alias, frame),
                None => {
                    log::debug!("no value for variable {}, compiling as null", var.variable_id);
                    Ok(None)
                }
            },
            Expr::Extension(ext) => Ok(get_extension(&ext.extension)?.compile(ext, self, alias)?),
            Expr::Comparison(_) | Expr::Logical(_) | Expr::Count(_) => {
                self.compile_opt(upgrade_legacy(expr).as_ref(), alias, frame)
            }
        }
    }

    /// Primary key of `table_id` rows aliased `alias`
    pub(crate) fn compile_primary_key(&self, table_id: &str, alias: &str) -> CompileResult<JsonQl> {
        let table = self.get_table(table_id)?;
        Ok(column_source(&table.primary_key, alias))
    }

    fn compile_field(&self, field: &FieldExpr, alias: &str, frame: Frame) -> CompileResult<Option<JsonQl>> {
        let column = self
            .schema()
            .get_column(&field.table, &field.column)
            .ok_or_else(|| CompileError::ColumnNotFound {
                table: field.table.clone(),
                column: field.column.clone(),
            })?;

        if let Some(jsonql) = &column.jsonql {
            return Ok(Some(jsonql.inject_table_alias(alias)));
        }

        match column.column_type {
            ColumnType::Expr => self.compile_opt(column.expr.as_ref(), alias, frame),
            ColumnType::Join => {
                let join = column.join.as_ref().ok_or_else(|| CompileError::ColumnNotFound {
                    table: field.table.clone(),
                    column: field.column.clone(),
                })?;

                // A to-one join onto the target's primary key is just the local column
                if !join.kind.is_multiple() && join.jsonql.is_none() {
                    let target = self.get_table(&join.to_table)?;
                    if let (Some(from @ ColumnSource::Column(_)), Some(to)) = (&join.from_column, &join.to_column) {
                        if *to == target.primary_key {
                            return Ok(Some(column_source(from, alias)));
                        }
                    }
                }

                let inner = Expr::id(join.to_table.clone());
                self.compile_join_chain(&field.table, std::slice::from_ref(&field.column), Some(&inner), alias, frame)
            }
            ColumnType::Literal(_) => Ok(Some(JsonQl::field(alias, field.column.clone()))),
        }
    }

    fn compile_scalar(&self, scalar: &ScalarExpr, alias: &str, frame: Frame) -> CompileResult<Option<JsonQl>> {
        let joins = normalize_join_ids(&scalar.joins);
        let inner = match &scalar.aggr {
            Some(aggr) => {
                let inner_table = self
                    .utils
                    .follow_joins(&scalar.table, &joins)
                    .ok_or_else(|| CompileError::TableNotFound(scalar.table.clone()))?;
                Some(crate::cleaner::legacy_scalar_inner(
                    aggr,
                    scalar.expr.as_deref(),
                    scalar.where_.as_deref(),
                    Some(&inner_table),
                ))
            }
            None => scalar.expr.as_deref().cloned(),
        };

        if joins.is_empty() {
            return self.compile_opt(inner.as_ref(), alias, frame);
        }
        if joins.len() == 1 && matches!(inner, Some(Expr::Id(_))) {
            return self.compile_field(
                &FieldExpr {
                    table: scalar.table.clone(),
                    column: joins[0].clone(),
                },
                alias,
                frame,
            );
        }
        self.compile_join_chain(&scalar.table, &joins, inner.as_ref(), alias, frame)
    }

    /// Correlated subquery following `joins` from rows aliased `alias`, then
    /// evaluating `inner` at the far end. A chain that can yield many rows
    /// collects per-row values into a JSON array.
    fn compile_join_chain(
        &self,
        table: &str,
        joins: &[String],
        inner: Option<&Expr>,
        alias: &str,
        frame: Frame,
    ) -> CompileResult<Option<JsonQl>> {
        let Some(inner) = inner else {
            return Ok(None);
        };
        let hops = self.resolve_hops(table, joins)?;

        let mut from_alias = alias.to_string();
        let mut from: Option<JsonQl> = None;
        let mut where_ = None;
        for hop in &hops {
            let to_alias = join_alias(&from_alias, &hop.column);
            let condition = self.compile_join_condition(hop, &from_alias, &to_alias)?;
            let source = self.compile_table(&hop.to_table, &to_alias)?;
            from = Some(match from {
                // First hop correlates with the outer row
                None => {
                    where_ = Some(condition);
                    source
                }
                Some(left) => JsonQl::Join {
                    kind: "inner".to_string(),
                    left: Box::new(left),
                    right: Box::new(source),
                    on: Box::new(condition),
                },
            });
            from_alias = to_alias;
        }
        let Some(from) = from else {
            return self.compile_expr(inner, alias, frame);
        };

        let Some(mut expr) = self.compile_expr(inner, &from_alias, frame)? else {
            return Ok(None);
        };
        let multiple = hops.iter().any(|h| h.multiple);
        if multiple && self.utils.get_expr_aggr_status(Some(inner)) != Some(AggrStatus::Aggregate) {
            expr = JsonQl::op("to_json", vec![JsonQl::op("array_agg", vec![expr])]);
        }

        Ok(Some(JsonQl::Scalar {
            expr: Box::new(expr),
            from: Box::new(from),
            where_: where_.map(Box::new),
            order_by: Vec::new(),
            limit: Some(1),
        }))
    }

    fn resolve_hops(&self, table: &str, joins: &[String]) -> CompileResult<Vec<JoinHop>> {
        self.get_table(table)?;
        if let Some(hops) = self.utils.resolve_joins(table, joins) {
            return Ok(hops);
        }

        // Report the first hop that fails
        let mut current = table.to_string();
        for join in joins {
            match self.utils.follow_joins(&current, std::slice::from_ref(join)) {
                Some(next) => current = next,
                None => {
                    return Err(CompileError::ColumnNotFound {
                        table: current,
                        column: join.clone(),
                    })
                }
            }
        }
        Err(CompileError::TableNotFound(current))
    }

    fn compile_join_condition(&self, hop: &JoinHop, from_alias: &str, to_alias: &str) -> CompileResult<JsonQl> {
        let column = self
            .schema()
            .get_column(&hop.from_table, &hop.column)
            .ok_or_else(|| CompileError::ColumnNotFound {
                table: hop.from_table.clone(),
                column: hop.column.clone(),
            })?;
        let to_key = self.compile_primary_key(&hop.to_table, to_alias)?;

        if let Some(join) = &column.join {
            if let Some(condition) = &join.jsonql {
                let aliases = HashMap::from([("{from}", from_alias), ("{to}", to_alias)]);
                return Ok(condition.inject_table_aliases(&aliases));
            }
            let from = join
                .from_column
                .as_ref()
                .map(|c| column_source(c, from_alias))
                .unwrap_or_else(|| JsonQl::field(from_alias, hop.column.clone()));
            let to = join
                .to_column
                .as_ref()
                .map(|c| column_source(c, to_alias))
                .unwrap_or(to_key);
            return Ok(JsonQl::op("=", vec![to, from]));
        }

        // `id` / `id[]` columns reference the target's primary key directly
        let local = JsonQl::field(from_alias, hop.column.clone());
        Ok(match column.literal_type() {
            Some(LiteralType::IdArray) => JsonQl::op(
                "@>",
                vec![to_jsonb(local), JsonQl::op("to_jsonb", vec![to_key])],
            ),
            _ => JsonQl::op("=", vec![to_key, local]),
        })
    }

    fn compile_case(&self, case: &CaseExpr, alias: &str, frame: Frame) -> CompileResult<Option<JsonQl>> {
        let mut cases = Vec::new();
        for item in &case.cases {
            let Some(when) = self.compile_opt(item.when.as_ref(), alias, frame)? else {
                continue;
            };
            let then = self.compile_opt(item.then.as_ref(), alias, frame)?.unwrap_or_else(JsonQl::null);
            cases.push(WhenThen { when, then });
        }
        let else_ = self.compile_opt(case.else_.as_deref(), alias, frame)?;

        if cases.is_empty() {
            return Ok(else_);
        }
        Ok(Some(JsonQl::Case {
            input: None,
            cases,
            else_: else_.map(Box::new),
        }))
    }

    fn compile_score(&self, score: &ScoreExpr, alias: &str, frame: Frame) -> CompileResult<Option<JsonQl>> {
        let Some(input) = self.compile_opt(score.input.as_deref(), alias, frame)? else {
            return Ok(Some(JsonQl::literal(0)));
        };
        let input_type = self.utils.get_expr_type(score.input.as_deref());

        let mut scored = Vec::new();
        for (key, value) in &score.scores {
            if let Some(value) = self.compile_opt(value.as_ref(), alias, frame)? {
                scored.push((key, value));
            }
        }
        if scored.is_empty() {
            return Ok(Some(JsonQl::literal(0)));
        }

        if input_type == Some(LiteralType::Enumset) {
            // Every selected value adds its score
            let terms = scored
                .into_iter()
                .map(|(key, value)| JsonQl::Case {
                    input: None,
                    cases: vec![WhenThen {
                        when: JsonQl::op("@>", vec![to_jsonb(input.clone()), to_jsonb(JsonQl::literal(vec![key.clone()]))]),
                        then: value,
                    }],
                    else_: Some(Box::new(JsonQl::literal(0))),
                })
                .collect();
            return Ok(Some(JsonQl::op("+", terms)));
        }

        Ok(Some(JsonQl::Case {
            input: Some(Box::new(input)),
            cases: scored
                .into_iter()
                .map(|(key, value)| WhenThen {
                    when: JsonQl::literal(key.clone()),
                    then: value,
                })
                .collect(),
            else_: Some(Box::new(JsonQl::literal(0))),
        }))
    }

    fn compile_build_enumset(
        &self,
        build: &BuildEnumsetExpr,
        alias: &str,
        frame: Frame,
    ) -> CompileResult<Option<JsonQl>> {
        let mut items = Vec::new();
        for (key, value) in &build.values {
            if let Some(when) = self.compile_opt(value.as_ref(), alias, frame)? {
                items.push(JsonQl::Case {
                    input: None,
                    cases: vec![WhenThen {
                        when,
                        then: JsonQl::literal(key.clone()),
                    }],
                    else_: None,
                });
            }
        }
        if items.is_empty() {
            return Ok(Some(to_jsonb(JsonQl::literal(Value::Array(Vec::new())))));
        }
        Ok(Some(JsonQl::op(
            "to_jsonb",
            vec![JsonQl::op("array_remove", vec![JsonQl::op("array", items), JsonQl::null()])],
        )))
    }
}

/// Reference to a column (or column-like fragment) of rows aliased `alias`
fn column_source(source: &ColumnSource, alias: &str) -> JsonQl {
    match source {
        ColumnSource::Column(column) => JsonQl::field(alias, column.clone()),
        ColumnSource::JsonQl(fragment) => fragment.inject_table_alias(alias),
    }
}

/// Alias of the table reached through `column`, e.g. `main_client_id`
fn join_alias(from_alias: &str, column: &str) -> String {
    let sanitized: String = column
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", from_alias, sanitized)
}

/// JSONB view of an array-valued expression; literal arrays become a
/// `jsonb` constant
pub(crate) fn to_jsonb(expr: JsonQl) -> JsonQl {
    match expr {
        JsonQl::Literal {
            value: value @ Value::Array(_),
        } => JsonQl::cast(JsonQl::literal(value.to_string()), "jsonb"),
        other => JsonQl::op("to_jsonb", vec![other]),
    }
}
