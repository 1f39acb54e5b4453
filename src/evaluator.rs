//! Direct interpretation of expressions.
//!
//! [`ExprEvaluator::evaluate`] walks an expression against host rows reached
//! through the [`Row`] capability, suspending at every row access. Sibling
//! operands and per-row evaluations are issued concurrently. Results match
//! what the compiled query would return for the same rows.
//!
//! [`ExprEvaluator::evaluate_sync`] handles the subset that needs no rows:
//! literals, non-aggregate operators and constant variables. Anything else is
//! rejected with [`EvalError::NotSyncEvaluable`].

mod aggregate;
mod ops;
mod row;

pub use row::{Joined, MemoryRow, Row};

use crate::cleaner::{legacy_scalar_inner, normalize_join_ids};
use crate::expression::operator;
use crate::expression::{upgrade_legacy, AggrStatus, Expr, FieldExpr, OpExpr, ScalarExpr, MAX_DEPTH};
use crate::extension::{get_extension, ExtensionError};
use crate::inference::ExprUtils;
use crate::schema::{ColumnType, Schema, Variable};
use chrono::{DateTime, Utc};
use futures_util::future::{try_join_all, BoxFuture, FutureExt};
use ops::{is_true, OpEnv};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Operators whose absent operands are dropped rather than read as null
const VARIADIC_OPS: [&str; 6] = ["and", "or", "+", "*", "least", "greatest"];

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("expression needs a row")]
    RequiresRow,

    #[error("aggregate expression needs rows")]
    RequiresRows,

    #[error("{0} cannot be evaluated synchronously")]
    NotSyncEvaluable(String),

    #[error("table {0} must have an ordering")]
    NoOrdering(String),

    #[error("unknown op {0}")]
    UnknownOp(String),

    #[error("column {column} not found in table {table}")]
    ColumnNotFound { table: String, column: String },

    #[error("cannot evaluate {op} in memory: {reason}")]
    Unsupported { op: String, reason: &'static str },

    #[error("expression nested too deeply")]
    TooDeep,

    #[error("row access failed: {0}")]
    Row(#[from] anyhow::Error),

    #[error(transparent)]
    Extension(#[from] ExtensionError),
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Rows an expression is evaluated against: the current row for individual
/// expressions, the row set for aggregates, both for `is latest`
#[derive(Clone, Default)]
pub struct EvalContext {
    pub row: Option<Arc<dyn Row>>,
    pub rows: Option<Vec<Arc<dyn Row>>>,
}

impl EvalContext {
    pub fn for_row(row: Arc<dyn Row>) -> Self {
        Self {
            row: Some(row),
            rows: None,
        }
    }

    pub fn for_rows(rows: Vec<Arc<dyn Row>>) -> Self {
        Self {
            row: None,
            rows: Some(rows),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Arc<dyn Row>>) -> Self {
        self.rows = Some(rows);
        self
    }

    fn require_row(&self) -> EvalResult<&Arc<dyn Row>> {
        self.row.as_ref().ok_or(EvalError::RequiresRow)
    }

    fn require_rows(&self) -> EvalResult<&[Arc<dyn Row>]> {
        self.rows.as_deref().ok_or(EvalError::RequiresRows)
    }
}

/// Per-call state threaded through the walk
#[derive(Clone, Copy)]
struct Frame {
    now: DateTime<Utc>,
    depth: usize,
}

impl Frame {
    fn deeper(self) -> EvalResult<Self> {
        if self.depth >= MAX_DEPTH {
            log::warn!("evaluation exceeded depth {}", MAX_DEPTH);
            return Err(EvalError::TooDeep);
        }
        Ok(Self {
            depth: self.depth + 1,
            ..self
        })
    }
}

/// Evaluates expressions directly against [`Row`]s.
///
/// `within` and `within any` need the current row's id on the left and a
/// table with an `ancestry` (or `ancestry_text`) column; any other shape
/// fails with [`EvalError::Unsupported`].
pub struct ExprEvaluator<'a> {
    utils: ExprUtils<'a>,
    variable_values: HashMap<String, Expr>,
    locale: Option<String>,
    now: Option<DateTime<Utc>>,
}

impl<'a> ExprEvaluator<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self::from_utils(ExprUtils::new(schema))
    }

    pub fn with_variables(schema: &'a Schema, variables: &'a [Variable]) -> Self {
        Self::from_utils(ExprUtils::with_variables(schema, variables))
    }

    fn from_utils(utils: ExprUtils<'a>) -> Self {
        Self {
            utils,
            variable_values: HashMap::new(),
            locale: None,
            now: None,
        }
    }

    pub fn with_variable_values(mut self, values: HashMap<String, Expr>) -> Self {
        self.variable_values = values;
        self
    }

    /// Locale of enum labels produced by `to text`
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// Fix the current time instead of reading the clock on each call
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn utils(&self) -> &ExprUtils<'a> {
        &self.utils
    }

    fn frame(&self) -> Frame {
        Frame {
            now: self.now.unwrap_or_else(Utc::now),
            depth: 0,
        }
    }

    pub async fn evaluate(&self, expr: Option<&Expr>, context: &EvalContext) -> EvalResult<Value> {
        self.eval_opt(expr, context, self.frame()).await
    }

    pub fn evaluate_sync(&self, expr: Option<&Expr>) -> EvalResult<Value> {
        self.eval_sync(expr, self.frame())
    }

    async fn eval_opt(&self, expr: Option<&Expr>, context: &EvalContext, frame: Frame) -> EvalResult<Value> {
        match expr {
            Some(expr) => self.eval(expr, context, frame).await,
            None => Ok(Value::Null),
        }
    }

    fn eval<'b>(&'b self, expr: &'b Expr, context: &'b EvalContext, frame: Frame) -> BoxFuture<'b, EvalResult<Value>> {
        async move {
            let frame = frame.deeper()?;
            match expr {
                Expr::Literal(lit) => Ok(lit.value.clone()),
                Expr::Field(field) => self.eval_field(field, context, frame).await,
                Expr::Id(_) => Ok(context.require_row()?.get_primary_key().await?),
                Expr::Op(op) => self.eval_op(op, context, frame).await,
                Expr::Scalar(scalar) => self.eval_scalar(scalar, context, frame).await,
                Expr::Case(case) => {
                    for item in &case.cases {
                        let Some(when) = &item.when else { continue };
                        if is_true(&self.eval(when, context, frame).await?) {
                            return self.eval_opt(item.then.as_ref(), context, frame).await;
                        }
                    }
                    self.eval_opt(case.else_.as_deref(), context, frame).await
                }
                Expr::Score(score) => {
                    let input = self.eval_opt(score.input.as_deref(), context, frame).await?;
                    let values = try_join_all(
                        score
                            .scores
                            .values()
                            .map(|value| self.eval_opt(value.as_ref(), context, frame)),
                    )
                    .await?;
                    Ok(score_value(&input, score.scores.keys().zip(values)))
                }
                Expr::BuildEnumset(build) => {
                    let conditions = try_join_all(
                        build
                            .values
                            .values()
                            .map(|cond| self.eval_opt(cond.as_ref(), context, frame)),
                    )
                    .await?;
                    Ok(build_enumset(build.values.keys().zip(conditions)))
                }
                Expr::Variable(var) => match self.variable_values.get(&var.variable_id) {
                    Some(value) => self.eval(value, context, frame).await,
                    None => Ok(Value::Null),
                },
                Expr::Extension(ext) => Ok(get_extension(&ext.extension)?.evaluate(ext, self, context).await?),
                Expr::Comparison(_) | Expr::Logical(_) | Expr::Count(_) => {
                    let upgraded = upgrade_legacy(expr);
                    self.eval_opt(upgraded.as_ref(), context, frame).await
                }
            }
        }
        .boxed()
    }

    /// Value of each row for `expr`; empty when the expression is absent
    async fn eval_per_row(&self, expr: Option<&Expr>, rows: &[Arc<dyn Row>], frame: Frame) -> EvalResult<Vec<Value>> {
        let Some(expr) = expr else {
            return Ok(Vec::new());
        };
        try_join_all(rows.iter().map(|row| {
            let context = EvalContext::for_row(row.clone());
            async move { self.eval(expr, &context, frame).await }
        }))
        .await
    }

    async fn eval_field(&self, field: &FieldExpr, context: &EvalContext, frame: Frame) -> EvalResult<Value> {
        let column = self
            .utils
            .schema()
            .get_column(&field.table, &field.column)
            .ok_or_else(|| EvalError::ColumnNotFound {
                table: field.table.clone(),
                column: field.column.clone(),
            })?;

        if let Some(expr) = &column.expr {
            return self.eval(expr, context, frame).await;
        }

        let row = context.require_row()?;
        if !matches!(column.column_type, ColumnType::Join) {
            return Ok(row.get_field(&column.id).await?);
        }
        // Join columns read as the id(s) of the joined rows
        Ok(match row.follow_join(&column.id).await? {
            Joined::None => Value::Null,
            Joined::One(target) => target.get_primary_key().await?,
            Joined::Many(targets) => Value::Array(try_join_all(targets.iter().map(|t| t.get_primary_key())).await?),
        })
    }

    async fn eval_scalar(&self, scalar: &ScalarExpr, context: &EvalContext, frame: Frame) -> EvalResult<Value> {
        let joins = normalize_join_ids(&scalar.joins);
        let inner = match &scalar.aggr {
            Some(aggr) => {
                let inner_table = self.utils.follow_joins(&scalar.table, &joins);
                Some(legacy_scalar_inner(
                    aggr,
                    scalar.expr.as_deref(),
                    scalar.where_.as_deref(),
                    inner_table.as_deref(),
                ))
            }
            None => scalar.expr.as_deref().cloned(),
        };
        let Some(inner) = inner else {
            return Ok(Value::Null);
        };
        if joins.is_empty() {
            return self.eval(&inner, context, frame).await;
        }

        let mut rows = vec![context.require_row()?.clone()];
        let mut multiple = self.utils.is_multiple_joins(&scalar.table, &joins);
        for join in &joins {
            let joined = try_join_all(rows.iter().map(|row| row.follow_join(join))).await?;
            multiple |= joined.iter().any(|j| matches!(j, Joined::Many(_)));
            rows = joined.into_iter().flat_map(Joined::into_rows).collect();
        }

        if !multiple {
            return match rows.into_iter().next() {
                Some(row) => self.eval(&inner, &EvalContext::for_row(row), frame).await,
                None => Ok(Value::Null),
            };
        }
        if self.utils.get_expr_aggr_status(Some(&inner)) == Some(AggrStatus::Aggregate) {
            return self.eval(&inner, &EvalContext::for_rows(rows), frame).await;
        }
        Ok(Value::Array(self.eval_per_row(Some(&inner), &rows, frame).await?))
    }

    async fn eval_op(&self, op: &OpExpr, context: &EvalContext, frame: Frame) -> EvalResult<Value> {
        let name = op.op.as_str();
        if !operator::is_known_op(name) {
            return Err(EvalError::UnknownOp(op.op.clone()));
        }
        match name {
            "is latest" => return self.eval_is_latest(op, context, frame).await,
            "within" | "within any" => return self.eval_within(op, context, frame).await,
            _ if operator::is_op_aggr(name) => return self.eval_aggregate(op, context, frame).await,
            _ => {}
        }

        let args = try_join_all(
            operands(op)
                .into_iter()
                .map(|expr| self.eval_opt(expr, context, frame)),
        )
        .await?;
        self.apply(op, &args, frame)
    }

    fn apply(&self, op: &OpExpr, args: &[Value], frame: Frame) -> EvalResult<Value> {
        let lhs = op.exprs.first().and_then(Option::as_ref);
        let enum_values = match op.op.as_str() {
            "to text" => self.utils.get_expr_enum_values(lhs),
            _ => None,
        };
        let env = OpEnv {
            now: frame.now,
            lhs_type: self.utils.get_expr_type(lhs),
            enum_values: enum_values.as_deref(),
            locale: self.locale.as_deref(),
        };
        ops::apply_op(&op.op, args, &env)
    }

    async fn eval_aggregate(&self, op: &OpExpr, context: &EvalContext, frame: Frame) -> EvalResult<Value> {
        let rows = context.require_rows()?;
        let columns = try_join_all(
            op.exprs
                .iter()
                .map(|expr| self.eval_per_row(expr.as_ref(), rows, frame)),
        )
        .await?;

        if !operator::is_op_ordered(&op.op) {
            return aggregate::aggregate(&op.op, &columns, rows.len());
        }
        let orderings = self.eval_orderings(op, rows, frame).await?;
        let values = columns.first().map(Vec::as_slice).unwrap_or_default();
        let conditions = columns
            .get(1)
            .filter(|c| op.op.ends_with(" where") && !c.is_empty())
            .map(Vec::as_slice);
        Ok(aggregate::ordered(&op.op, values, conditions, &orderings))
    }

    /// Ordering column of each row, for the table the op runs against
    async fn eval_orderings(&self, op: &OpExpr, rows: &[Arc<dyn Row>], frame: Frame) -> EvalResult<Vec<Value>> {
        let table_id = op
            .table
            .as_deref()
            .or_else(|| op.exprs.first().and_then(Option::as_ref).and_then(Expr::table))
            .unwrap_or_default();
        let ordering = self
            .utils
            .schema()
            .get_table(table_id)
            .and_then(|t| t.ordering.clone())
            .ok_or_else(|| EvalError::NoOrdering(table_id.to_string()))?;
        let field = Expr::field(table_id, ordering);
        self.eval_per_row(Some(&field), rows, frame).await
    }

    async fn eval_is_latest(&self, op: &OpExpr, context: &EvalContext, frame: Frame) -> EvalResult<Value> {
        let Some(lhs) = op.exprs.first().and_then(Option::as_ref) else {
            return Ok(Value::Null);
        };
        let row = context.require_row()?;
        let rows = context.require_rows()?;

        let orderings = self.eval_orderings(op, rows, frame).await?;
        let partitions = self.eval_per_row(Some(lhs), rows, frame).await?;
        let conditions = match op.exprs.get(1).and_then(Option::as_ref) {
            Some(cond) => Some(self.eval_per_row(Some(cond), rows, frame).await?),
            None => None,
        };
        let keys = try_join_all(rows.iter().map(|r| r.get_primary_key())).await?;

        let latest = aggregate::latest_keys(&keys, &partitions, conditions.as_deref(), &orderings);
        let key = row.get_primary_key().await?;
        Ok(Value::Bool(latest.contains(&key)))
    }

    /// `within` reads the ancestry stored on the current row, so the left
    /// operand must be the row's own id. Hierarchies kept in a separate
    /// ancestry table are only supported when compiled.
    async fn eval_within(&self, op: &OpExpr, context: &EvalContext, frame: Frame) -> EvalResult<Value> {
        let lhs = op.exprs.first().and_then(Option::as_ref);
        let rhs = self.eval_opt(op.exprs.get(1).and_then(Option::as_ref), context, frame).await?;
        if lhs.is_none() || rhs.is_null() {
            return Ok(Value::Null);
        }

        let table = self
            .utils
            .get_expr_id_table(lhs)
            .and_then(|id| self.utils.schema().get_table(&id));
        let column = table.and_then(|t| t.ancestry.as_ref().or(t.ancestry_text.as_ref()));
        let (Some(Expr::Id(_)), Some(column)) = (lhs, column) else {
            return Err(EvalError::Unsupported {
                op: op.op.clone(),
                reason: "left operand must be the row id of a table with an ancestry column",
            });
        };

        let ancestors = match context.require_row()?.get_field(column).await? {
            Value::Array(ids) => ids.iter().map(id_text).collect::<Vec<_>>(),
            _ => return Ok(Value::Bool(false)),
        };
        let within = match &rhs {
            Value::Array(targets) => targets.iter().any(|t| ancestors.contains(&id_text(t))),
            target => ancestors.contains(&id_text(target)),
        };
        Ok(Value::Bool(within))
    }

    fn eval_sync(&self, expr: Option<&Expr>, frame: Frame) -> EvalResult<Value> {
        let Some(expr) = expr else {
            return Ok(Value::Null);
        };
        let frame = frame.deeper()?;
        match expr {
            Expr::Literal(lit) => Ok(lit.value.clone()),
            Expr::Field(_) | Expr::Id(_) | Expr::Scalar(_) => Err(EvalError::NotSyncEvaluable(expr.kind().to_string())),
            Expr::Op(op) => {
                let name = op.op.as_str();
                if !operator::is_known_op(name) {
                    return Err(EvalError::UnknownOp(op.op.clone()));
                }
                if operator::is_op_aggr(name) || matches!(name, "is latest" | "within" | "within any") {
                    return Err(EvalError::NotSyncEvaluable(op.op.clone()));
                }
                let args = operands(op)
                    .into_iter()
                    .map(|e| self.eval_sync(e, frame))
                    .collect::<EvalResult<Vec<_>>>()?;
                self.apply(op, &args, frame)
            }
            Expr::Case(case) => {
                for item in &case.cases {
                    if item.when.is_some() && is_true(&self.eval_sync(item.when.as_ref(), frame)?) {
                        return self.eval_sync(item.then.as_ref(), frame);
                    }
                }
                self.eval_sync(case.else_.as_deref(), frame)
            }
            Expr::Score(score) => {
                let input = self.eval_sync(score.input.as_deref(), frame)?;
                let values = score
                    .scores
                    .values()
                    .map(|value| self.eval_sync(value.as_ref(), frame))
                    .collect::<EvalResult<Vec<_>>>()?;
                Ok(score_value(&input, score.scores.keys().zip(values)))
            }
            Expr::BuildEnumset(build) => {
                let conditions = build
                    .values
                    .values()
                    .map(|cond| self.eval_sync(cond.as_ref(), frame))
                    .collect::<EvalResult<Vec<_>>>()?;
                Ok(build_enumset(build.values.keys().zip(conditions)))
            }
            Expr::Variable(var) => {
                let declared_table = self.utils.get_variable(&var.variable_id).and_then(|v| v.table.as_ref());
                if var.table.is_some() || declared_table.is_some() {
                    return Err(EvalError::NotSyncEvaluable(format!("variable {}", var.variable_id)));
                }
                self.eval_sync(self.variable_values.get(&var.variable_id), frame)
            }
            Expr::Extension(ext) => Ok(get_extension(&ext.extension)?.evaluate_sync(ext, self)?),
            Expr::Comparison(_) | Expr::Logical(_) | Expr::Count(_) => {
                self.eval_sync(upgrade_legacy(expr).as_ref(), frame)
            }
        }
    }
}

/// Operands to evaluate; variadic ops skip absent ones
fn operands(op: &OpExpr) -> Vec<Option<&Expr>> {
    if VARIADIC_OPS.contains(&op.op.as_str()) {
        op.exprs.iter().flatten().map(Some).collect()
    } else {
        op.exprs.iter().map(Option::as_ref).collect()
    }
}

/// Score of an enum (the matching entry) or enumset (sum of every selected
/// entry); 0 when nothing matches
fn score_value<'k>(input: &Value, scores: impl Iterator<Item = (&'k String, Value)>) -> Value {
    let mut total = 0.0;
    for (key, value) in scores {
        let selected = match input {
            Value::Array(items) => items.iter().any(|item| item.as_str() == Some(key.as_str())),
            Value::String(id) => id == key,
            _ => false,
        };
        if !selected {
            continue;
        }
        if !input.is_array() {
            return value;
        }
        total += ops::as_f64(&value).unwrap_or(0.0);
    }
    ops::number(total)
}

fn build_enumset<'k>(conditions: impl Iterator<Item = (&'k String, Value)>) -> Value {
    Value::Array(
        conditions
            .filter(|(_, cond)| is_true(cond))
            .map(|(key, _)| Value::String(key.clone()))
            .collect(),
    )
}

fn id_text(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
