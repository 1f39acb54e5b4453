//! Inference over expression trees.
//!
//! [`ExprUtils`] answers structural questions about an expression against a
//! schema: its result type, aggregation status, id-table, enum domain and the
//! fields it reads. It also owns operator lookup, used by every other
//! component.
//!
//! Lookups that pass through computed columns are depth-bounded by
//! [`MAX_DEPTH`]; hitting the bound is reported as "unknown" (or an error from
//! the `try_` variants), never a stack overflow.

pub mod joins;
pub mod summary;

use crate::cleaner::legacy_scalar_inner;
use crate::expression::operator::{self, OpItem};
use crate::expression::{
    upgrade_legacy, AggrStatus, Expr, FieldExpr, InferenceError, InferenceResult, LhsCond, LiteralType,
    MAX_DEPTH,
};
use crate::extension::get_extension;
use crate::schema::{ColumnType, EnumValue, LocalizedString, Schema, Variable};
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

pub use operator::{is_op_aggr, is_op_ordered, is_op_prefix};

/// Aggregation status of computed columns, keyed by
/// (schema uid, table, column, variables hash)
type AggrMemoKey = (u64, String, String, u64);

static AGGR_STATUS_MEMO: LazyLock<DashMap<AggrMemoKey, AggrStatus>> = LazyLock::new(DashMap::new);

/// Entries kept before the memo is reset
const AGGR_MEMO_CAPACITY: usize = 10_000;

/// Criteria for [`ExprUtils::find_matching_op_items`]; unset fields match
/// everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpFilter<'e> {
    pub op: Option<&'e str>,
    /// Result type must be one of these
    pub result_types: Option<&'e [LiteralType]>,
    /// Candidate left operand; its type and id-table constrain the entries
    pub lhs_expr: Option<&'e Expr>,
    pub aggr: Option<bool>,
    /// `Some(false)` excludes entries needing an ordered table
    pub ordered: Option<bool>,
}

/// Hash of a variable list, used to key caches by value
pub(crate) fn variables_key(variables: &[Variable]) -> u64 {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(variables)
        .unwrap_or_default()
        .hash(&mut hasher);
    hasher.finish()
}

pub struct ExprUtils<'a> {
    schema: &'a Schema,
    variables: &'a [Variable],
    variables_key: u64,
}

impl<'a> ExprUtils<'a> {
    /// Inference using the variables declared by the schema
    pub fn new(schema: &'a Schema) -> Self {
        Self::with_variables(schema, schema.get_variables())
    }

    pub fn with_variables(schema: &'a Schema, variables: &'a [Variable]) -> Self {
        Self {
            schema,
            variables,
            variables_key: variables_key(variables),
        }
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    pub fn variables(&self) -> &'a [Variable] {
        self.variables
    }

    pub fn get_variable(&self, variable_id: &str) -> Option<&'a Variable> {
        self.variables.iter().find(|v| v.id == variable_id)
    }

    /// Table the expression is evaluated against
    pub fn get_expr_table<'e>(&self, expr: Option<&'e Expr>) -> Option<&'e str> {
        expr?.table()
    }

    pub fn get_op_name(&self, op: &str) -> Option<&'static str> {
        operator::op_name(op)
    }

    /// Operator entries matching every criterion of `filter`, in table order
    pub fn find_matching_op_items(&self, filter: OpFilter<'_>) -> Vec<&'static OpItem> {
        self.matching_op_items_at(filter, 0)
    }

    fn matching_op_items_at(&self, filter: OpFilter<'_>, depth: usize) -> Vec<&'static OpItem> {
        let lhs_type = filter.lhs_expr.and_then(|e| self.type_at(e, depth + 1));

        operator::op_items()
            .iter()
            .filter(|item| filter.op.map_or(true, |op| item.op == op))
            .filter(|item| filter.result_types.map_or(true, |types| types.contains(&item.result_type)))
            .filter(|item| filter.aggr.map_or(true, |aggr| item.aggr == aggr))
            .filter(|item| filter.ordered != Some(false) || !item.ordered)
            .filter(|item| match (lhs_type, item.lhs_type()) {
                (Some(actual), Some(declared)) => actual == declared,
                _ => true,
            })
            .filter(|item| match (item.lhs_cond, filter.lhs_expr) {
                (Some(cond), Some(lhs)) => self.check_lhs_cond(cond, lhs, depth),
                _ => true,
            })
            .collect()
    }

    fn check_lhs_cond(&self, cond: LhsCond, lhs: &Expr, depth: usize) -> bool {
        match cond {
            LhsCond::HierarchicalIdTable => self
                .id_table_at(lhs, depth + 1)
                .and_then(|id_table| self.schema.get_table(&id_table))
                .is_some_and(|table| table.is_hierarchical()),
        }
    }

    /// Boolean operators whose left operand is of `lhs_type`
    pub fn get_comparison_ops(&self, lhs_type: LiteralType) -> Vec<&'static OpItem> {
        operator::op_items()
            .iter()
            .filter(|item| item.result_type == LiteralType::Boolean && !item.aggr)
            .filter(|item| item.lhs_type() == Some(lhs_type))
            .collect()
    }

    /// Result type of the expression, or `None` if it cannot be determined
    pub fn get_expr_type(&self, expr: Option<&Expr>) -> Option<LiteralType> {
        self.type_at(expr?, 0)
    }

    fn type_at(&self, expr: &Expr, depth: usize) -> Option<LiteralType> {
        if depth > MAX_DEPTH {
            return None;
        }

        match expr {
            Expr::Literal(lit) => Some(lit.value_type),
            Expr::Id(_) => Some(LiteralType::Id),
            Expr::Field(field) => {
                let column = self.schema.get_column(&field.table, &field.column)?;
                match column.column_type {
                    ColumnType::Literal(t) => Some(t),
                    ColumnType::Join => {
                        let join = column.join.as_ref()?;
                        Some(if join.kind.is_multiple() {
                            LiteralType::IdArray
                        } else {
                            LiteralType::Id
                        })
                    }
                    ColumnType::Expr => self.type_at(column.expr.as_ref()?, depth + 1),
                }
            }
            Expr::Op(op) => {
                let all = self.matching_op_items_at(
                    OpFilter {
                        op: Some(&op.op),
                        ..Default::default()
                    },
                    depth,
                );
                if let Some(t) = unique_result_type(&all) {
                    return Some(t);
                }
                let lhs = op.exprs.first().and_then(Option::as_ref);
                let narrowed = self.matching_op_items_at(
                    OpFilter {
                        op: Some(&op.op),
                        lhs_expr: lhs,
                        ..Default::default()
                    },
                    depth,
                );
                unique_result_type(&narrowed)
            }
            Expr::Scalar(scalar) => self.type_at(scalar.expr.as_deref()?, depth + 1),
            Expr::Case(case) => case
                .cases
                .iter()
                .filter_map(|c| c.then.as_ref())
                .chain(case.else_.as_deref())
                .find_map(|e| self.type_at(e, depth + 1)),
            Expr::Score(_) => Some(LiteralType::Number),
            Expr::BuildEnumset(_) => Some(LiteralType::Enumset),
            Expr::Variable(var) => self.get_variable(&var.variable_id).map(|v| v.value_type),
            Expr::Extension(ext) => get_extension(&ext.extension).ok()?.get_type(ext, self),
            Expr::Comparison(_) | Expr::Logical(_) => Some(LiteralType::Boolean),
            Expr::Count(_) => self.type_at(&upgrade_legacy(expr)?, depth + 1),
        }
    }

    /// Aggregation status, or `None` when it cannot be computed (for example
    /// a computed column referencing itself).
    pub fn get_expr_aggr_status(&self, expr: Option<&Expr>) -> Option<AggrStatus> {
        match self.try_get_expr_aggr_status(expr) {
            Ok(status) => Some(status),
            Err(err) => {
                log::warn!("cannot determine aggregation status: {}", err);
                None
            }
        }
    }

    pub fn try_get_expr_aggr_status(&self, expr: Option<&Expr>) -> InferenceResult<AggrStatus> {
        match expr {
            Some(expr) => self.aggr_status_at(expr, 0),
            None => Ok(AggrStatus::Literal),
        }
    }

    /// Aggregation status starting at a given recursion depth
    pub(crate) fn aggr_status_at(&self, expr: &Expr, depth: usize) -> InferenceResult<AggrStatus> {
        if depth > MAX_DEPTH {
            return Err(InferenceError::RecursionLimit);
        }

        match expr {
            Expr::Literal(_) => Ok(AggrStatus::Literal),
            // Without joins a scalar is its inner expression
            Expr::Scalar(scalar) if scalar.joins.is_empty() => {
                let inner = match &scalar.aggr {
                    Some(aggr) => Some(legacy_scalar_inner(
                        aggr,
                        scalar.expr.as_deref(),
                        scalar.where_.as_deref(),
                        Some(scalar.table.as_str()),
                    )),
                    None => scalar.expr.as_deref().cloned(),
                };
                match inner {
                    Some(inner) => self.aggr_status_at(&inner, depth + 1),
                    None => Ok(AggrStatus::Literal),
                }
            }
            Expr::Id(_) | Expr::Scalar(_) => Ok(AggrStatus::Individual),
            Expr::Field(field) => {
                let column = self.schema.get_column(&field.table, &field.column);
                match column.and_then(|c| c.expr.as_ref()) {
                    Some(column_expr) => self.computed_column_status(field, column_expr, depth),
                    None => Ok(AggrStatus::Individual),
                }
            }
            Expr::Op(op) => {
                if operator::is_op_aggr(&op.op) {
                    return Ok(AggrStatus::Aggregate);
                }
                self.highest_status(op.exprs.iter().flatten(), depth)
            }
            Expr::Case(case) => self.highest_status(
                case.cases
                    .iter()
                    .flat_map(|c| c.when.iter().chain(c.then.iter()))
                    .chain(case.else_.as_deref()),
                depth,
            ),
            Expr::Score(score) => self.highest_status(
                score.input.as_deref().into_iter().chain(score.scores.values().flatten()),
                depth,
            ),
            Expr::BuildEnumset(build) => self.highest_status(build.values.values().flatten(), depth),
            Expr::Variable(var) => {
                let variable = self
                    .get_variable(&var.variable_id)
                    .ok_or_else(|| InferenceError::VariableNotFound(var.variable_id.clone()))?;
                Ok(if variable.table.is_some() {
                    AggrStatus::Individual
                } else {
                    AggrStatus::Literal
                })
            }
            Expr::Extension(ext) => {
                let handler = get_extension(&ext.extension)?;
                Ok(handler.get_aggr_status(ext, self).unwrap_or(AggrStatus::Individual))
            }
            Expr::Comparison(_) | Expr::Logical(_) | Expr::Count(_) => match upgrade_legacy(expr) {
                Some(upgraded) => self.aggr_status_at(&upgraded, depth + 1),
                None => Ok(AggrStatus::Literal),
            },
        }
    }

    /// Highest status among `exprs`; an empty list is literal
    fn highest_status<'e>(&self, exprs: impl Iterator<Item = &'e Expr>, depth: usize) -> InferenceResult<AggrStatus> {
        let mut status = AggrStatus::Literal;
        for e in exprs {
            status = status.max(self.aggr_status_at(e, depth + 1)?);
        }
        Ok(status)
    }

    fn computed_column_status(
        &self,
        field: &FieldExpr,
        column_expr: &Expr,
        depth: usize,
    ) -> InferenceResult<AggrStatus> {
        let key = (
            self.schema.uid(),
            field.table.clone(),
            field.column.clone(),
            self.variables_key,
        );
        if let Some(status) = AGGR_STATUS_MEMO.get(&key) {
            return Ok(*status);
        }

        let status = self.aggr_status_at(column_expr, depth + 1)?;
        if AGGR_STATUS_MEMO.len() >= AGGR_MEMO_CAPACITY {
            log::debug!("resetting aggregation status memo");
            AGGR_STATUS_MEMO.clear();
        }
        AGGR_STATUS_MEMO.insert(key, status);
        Ok(status)
    }

    /// Table referenced by an `id` / `id[]` expression
    pub fn get_expr_id_table(&self, expr: Option<&Expr>) -> Option<String> {
        self.id_table_at(expr?, 0)
    }

    fn id_table_at(&self, expr: &Expr, depth: usize) -> Option<String> {
        if depth > MAX_DEPTH {
            return None;
        }

        match expr {
            Expr::Literal(lit) => lit.id_table.clone(),
            Expr::Id(id) => Some(id.table.clone()),
            Expr::Field(field) => {
                let column = self.schema.get_column(&field.table, &field.column)?;
                match column.column_type {
                    ColumnType::Join => column.join.as_ref().map(|j| j.to_table.clone()),
                    ColumnType::Expr => self.id_table_at(column.expr.as_ref()?, depth + 1),
                    ColumnType::Literal(_) => column.id_table.clone(),
                }
            }
            Expr::Scalar(scalar) => self.id_table_at(scalar.expr.as_deref()?, depth + 1),
            Expr::Op(op) => {
                // Operators carrying ids through (last, array_agg, ...) keep the
                // id-table of their first operand
                match self.type_at(expr, depth + 1) {
                    Some(LiteralType::Id) | Some(LiteralType::IdArray) => {
                        self.id_table_at(op.exprs.first()?.as_ref()?, depth + 1)
                    }
                    _ => None,
                }
            }
            Expr::Case(case) => case
                .cases
                .iter()
                .filter_map(|c| c.then.as_ref())
                .chain(case.else_.as_deref())
                .find_map(|e| self.id_table_at(e, depth + 1)),
            Expr::Variable(var) => self.get_variable(&var.variable_id)?.id_table.clone(),
            Expr::Extension(ext) => get_extension(&ext.extension).ok()?.get_id_table(ext, self),
            Expr::Score(_) | Expr::BuildEnumset(_) | Expr::Comparison(_) | Expr::Logical(_) => None,
            Expr::Count(_) => None,
        }
    }

    /// Enum domain of an `enum` / `enumset` expression
    pub fn get_expr_enum_values(&self, expr: Option<&Expr>) -> Option<Vec<EnumValue>> {
        self.enum_values_at(expr?, 0)
    }

    fn enum_values_at(&self, expr: &Expr, depth: usize) -> Option<Vec<EnumValue>> {
        if depth > MAX_DEPTH {
            return None;
        }

        match expr {
            Expr::Field(field) => {
                let column = self.schema.get_column(&field.table, &field.column)?;
                match column.column_type {
                    ColumnType::Expr => self.enum_values_at(column.expr.as_ref()?, depth + 1),
                    _ => column.enum_values.clone(),
                }
            }
            Expr::Scalar(scalar) => self.enum_values_at(scalar.expr.as_deref()?, depth + 1),
            Expr::Op(op) => match op.op.as_str() {
                "month" => Some(month_enum_values()),
                "weekofmonth" => Some(numbered_enum_values(1..=5, false)),
                "dayofmonth" => Some(numbered_enum_values(1..=31, true)),
                _ => match self.type_at(expr, depth + 1) {
                    Some(LiteralType::Enum) | Some(LiteralType::Enumset) => {
                        self.enum_values_at(op.exprs.first()?.as_ref()?, depth + 1)
                    }
                    _ => None,
                },
            },
            Expr::Case(case) => case
                .cases
                .iter()
                .filter_map(|c| c.then.as_ref())
                .chain(case.else_.as_deref())
                .find_map(|e| self.enum_values_at(e, depth + 1)),
            Expr::Variable(var) => self.get_variable(&var.variable_id)?.enum_values.clone(),
            Expr::Extension(ext) => get_extension(&ext.extension).ok()?.get_enum_values(ext, self),
            _ => None,
        }
    }

    /// Fields read by the expression, including those read through computed
    /// columns and join columns of scalars. Duplicates are removed.
    pub fn get_referenced_fields(&self, expr: Option<&Expr>) -> Vec<FieldExpr> {
        let mut fields = Vec::new();
        if let Some(expr) = expr {
            self.collect_fields(expr, 0, &mut fields);
        }
        fields
    }

    fn collect_fields(&self, expr: &Expr, depth: usize, out: &mut Vec<FieldExpr>) {
        if depth > MAX_DEPTH {
            return;
        }
        match expr {
            Expr::Field(field) => {
                push_unique(field.clone(), out);
                if let Some(column_expr) = self
                    .schema
                    .get_column(&field.table, &field.column)
                    .and_then(|c| c.expr.as_ref())
                {
                    self.collect_fields(column_expr, depth + 1, out);
                }
            }
            Expr::Scalar(scalar) => {
                let mut table = scalar.table.clone();
                for join in &scalar.joins {
                    push_unique(
                        FieldExpr {
                            table: table.clone(),
                            column: join.clone(),
                        },
                        out,
                    );
                    match self.follow_joins(&table, std::slice::from_ref(join)) {
                        Some(next) => table = next,
                        None => break,
                    }
                }
                if let Some(inner) = &scalar.expr {
                    self.collect_fields(inner, depth + 1, out);
                }
            }
            Expr::Op(op) => {
                for e in op.exprs.iter().flatten() {
                    self.collect_fields(e, depth + 1, out);
                }
            }
            Expr::Case(case) => {
                for item in &case.cases {
                    for e in item.when.iter().chain(item.then.iter()) {
                        self.collect_fields(e, depth + 1, out);
                    }
                }
                if let Some(e) = &case.else_ {
                    self.collect_fields(e, depth + 1, out);
                }
            }
            Expr::Score(score) => {
                for e in score.input.as_deref().into_iter().chain(score.scores.values().flatten()) {
                    self.collect_fields(e, depth + 1, out);
                }
            }
            Expr::BuildEnumset(build) => {
                for e in build.values.values().flatten() {
                    self.collect_fields(e, depth + 1, out);
                }
            }
            Expr::Extension(ext) => {
                if let Ok(handler) = get_extension(&ext.extension) {
                    for field in handler.get_referenced_fields(ext, self) {
                        push_unique(field, out);
                    }
                }
            }
            Expr::Comparison(_) | Expr::Logical(_) | Expr::Count(_) => {
                if let Some(upgraded) = upgrade_legacy(expr) {
                    self.collect_fields(&upgraded, depth + 1, out);
                }
            }
            Expr::Literal(_) | Expr::Id(_) | Expr::Variable(_) => {}
        }
    }

    /// Replace variable references by their values; references without a
    /// value become `None`.
    pub fn inline_variable_values(&self, expr: Option<&Expr>, values: &HashMap<String, Expr>) -> Option<Expr> {
        expr?.rewrite(&mut |e| match e {
            Expr::Variable(var) => Some(values.get(&var.variable_id).cloned()),
            _ => None,
        })
    }
}

fn push_unique(field: FieldExpr, out: &mut Vec<FieldExpr>) {
    if !out.contains(&field) {
        out.push(field);
    }
}

fn unique_result_type(items: &[&OpItem]) -> Option<LiteralType> {
    let first = items.first()?.result_type;
    items.iter().all(|i| i.result_type == first).then_some(first)
}

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

fn month_enum_values() -> Vec<EnumValue> {
    MONTH_NAMES
        .iter()
        .enumerate()
        .map(|(i, name)| EnumValue::new(format!("{:02}", i + 1), LocalizedString::new(*name)))
        .collect()
}

fn numbered_enum_values(range: std::ops::RangeInclusive<u32>, zero_padded: bool) -> Vec<EnumValue> {
    range
        .map(|n| {
            let id = if zero_padded { format!("{:02}", n) } else { n.to_string() };
            EnumValue::new(id, LocalizedString::new(n.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, EnumValue, Join, JoinKind, Table};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new().add_tables(vec![
            Table::new("t1", "T1")
                .with_ordering("number")
                .with_column(Column::new("text", LiteralType::Text))
                .with_column(Column::new("number", LiteralType::Number))
                .with_column(Column::new("date", LiteralType::Date))
                .with_column(Column::new("boolean", LiteralType::Boolean))
                .with_column(Column::enum_column(
                    "enum",
                    vec![EnumValue::new("a", "A"), EnumValue::new("b", "B")],
                ))
                .with_column(Column::join_column("1-2", Join::new(JoinKind::OneToMany, "t2", "id", "t1")))
                .with_column(Column::expr_column(
                    "expr_sum",
                    Expr::op_of(Some("t1"), "sum", vec![Expr::field("t1", "number")]),
                ))
                .with_column(Column::expr_column("self_ref", Expr::field("t1", "self_ref"))),
            Table::new("t2", "T2")
                .with_column(Column::new("number", LiteralType::Number))
                .with_column(Column::join_column("2-1", Join::new(JoinKind::ManyToOne, "t1", "t1", "id"))),
        ])
    }

    #[test]
    fn test_expr_type() {
        let schema = schema();
        let utils = ExprUtils::new(&schema);
        assert_eq!(utils.get_expr_type(None), None);
        assert_eq!(
            utils.get_expr_type(Some(&Expr::field("t1", "number"))),
            Some(LiteralType::Number)
        );
        assert_eq!(
            utils.get_expr_type(Some(&Expr::field("t1", "1-2"))),
            Some(LiteralType::IdArray)
        );
        assert_eq!(
            utils.get_expr_type(Some(&Expr::field("t2", "2-1"))),
            Some(LiteralType::Id)
        );

        // Comparison has a single result type regardless of operands
        let eq = Expr::op(Some("t1"), "=", vec![None, None]);
        assert_eq!(utils.get_expr_type(Some(&eq)), Some(LiteralType::Boolean));

        // `last` depends on its operand
        let last = Expr::op_of(Some("t1"), "last", vec![Expr::field("t1", "enum")]);
        assert_eq!(utils.get_expr_type(Some(&last)), Some(LiteralType::Enum));
        let unresolved = Expr::op(Some("t1"), "last", vec![None]);
        assert_eq!(utils.get_expr_type(Some(&unresolved)), None);

        // Circular computed column is unknown, not a crash
        assert_eq!(utils.get_expr_type(Some(&Expr::field("t1", "self_ref"))), None);
    }

    #[test]
    fn test_aggr_status() {
        let schema = schema();
        let utils = ExprUtils::new(&schema);
        let sum = Expr::op_of(Some("t1"), "sum", vec![Expr::field("t1", "number")]);
        let plus = Expr::op_of(Some("t1"), "+", vec![sum, Expr::number(1.0)]);
        assert_eq!(utils.get_expr_aggr_status(Some(&plus)), Some(AggrStatus::Aggregate));
        assert_eq!(
            utils.get_expr_aggr_status(Some(&Expr::number(1.0))),
            Some(AggrStatus::Literal)
        );
        assert_eq!(
            utils.get_expr_aggr_status(Some(&Expr::op(Some("t1"), "+", vec![]))),
            Some(AggrStatus::Literal)
        );
        assert_eq!(
            utils.get_expr_aggr_status(Some(&Expr::field("t1", "expr_sum"))),
            Some(AggrStatus::Aggregate)
        );
        assert_eq!(
            utils.try_get_expr_aggr_status(Some(&Expr::field("t1", "self_ref"))),
            Err(InferenceError::RecursionLimit)
        );
        assert_eq!(utils.get_expr_aggr_status(Some(&Expr::field("t1", "self_ref"))), None);
    }

    #[test]
    fn test_variable_status() {
        let schema = schema()
            .add_variable(Variable::new("constant", LiteralType::Number))
            .add_variable(Variable::new("per_row", LiteralType::Number).for_table("t1"));
        let utils = ExprUtils::new(&schema);
        assert_eq!(
            utils.get_expr_aggr_status(Some(&Expr::variable(None, "constant"))),
            Some(AggrStatus::Literal)
        );
        assert_eq!(
            utils.get_expr_aggr_status(Some(&Expr::variable(Some("t1"), "per_row"))),
            Some(AggrStatus::Individual)
        );
        assert_eq!(
            utils.try_get_expr_aggr_status(Some(&Expr::variable(None, "missing"))),
            Err(InferenceError::VariableNotFound("missing".into()))
        );
    }

    #[test]
    fn test_find_matching_op_items() {
        let schema = schema();
        let utils = ExprUtils::new(&schema);
        let lhs = Expr::field("t1", "enum");
        let items = utils.find_matching_op_items(OpFilter {
            lhs_expr: Some(&lhs),
            result_types: Some(&[LiteralType::Boolean]),
            ..Default::default()
        });
        assert_eq!(items[0].op, "= any");

        let items = utils.find_matching_op_items(OpFilter {
            op: Some("last"),
            ordered: Some(false),
            ..Default::default()
        });
        assert!(items.is_empty());

        // within requires a hierarchical id-table
        let id = Expr::id("t1");
        let items = utils.find_matching_op_items(OpFilter {
            op: Some("within"),
            lhs_expr: Some(&id),
            ..Default::default()
        });
        assert!(items.is_empty());
    }

    #[test]
    fn test_id_table_and_enum_values() {
        let schema = schema();
        let utils = ExprUtils::new(&schema);
        assert_eq!(
            utils.get_expr_id_table(Some(&Expr::field("t1", "1-2"))),
            Some("t2".to_string())
        );
        assert_eq!(utils.get_expr_id_table(Some(&Expr::id("t2"))), Some("t2".to_string()));

        let values = utils.get_expr_enum_values(Some(&Expr::field("t1", "enum"))).unwrap();
        assert_eq!(values.len(), 2);

        let month = Expr::op_of(Some("t1"), "month", vec![Expr::field("t1", "date")]);
        let values = utils.get_expr_enum_values(Some(&month)).unwrap();
        assert_eq!(values.len(), 12);
        assert_eq!(values[0].id, "01");
        assert_eq!(values[11].name.localize(None), "December");

        let day = Expr::op_of(Some("t1"), "dayofmonth", vec![Expr::field("t1", "date")]);
        assert_eq!(utils.get_expr_enum_values(Some(&day)).unwrap()[30].id, "31");
    }

    #[test]
    fn test_referenced_fields_and_variables() {
        let schema = schema();
        let utils = ExprUtils::new(&schema);
        let scalar = Expr::scalar(
            "t1",
            vec!["1-2".into()],
            Some(Expr::op_of(Some("t2"), "sum", vec![Expr::field("t2", "number")])),
        );
        let fields = utils.get_referenced_fields(Some(&scalar));
        assert_eq!(
            fields,
            vec![
                FieldExpr {
                    table: "t1".into(),
                    column: "1-2".into()
                },
                FieldExpr {
                    table: "t2".into(),
                    column: "number".into()
                },
            ]
        );

        let expr = Expr::op_of(
            Some("t1"),
            "+",
            vec![Expr::variable(None, "v1"), Expr::variable(None, "v2")],
        );
        let values = HashMap::from([("v1".to_string(), Expr::number(2.0))]);
        let inlined = utils.inline_variable_values(Some(&expr), &values).unwrap();
        assert_eq!(
            serde_json::to_value(&inlined).unwrap()["exprs"],
            json!([{ "type": "literal", "valueType": "number", "value": 2.0 }, null])
        );
    }
}
