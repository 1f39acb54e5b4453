//! Expression cleaning.
//!
//! [`ExprCleaner::clean`] rewrites a possibly invalid or legacy expression
//! into one that is valid for the given [`CleanOptions`], or `None`. It
//! prefers repairing the tree (wrapping a field in an aggregate, turning an
//! enum into a boolean test, substituting a compatible operator) over
//! discarding what the user built. A cleaned expression always validates
//! under the same options, and cleaning it again leaves it unchanged.

mod op;

use crate::expression::{
    operator, upgrade_legacy, AggrStatus, BuildEnumsetExpr, CaseExpr, CaseItem, Expr, ExtensionExpr, FieldExpr,
    LiteralExpr, LiteralType, ScalarExpr, ScoreExpr, MAX_DEPTH,
};
use crate::extension::get_extension;
use crate::inference::{ExprUtils, OpFilter};
use crate::schema::{ColumnType, Schema, Variable};
use crate::validator::{boolean_options, check_context};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Context an expression must be valid in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CleanOptions {
    /// Table the expression must belong to
    pub table: Option<String>,
    /// Allowed result types; `None` allows any
    pub types: Option<Vec<LiteralType>>,
    /// Allowed values of enum / enumset results
    pub enum_value_ids: Option<Vec<String>>,
    /// Required id-table of id results
    pub id_table: Option<String>,
    pub aggr_statuses: Vec<AggrStatus>,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            table: None,
            types: None,
            enum_value_ids: None,
            id_table: None,
            aggr_statuses: vec![AggrStatus::Individual, AggrStatus::Literal],
        }
    }
}

impl CleanOptions {
    pub fn for_table(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Default::default()
        }
    }

    pub fn with_types(mut self, types: Vec<LiteralType>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_aggr_statuses(mut self, statuses: Vec<AggrStatus>) -> Self {
        self.aggr_statuses = statuses;
        self
    }

    pub fn with_enum_value_ids(mut self, ids: Vec<String>) -> Self {
        self.enum_value_ids = Some(ids);
        self
    }

    pub fn with_id_table(mut self, id_table: impl Into<String>) -> Self {
        self.id_table = Some(id_table.into());
        self
    }

    fn allows(&self, status: AggrStatus) -> bool {
        self.aggr_statuses.contains(&status)
    }
}

pub struct ExprCleaner<'a> {
    utils: ExprUtils<'a>,
}

impl<'a> ExprCleaner<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            utils: ExprUtils::new(schema),
        }
    }

    pub fn with_variables(schema: &'a Schema, variables: &'a [Variable]) -> Self {
        Self {
            utils: ExprUtils::with_variables(schema, variables),
        }
    }

    pub fn utils(&self) -> &ExprUtils<'a> {
        &self.utils
    }

    /// Clean `expr` for the context described by `options`
    pub fn clean(&self, expr: Option<&Expr>, options: &CleanOptions) -> Option<Expr> {
        self.clean_at(expr?, options, 0)
    }

    fn clean_opt(&self, expr: Option<&Expr>, options: &CleanOptions, depth: usize) -> Option<Expr> {
        self.clean_at(expr?, options, depth)
    }

    fn clean_at(&self, expr: &Expr, options: &CleanOptions, depth: usize) -> Option<Expr> {
        if depth > MAX_DEPTH {
            log::warn!("expression nesting exceeds {} levels, dropping it", MAX_DEPTH);
            return None;
        }

        if expr.is_legacy() {
            let upgraded = upgrade_legacy(expr)?;
            return self.clean_at(&upgraded, options, depth + 1);
        }

        if let Some(table) = expr.table() {
            if options.table.as_deref().is_some_and(|expected| expected != table) {
                return None;
            }
            self.utils.schema().get_table(table)?;
        }

        if let Expr::Scalar(scalar) = expr {
            if scalar.joins.is_empty() {
                return self.clean_scalar(scalar, options, depth);
            }
        }

        let status = match self.utils.aggr_status_at(expr, depth) {
            Ok(status) => status,
            Err(err) => {
                log::debug!("dropping expression: {}", err);
                return None;
            }
        };

        if status == AggrStatus::Individual
            && options.allows(AggrStatus::Aggregate)
            && !options.allows(AggrStatus::Individual)
        {
            if let Some(wrapped) = self.aggregate(expr, options) {
                return self.clean_at(&wrapped, options, depth + 1);
            }
        }

        if !options.allows(status) {
            return None;
        }

        if options.types.as_deref() == Some(&[LiteralType::Boolean]) {
            let expr_type = self.utils.get_expr_type(Some(expr));
            if expr_type.is_some_and(|t| t != LiteralType::Boolean) {
                if let Some(wrapped) = self.booleanize(expr) {
                    return self.clean_at(&wrapped, options, depth + 1);
                }
            }
        }

        let cleaned = match expr {
            Expr::Field(field) => self.clean_field(field, options, depth),
            Expr::Op(op) => self.clean_op(op, options, depth),
            Expr::Scalar(scalar) => self.clean_scalar(scalar, options, depth),
            Expr::Literal(lit) => clean_literal(lit, options),
            Expr::Case(case) => self.clean_case(case, options, depth),
            Expr::Score(score) => self.clean_score(score, options, depth),
            Expr::BuildEnumset(build) => self.clean_build_enumset(build, options, depth),
            Expr::Id(id) => match &options.id_table {
                Some(id_table) if id_table != &id.table => None,
                _ => Some(expr.clone()),
            },
            Expr::Variable(var) => {
                let variable = self.utils.get_variable(&var.variable_id)?;
                match (&options.id_table, &variable.id_table) {
                    (Some(expected), Some(found)) if expected != found => None,
                    _ => Some(expr.clone()),
                }
            }
            Expr::Extension(ext) => self.clean_extension(ext, options),
            Expr::Comparison(_) | Expr::Logical(_) | Expr::Count(_) => None,
        }?;

        // The result of a rewrite must satisfy the same context
        if let Some(err) = check_context(&self.utils, &cleaned, options, depth) {
            log::debug!("dropping cleaned {} expression: {}", cleaned.kind(), err);
            return None;
        }
        Some(cleaned)
    }

    /// Wrap a per-row expression in an aggregate producing an allowed type
    fn aggregate(&self, expr: &Expr, options: &CleanOptions) -> Option<Expr> {
        let table = expr.table().map(str::to_string).or_else(|| options.table.clone());
        let ordered_filter = (!self.table_has_ordering(table.as_deref())).then_some(false);

        let item = self
            .utils
            .find_matching_op_items(OpFilter {
                result_types: options.types.as_deref(),
                lhs_expr: Some(expr),
                aggr: Some(true),
                ordered: ordered_filter,
                ..Default::default()
            })
            .into_iter()
            .find(|item| item.lhs_type().is_some());

        if let Some(item) = item {
            log::debug!("wrapping {} expression in {}", expr.kind(), item.op);
            return Some(Expr::op(table.as_deref(), item.op, padded(expr, item)));
        }

        // Fall back to the percentage of rows where a boolean holds
        if options.types.as_ref().is_some_and(|types| types.contains(&LiteralType::Number)) {
            let condition = match self.utils.get_expr_type(Some(expr)) {
                Some(LiteralType::Boolean) => expr.clone(),
                _ => self.booleanize(expr)?,
            };
            log::debug!("wrapping {} expression in percent where", expr.kind());
            return Some(Expr::op(table.as_deref(), "percent where", vec![Some(condition), None]));
        }
        None
    }

    /// Wrap a non-boolean expression in the first boolean test accepting it
    fn booleanize(&self, expr: &Expr) -> Option<Expr> {
        let item = self
            .utils
            .find_matching_op_items(OpFilter {
                result_types: Some(&[LiteralType::Boolean]),
                lhs_expr: Some(expr),
                aggr: Some(false),
                ordered: Some(false),
                ..Default::default()
            })
            .into_iter()
            .find(|item| item.lhs_type().is_some())?;

        log::debug!("booleanizing {} expression with {}", expr.kind(), item.op);
        Some(Expr::op(expr.table(), item.op, padded(expr, item)))
    }

    fn table_has_ordering(&self, table: Option<&str>) -> bool {
        table
            .and_then(|t| self.utils.schema().get_table(t))
            .is_some_and(|t| t.ordering.is_some())
    }

    fn clean_field(&self, field: &FieldExpr, options: &CleanOptions, depth: usize) -> Option<Expr> {
        let column = self.utils.schema().get_column(&field.table, &field.column)?;

        // A computed column is only usable if its own expression is
        if column.column_type == ColumnType::Expr {
            let column_options = CleanOptions {
                table: Some(field.table.clone()),
                aggr_statuses: AggrStatus::all(),
                ..Default::default()
            };
            self.clean_opt(column.expr.as_ref(), &column_options, depth + 1)?;
        }

        if let (Some(ids), Some(values)) = (&options.enum_value_ids, &column.enum_values) {
            if values.iter().any(|v| !ids.contains(&v.id)) {
                return None;
            }
        }

        Some(Expr::Field(field.clone()))
    }

    fn clean_scalar(&self, scalar: &ScalarExpr, options: &CleanOptions, depth: usize) -> Option<Expr> {
        let joins = normalize_join_ids(&scalar.joins);
        if !self.utils.are_joins_valid(&scalar.table, &joins) {
            return None;
        }
        let inner_table = self.utils.follow_joins(&scalar.table, &joins)?;

        let inner = match &scalar.aggr {
            Some(aggr) => Some(legacy_scalar_inner(
                aggr,
                scalar.expr.as_deref(),
                scalar.where_.as_deref(),
                Some(&inner_table),
            )),
            None => scalar.expr.as_deref().cloned(),
        };

        if joins.is_empty() {
            return self.clean_opt(inner.as_ref(), options, depth + 1);
        }

        // Following one join to read the id is just the join column
        if joins.len() == 1 && matches!(inner, Some(Expr::Id(_))) {
            return self.clean_at(&Expr::field(scalar.table.clone(), joins[0].clone()), options, depth + 1);
        }

        let inner_statuses = if self.utils.is_multiple_joins(&scalar.table, &joins) {
            vec![AggrStatus::Literal, AggrStatus::Aggregate]
        } else {
            vec![AggrStatus::Literal, AggrStatus::Individual]
        };
        let inner_options = CleanOptions {
            table: Some(inner_table),
            aggr_statuses: inner_statuses,
            ..options.clone()
        };

        let expr = match &inner {
            Some(inner) => Some(Box::new(self.clean_at(inner, &inner_options, depth + 1)?)),
            None => None,
        };

        Some(Expr::Scalar(ScalarExpr {
            table: scalar.table.clone(),
            joins,
            expr,
            aggr: None,
            where_: None,
        }))
    }

    fn clean_case(&self, case: &CaseExpr, options: &CleanOptions, depth: usize) -> Option<Expr> {
        if case.cases.is_empty() {
            return self.clean_opt(case.else_.as_deref(), options, depth + 1);
        }

        let when_options = boolean_options(options, case.table.as_deref());
        let cases = case
            .cases
            .iter()
            .map(|item| CaseItem {
                when: self.clean_opt(item.when.as_ref(), &when_options, depth + 1),
                then: self.clean_opt(item.then.as_ref(), options, depth + 1),
            })
            .collect();

        Some(Expr::Case(CaseExpr {
            table: case.table.clone(),
            cases,
            else_: self.clean_opt(case.else_.as_deref(), options, depth + 1).map(Box::new),
        }))
    }

    fn clean_score(&self, score: &ScoreExpr, options: &CleanOptions, depth: usize) -> Option<Expr> {
        let input_options = CleanOptions {
            table: score.table.clone().or_else(|| options.table.clone()),
            types: Some(vec![LiteralType::Enum, LiteralType::Enumset]),
            aggr_statuses: options.aggr_statuses.clone(),
            ..Default::default()
        };
        let input = self.clean_opt(score.input.as_deref(), &input_options, depth + 1);

        let mut scores = IndexMap::new();
        if let Some(input) = &input {
            let domain = self.utils.get_expr_enum_values(Some(input));
            let number_options = CleanOptions {
                types: Some(vec![LiteralType::Number]),
                ..input_options.clone()
            };
            for (key, value) in &score.scores {
                if domain.as_ref().is_some_and(|values| !values.iter().any(|v| &v.id == key)) {
                    continue;
                }
                if let Some(cleaned) = self.clean_opt(value.as_ref(), &number_options, depth + 1) {
                    scores.insert(key.clone(), Some(cleaned));
                }
            }
        }

        Some(Expr::Score(ScoreExpr {
            table: score.table.clone(),
            input: input.map(Box::new),
            scores,
        }))
    }

    fn clean_build_enumset(&self, build: &BuildEnumsetExpr, options: &CleanOptions, depth: usize) -> Option<Expr> {
        let value_options = boolean_options(options, build.table.as_deref());
        let values = build
            .values
            .iter()
            .filter(|(key, _)| options.enum_value_ids.as_ref().map_or(true, |ids| ids.contains(key)))
            .filter_map(|(key, value)| {
                self.clean_opt(value.as_ref(), &value_options, depth + 1)
                    .map(|cleaned| (key.clone(), Some(cleaned)))
            })
            .collect();

        Some(Expr::BuildEnumset(BuildEnumsetExpr {
            table: build.table.clone(),
            values,
        }))
    }

    fn clean_extension(&self, ext: &ExtensionExpr, options: &CleanOptions) -> Option<Expr> {
        match get_extension(&ext.extension) {
            Ok(handler) => handler.clean(ext, self, options),
            Err(err) => {
                log::warn!("{}", err);
                None
            }
        }
    }
}

fn clean_literal(lit: &LiteralExpr, options: &CleanOptions) -> Option<Expr> {
    let mut lit = lit.clone();

    if let Some(ids) = &options.enum_value_ids {
        match (lit.value_type, &lit.value) {
            (LiteralType::Enum, Value::String(id)) if !ids.contains(id) => return None,
            // Enumsets keep the values that are still allowed
            (LiteralType::Enumset, Value::Array(items)) => {
                let kept = items
                    .iter()
                    .filter(|v| v.as_str().is_some_and(|s| ids.iter().any(|id| id == s)))
                    .cloned()
                    .collect();
                lit.value = Value::Array(kept);
            }
            _ => {}
        }
    }

    if let Some(expected) = &options.id_table {
        if matches!(lit.value_type, LiteralType::Id | LiteralType::IdArray) && lit.id_table.as_ref() != Some(expected) {
            return None;
        }
    }

    Some(Expr::Literal(lit))
}

/// Operand list of `item` with `lhs` first and the rest empty
fn padded(lhs: &Expr, item: &operator::OpItem) -> Vec<Option<Expr>> {
    let mut exprs = vec![Some(lhs.clone())];
    exprs.resize(item.expr_types.len().max(1), None);
    exprs
}

/// Strip the legacy `entities.<table>.` qualification from join column ids
pub(crate) fn normalize_join_ids(joins: &[String]) -> Vec<String> {
    joins.iter().map(|id| normalize_join_id(id)).collect()
}

fn normalize_join_id(id: &str) -> String {
    if let Some((table, column)) = id.strip_prefix("entities.").and_then(|rest| rest.split_once('.')) {
        let plain = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_';
        if !table.is_empty() && table.chars().all(plain) {
            return column.to_string();
        }
    }
    id.to_string()
}

/// Inner expression of a legacy scalar carrying `aggr` (and possibly
/// `where`) as an explicit aggregate op
pub(crate) fn legacy_scalar_inner(
    aggr: &str,
    inner: Option<&Expr>,
    where_: Option<&Expr>,
    table: Option<&str>,
) -> Expr {
    let filtered = format!("{} where", aggr);
    match (aggr, where_) {
        ("count", Some(cond)) => Expr::op(table, "count where", vec![Some(cond.clone())]),
        ("count", None) => Expr::op(table, "count", vec![]),
        (_, Some(cond)) if operator::is_known_op(&filtered) => {
            Expr::op(table, filtered, vec![inner.cloned(), Some(cond.clone())])
        }
        (_, _) => Expr::op(table, aggr, vec![inner.cloned()]),
    }
}
