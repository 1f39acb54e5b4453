//! Expression validation.
//!
//! [`ExprValidator`] mirrors the cleaner without rewriting anything: it walks
//! the tree and reports the first problem as a [`ValidationError`] whose
//! message is short and stable. Results for whole expressions are memoized
//! in a process-wide concurrent cache.

use crate::cleaner::CleanOptions;
use crate::expression::{
    operator, upgrade_legacy, AggrStatus, Expr, ExtensionExpr, FieldExpr, InferenceError, LiteralExpr,
    LiteralType, OpExpr, ScalarExpr, MAX_DEPTH,
};
use crate::extension::{get_extension, ExtensionError};
use crate::inference::{ExprUtils, OpFilter};
use crate::schema::{ColumnType, Schema, Variable};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;

/// Validation takes the same constraints as cleaning
pub type ValidateOptions = CleanOptions;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("wrong table {found} (expected {expected})")]
    WrongTable { expected: String, found: String },

    #[error("missing table {0}")]
    MissingTable(String),

    #[error("missing column {table}.{column}")]
    MissingColumn { table: String, column: String },

    #[error("no matching op {0}")]
    NoMatchingOp(String),

    #[error("missing operand for {0}")]
    MissingOperand(String),

    #[error("invalid joins")]
    InvalidJoins,

    #[error("unknown type")]
    UnknownType,

    #[error("wrong type {0}")]
    WrongType(LiteralType),

    #[error("invalid aggregation {}", .0.as_str())]
    InvalidAggregation(AggrStatus),

    #[error("invalid enum value {0}")]
    InvalidEnum(String),

    #[error("wrong id table {found} (expected {expected})")]
    WrongIdTable { expected: String, found: String },

    #[error("missing variable {0}")]
    MissingVariable(String),

    #[error("circular reference")]
    CircularReference,

    #[error("extension not found: {0}")]
    ExtensionNotFound(String),

    #[error("{0}")]
    Extension(String),
}

impl From<InferenceError> for ValidationError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::RecursionLimit => ValidationError::CircularReference,
            InferenceError::VariableNotFound(id) => ValidationError::MissingVariable(id),
            InferenceError::Extension(ExtensionError::NotFound(name)) => ValidationError::ExtensionNotFound(name),
            InferenceError::Extension(other) => ValidationError::Extension(other.to_string()),
        }
    }
}

/// (schema uid, variables hash, expression json, options json)
type CacheKey = (u64, u64, String, String);

static VALIDATION_CACHE: LazyLock<DashMap<CacheKey, Option<ValidationError>>> = LazyLock::new(DashMap::new);

/// Entries kept before the cache is reset
const VALIDATION_CACHE_CAPACITY: usize = 10_000;

/// Drop every memoized validation result
pub fn clear_validation_cache() {
    VALIDATION_CACHE.clear();
}

pub struct ExprValidator<'a> {
    utils: ExprUtils<'a>,
}

impl<'a> ExprValidator<'a> {
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

    /// First problem with `expr` under `options`, or `None` if it is valid.
    /// An absent expression is valid.
    pub fn validate(&self, expr: Option<&Expr>, options: &ValidateOptions) -> Option<ValidationError> {
        let expr = expr?;

        let key = match (serde_json::to_string(expr), serde_json::to_string(options)) {
            (Ok(expr_json), Ok(options_json)) => Some((
                self.utils.schema().uid(),
                crate::inference::variables_key(self.utils.variables()),
                expr_json,
                options_json,
            )),
            _ => None,
        };

        if let Some(key) = &key {
            if let Some(cached) = VALIDATION_CACHE.get(key) {
                return cached.clone();
            }
        }

        let result = self.validate_at(expr, options, 0);

        if let Some(key) = key {
            if VALIDATION_CACHE.len() >= VALIDATION_CACHE_CAPACITY {
                log::debug!("resetting validation cache");
                VALIDATION_CACHE.clear();
            }
            VALIDATION_CACHE.insert(key, result.clone());
        }
        result
    }

    fn validate_opt(&self, expr: Option<&Expr>, options: &ValidateOptions, depth: usize) -> Option<ValidationError> {
        self.validate_at(expr?, options, depth)
    }

    pub(crate) fn validate_at(&self, expr: &Expr, options: &ValidateOptions, depth: usize) -> Option<ValidationError> {
        if depth > MAX_DEPTH {
            return Some(ValidationError::CircularReference);
        }

        if expr.is_legacy() {
            return self.validate_opt(upgrade_legacy(expr).as_ref(), options, depth + 1);
        }

        if let Some(err) = check_context(&self.utils, expr, options, depth) {
            return Some(err);
        }

        match expr {
            Expr::Field(field) => self.validate_field(field, depth),
            Expr::Op(op) => self.validate_op(op, options, depth),
            Expr::Scalar(scalar) => self.validate_scalar(scalar, options, depth),
            Expr::Literal(lit) => validate_literal(lit, options),
            Expr::Case(case) => {
                let when_options = boolean_options(options, case.table.as_deref());
                for item in &case.cases {
                    if let Some(err) = self.validate_opt(item.when.as_ref(), &when_options, depth + 1) {
                        return Some(err);
                    }
                    if let Some(err) = self.validate_opt(item.then.as_ref(), options, depth + 1) {
                        return Some(err);
                    }
                }
                self.validate_opt(case.else_.as_deref(), options, depth + 1)
            }
            Expr::Score(score) => {
                let input_options = CleanOptions {
                    table: score.table.clone().or_else(|| options.table.clone()),
                    types: Some(vec![LiteralType::Enum, LiteralType::Enumset]),
                    aggr_statuses: options.aggr_statuses.clone(),
                    ..Default::default()
                };
                if let Some(err) = self.validate_opt(score.input.as_deref(), &input_options, depth + 1) {
                    return Some(err);
                }
                let domain = self.utils.get_expr_enum_values(score.input.as_deref());
                let number_options = CleanOptions {
                    types: Some(vec![LiteralType::Number]),
                    ..input_options
                };
                for (key, value) in &score.scores {
                    if let Some(values) = &domain {
                        if !values.iter().any(|v| &v.id == key) {
                            return Some(ValidationError::InvalidEnum(key.clone()));
                        }
                    }
                    if let Some(err) = self.validate_opt(value.as_ref(), &number_options, depth + 1) {
                        return Some(err);
                    }
                }
                None
            }
            Expr::BuildEnumset(build) => {
                let value_options = boolean_options(options, build.table.as_deref());
                for (key, value) in &build.values {
                    if let Some(ids) = &options.enum_value_ids {
                        if !ids.contains(key) {
                            return Some(ValidationError::InvalidEnum(key.clone()));
                        }
                    }
                    if let Some(err) = self.validate_opt(value.as_ref(), &value_options, depth + 1) {
                        return Some(err);
                    }
                }
                None
            }
            Expr::Id(_) => None,
            Expr::Variable(var) => match self.utils.get_variable(&var.variable_id) {
                Some(_) => None,
                None => Some(ValidationError::MissingVariable(var.variable_id.clone())),
            },
            Expr::Extension(ext) => self.validate_extension(ext, options),
            Expr::Comparison(_) | Expr::Logical(_) | Expr::Count(_) => None,
        }
    }

    fn validate_field(&self, field: &FieldExpr, depth: usize) -> Option<ValidationError> {
        let Some(column) = self.utils.schema().get_column(&field.table, &field.column) else {
            return Some(ValidationError::MissingColumn {
                table: field.table.clone(),
                column: field.column.clone(),
            });
        };

        if column.column_type == ColumnType::Expr {
            let column_options = CleanOptions {
                table: Some(field.table.clone()),
                aggr_statuses: AggrStatus::all(),
                ..Default::default()
            };
            return self.validate_opt(column.expr.as_ref(), &column_options, depth + 1);
        }
        None
    }

    fn validate_op(&self, op: &OpExpr, options: &ValidateOptions, depth: usize) -> Option<ValidationError> {
        let table = op.table.clone().or_else(|| options.table.clone());

        if let Some(operand_type) = variadic_operand_type(&op.op) {
            let operand_options = CleanOptions {
                table,
                types: Some(vec![operand_type]),
                aggr_statuses: options.aggr_statuses.clone(),
                ..Default::default()
            };
            return op
                .exprs
                .iter()
                .find_map(|e| self.validate_opt(e.as_ref(), &operand_options, depth + 1));
        }

        let inner_statuses = inner_aggr_statuses(&op.op, options);
        let lhs = op.exprs.first().and_then(Option::as_ref);
        let lhs_options = CleanOptions {
            table: table.clone(),
            aggr_statuses: inner_statuses.clone(),
            ..Default::default()
        };
        if let Some(err) = self.validate_opt(lhs, &lhs_options, depth + 1) {
            return Some(err);
        }

        if lhs.is_none() && !operator::is_op_prefix(&op.op) {
            return Some(ValidationError::MissingOperand(op.op.clone()));
        }

        let items = self.utils.find_matching_op_items(OpFilter {
            op: Some(&op.op),
            lhs_expr: lhs,
            result_types: options.types.as_deref(),
            ordered: Some(self.table_has_ordering(table.as_deref())).filter(|ordered| !ordered),
            ..Default::default()
        });
        if items.is_empty() {
            return Some(ValidationError::NoMatchingOp(op.op.clone()));
        }

        for (i, operand) in op.exprs.iter().enumerate().skip(1) {
            let operand_options = operand_options(&self.utils, &items, i, lhs, table.clone(), &inner_statuses);
            if let Some(err) = self.validate_opt(operand.as_ref(), &operand_options, depth + 1) {
                return Some(err);
            }
        }
        None
    }

    fn validate_scalar(&self, scalar: &ScalarExpr, options: &ValidateOptions, depth: usize) -> Option<ValidationError> {
        let joins = crate::cleaner::normalize_join_ids(&scalar.joins);
        if !self.utils.are_joins_valid(&scalar.table, &joins) {
            return Some(ValidationError::InvalidJoins);
        }
        let Some(inner_table) = self.utils.follow_joins(&scalar.table, &joins) else {
            return Some(ValidationError::InvalidJoins);
        };

        let inner_statuses = if joins.is_empty() {
            options.aggr_statuses.clone()
        } else if self.utils.is_multiple_joins(&scalar.table, &joins) {
            vec![AggrStatus::Literal, AggrStatus::Aggregate]
        } else {
            vec![AggrStatus::Literal, AggrStatus::Individual]
        };
        let inner_options = CleanOptions {
            table: Some(inner_table),
            aggr_statuses: inner_statuses,
            ..options.clone()
        };

        let inner = match (&scalar.aggr, scalar.expr.as_deref()) {
            (Some(aggr), inner) => Some(crate::cleaner::legacy_scalar_inner(
                aggr,
                inner,
                scalar.where_.as_deref(),
                inner_options.table.as_deref(),
            )),
            (None, inner) => inner.cloned(),
        };
        self.validate_opt(inner.as_ref(), &inner_options, depth + 1)
    }

    fn validate_extension(&self, ext: &ExtensionExpr, options: &ValidateOptions) -> Option<ValidationError> {
        match get_extension(&ext.extension) {
            Ok(handler) => handler.validate(ext, self, options).map(ValidationError::Extension),
            Err(_) => Some(ValidationError::ExtensionNotFound(ext.extension.clone())),
        }
    }

    fn table_has_ordering(&self, table: Option<&str>) -> bool {
        table
            .and_then(|t| self.utils.schema().get_table(t))
            .is_some_and(|t| t.ordering.is_some())
    }
}

fn validate_literal(lit: &LiteralExpr, options: &ValidateOptions) -> Option<ValidationError> {
    if let Some(ids) = &options.enum_value_ids {
        match (lit.value_type, &lit.value) {
            (LiteralType::Enum, Value::String(id)) if !ids.contains(id) => {
                return Some(ValidationError::InvalidEnum(id.clone()));
            }
            (LiteralType::Enumset, _) => {
                if let Some(bad) = lit.string_items().into_iter().find(|id| !ids.contains(id)) {
                    return Some(ValidationError::InvalidEnum(bad));
                }
            }
            _ => {}
        }
    }
    None
}

/// `and`/`or` take booleans, `+`/`*` take numbers, any count of them
pub(crate) fn variadic_operand_type(op: &str) -> Option<LiteralType> {
    match op {
        "and" | "or" => Some(LiteralType::Boolean),
        "+" | "*" => Some(LiteralType::Number),
        _ => None,
    }
}

/// Operands of an aggregate are per-row values; otherwise the outer
/// statuses apply
pub(crate) fn inner_aggr_statuses(op: &str, options: &CleanOptions) -> Vec<AggrStatus> {
    if operator::is_op_aggr(op) {
        vec![AggrStatus::Literal, AggrStatus::Individual]
    } else {
        options.aggr_statuses.clone()
    }
}

pub(crate) fn boolean_options(options: &CleanOptions, table: Option<&str>) -> CleanOptions {
    CleanOptions {
        table: table.map(str::to_string).or_else(|| options.table.clone()),
        types: Some(vec![LiteralType::Boolean]),
        aggr_statuses: options.aggr_statuses.clone(),
        ..Default::default()
    }
}

/// Constraints for the operand at `index` of an op matched by `items`:
/// the union of declared types at that position, plus the left operand's
/// enum domain and id-table where the position shares its type.
pub(crate) fn operand_options(
    utils: &ExprUtils<'_>,
    items: &[&operator::OpItem],
    index: usize,
    lhs: Option<&Expr>,
    table: Option<String>,
    aggr_statuses: &[AggrStatus],
) -> CleanOptions {
    let mut types: Vec<LiteralType> = Vec::new();
    let mut unrestricted = false;
    for item in items {
        match item.operand_type(index) {
            Some(t) if !types.contains(&t) => types.push(t),
            Some(_) => {}
            None => unrestricted = true,
        }
    }

    let enum_value_ids = if types.iter().any(|t| matches!(t, LiteralType::Enum | LiteralType::Enumset)) {
        utils
            .get_expr_enum_values(lhs)
            .map(|values| values.into_iter().map(|v| v.id).collect())
    } else {
        None
    };
    let id_table = if types.iter().any(|t| matches!(t, LiteralType::Id | LiteralType::IdArray)) {
        utils.get_expr_id_table(lhs)
    } else {
        None
    };

    CleanOptions {
        table,
        types: if unrestricted || types.is_empty() { None } else { Some(types) },
        enum_value_ids,
        id_table,
        aggr_statuses: aggr_statuses.to_vec(),
    }
}

/// Checks of a node against its context that do not recurse into children:
/// owning table, aggregation status, result type, id-table and enum domain.
pub(crate) fn check_context(
    utils: &ExprUtils<'_>,
    expr: &Expr,
    options: &CleanOptions,
    depth: usize,
) -> Option<ValidationError> {
    if let Some(table) = expr.table() {
        if let Some(expected) = &options.table {
            if table != expected {
                return Some(ValidationError::WrongTable {
                    expected: expected.clone(),
                    found: table.to_string(),
                });
            }
        }
        if utils.schema().get_table(table).is_none() {
            return Some(ValidationError::MissingTable(table.to_string()));
        }
    }

    match utils.aggr_status_at(expr, depth) {
        Ok(status) if !options.aggr_statuses.contains(&status) => {
            return Some(ValidationError::InvalidAggregation(status));
        }
        Ok(_) => {}
        Err(err) => return Some(err.into()),
    }

    if let Some(types) = &options.types {
        if !matches!(expr, Expr::Case(_)) {
            match utils.get_expr_type(Some(expr)) {
                Some(t) if !types.contains(&t) => return Some(ValidationError::WrongType(t)),
                Some(_) => {}
                // Ambiguous ops are kept while their operands are filled in
                None if matches!(expr, Expr::Op(_)) => {}
                None => return Some(ValidationError::UnknownType),
            }
        }
    }

    if let Some(expected) = &options.id_table {
        if let Some(found) = utils.get_expr_id_table(Some(expr)) {
            if &found != expected {
                return Some(ValidationError::WrongIdTable {
                    expected: expected.clone(),
                    found,
                });
            }
        }
    }

    if let Some(ids) = &options.enum_value_ids {
        if let Some(values) = utils.get_expr_enum_values(Some(expr)) {
            if let Some(bad) = values.into_iter().find(|v| !ids.contains(&v.id)) {
                return Some(ValidationError::InvalidEnum(bad.id));
            }
        }
    }

    None
}
