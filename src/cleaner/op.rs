use crate::cleaner::{CleanOptions, ExprCleaner};
use crate::expression::operator::{self, OpItem};
use crate::expression::{Expr, LiteralType, OpExpr, MAX_DEPTH};
use crate::inference::OpFilter;
use crate::validator::{inner_aggr_statuses, operand_options, variadic_operand_type};

impl ExprCleaner<'_> {
    pub(super) fn clean_op(&self, op: &OpExpr, options: &CleanOptions, depth: usize) -> Option<Expr> {
        if depth > MAX_DEPTH {
            return None;
        }
        let table = op.table.clone().or_else(|| options.table.clone());

        if let Some(operand_type) = variadic_operand_type(&op.op) {
            return self.clean_variadic(op, operand_type, table, options, depth);
        }

        let inner_statuses = inner_aggr_statuses(&op.op, options);
        let loose = CleanOptions {
            table: table.clone(),
            aggr_statuses: inner_statuses.clone(),
            ..Default::default()
        };
        let loose_lhs = op
            .exprs
            .first()
            .and_then(|e| self.clean_opt(e.as_ref(), &loose, depth + 1));

        // Prefer a left operand the operator can take, else keep what we have
        let lhs = match (loose_lhs, lhs_types(&op.op)) {
            (Some(lhs), Some(types)) => {
                let strict = CleanOptions {
                    types: Some(types),
                    ..loose.clone()
                };
                Some(self.clean_at(&lhs, &strict, depth + 1).unwrap_or(lhs))
            }
            (lhs, _) => lhs,
        };

        if lhs.is_none() && !operator::is_op_prefix(&op.op) {
            return None;
        }

        let ordered = (!self.table_has_ordering(table.as_deref())).then_some(false);
        let items = self.utils.find_matching_op_items(OpFilter {
            op: Some(&op.op),
            lhs_expr: lhs.as_ref(),
            result_types: options.types.as_deref(),
            ordered,
            ..Default::default()
        });

        if items.is_empty() {
            return self.substitute_op(op, lhs?, options, ordered, depth);
        }

        let first = items[0];
        let resolved = items
            .iter()
            .all(|i| i.expr_types == first.expr_types && i.more_expr_type == first.more_expr_type);

        let mut exprs = op.exprs.clone();
        if resolved {
            let arity = match first.more_expr_type {
                Some(_) => exprs.len().max(first.expr_types.len()),
                None => first.expr_types.len(),
            };
            exprs.resize(arity, None);
        }
        if let Some(slot) = exprs.first_mut() {
            *slot = lhs.clone();
        }

        // An ambiguous op keeps every overload's operand types open
        let candidates: Vec<&OpItem> = if resolved { vec![first] } else { items };
        for (i, slot) in exprs.iter_mut().enumerate().skip(1) {
            let operand_options =
                operand_options(&self.utils, &candidates, i, lhs.as_ref(), table.clone(), &inner_statuses);
            *slot = self.clean_opt(slot.as_ref(), &operand_options, depth + 1);
        }

        Some(Expr::Op(OpExpr {
            table: op.table.clone(),
            op: op.op.clone(),
            exprs,
        }))
    }

    fn clean_variadic(
        &self,
        op: &OpExpr,
        operand_type: LiteralType,
        table: Option<String>,
        options: &CleanOptions,
        depth: usize,
    ) -> Option<Expr> {
        let operand_options = CleanOptions {
            table,
            types: Some(vec![operand_type]),
            aggr_statuses: options.aggr_statuses.clone(),
            ..Default::default()
        };
        let mut exprs: Vec<Option<Expr>> = op
            .exprs
            .iter()
            .map(|e| self.clean_opt(e.as_ref(), &operand_options, depth + 1))
            .collect();

        match exprs.len() {
            0 => None,
            1 => exprs.pop().flatten(),
            _ => Some(Expr::Op(OpExpr {
                table: op.table.clone(),
                op: op.op.clone(),
                exprs,
            })),
        }
    }

    /// Replace an operator that cannot take `lhs` with the first one of the
    /// same kind (aggregate or not) that can
    fn substitute_op(
        &self,
        op: &OpExpr,
        lhs: Expr,
        options: &CleanOptions,
        ordered: Option<bool>,
        depth: usize,
    ) -> Option<Expr> {
        let substitute = self
            .utils
            .find_matching_op_items(OpFilter {
                lhs_expr: Some(&lhs),
                result_types: options.types.as_deref(),
                aggr: Some(operator::is_op_aggr(&op.op)),
                ordered,
                ..Default::default()
            })
            .into_iter()
            .find(|item| item.lhs_type().is_some())?;

        log::debug!("substituting op {} for {}", substitute.op, op.op);
        let exprs = std::iter::once(Some(lhs))
            .chain(op.exprs.iter().skip(1).cloned())
            .collect();
        let replaced = OpExpr {
            table: op.table.clone(),
            op: substitute.op.to_string(),
            exprs,
        };
        self.clean_op(&replaced, options, depth + 1)
    }
}

/// Every type the operator accepts on the left, `None` if some overload
/// accepts anything
fn lhs_types(op: &str) -> Option<Vec<LiteralType>> {
    let mut types = Vec::new();
    for item in operator::op_items().iter().filter(|item| item.op == op) {
        let t = item.lhs_type()?;
        if !types.contains(&t) {
            types.push(t);
        }
    }
    (!types.is_empty()).then_some(types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::AggrStatus;
    use crate::schema::{Column, Schema, Table};

    #[test]
    fn test_lhs_types() {
        assert_eq!(lhs_types("sum"), Some(vec![LiteralType::Number]));
        assert_eq!(lhs_types("is null"), None);
        assert_eq!(lhs_types("count"), None);
        assert_eq!(lhs_types("frobnicate"), None);
    }

    #[test]
    fn test_ambiguous_op_is_kept() {
        let schema = Schema::new().add_table(
            Table::new("t1", "T1")
                .with_ordering("number")
                .with_column(Column::new("number", LiteralType::Number)),
        );
        let cleaner = ExprCleaner::new(&schema);
        let options = CleanOptions::for_table("t1").with_aggr_statuses(vec![AggrStatus::Aggregate]);
        let unresolved = Expr::op(Some("t1"), "last", vec![None]);
        assert_eq!(cleaner.clean(Some(&unresolved), &options), Some(unresolved.clone()));
    }
}
