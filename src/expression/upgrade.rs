//! Conversion of legacy expression variants into their current forms.

use crate::expression::{ComparisonExpr, CountExpr, Expr, LiteralExpr, LiteralType, LogicalExpr};
use serde_json::Value;

/// Upgrade a legacy node (`comparison`, `logical`, `count`) to `op` / `id`.
///
/// Non-legacy nodes are returned unchanged.
pub fn upgrade_legacy(expr: &Expr) -> Option<Expr> {
    match expr {
        Expr::Comparison(cmp) => upgrade_comparison(cmp),
        Expr::Logical(logical) => Some(upgrade_logical(logical)),
        Expr::Count(count) => Some(upgrade_count(count)),
        other => Some(other.clone()),
    }
}

fn upgrade_comparison(cmp: &ComparisonExpr) -> Option<Expr> {
    let lhs = cmp.lhs.as_deref().cloned();
    let rhs = cmp.rhs.as_deref().cloned();
    let table = Some(cmp.table.as_str());

    match cmp.op.as_str() {
        // A boolean compared to true is just the boolean
        "= true" => lhs,
        "between" => {
            // Old date ranges carried both bounds in one two-element literal
            let (low, high) = match &rhs {
                Some(Expr::Literal(LiteralExpr {
                    value: Value::Array(bounds),
                    value_type,
                    ..
                })) => {
                    let bound_type = match value_type {
                        LiteralType::Datetime => LiteralType::Datetime,
                        _ => LiteralType::Date,
                    };
                    let bound = |i: usize| {
                        bounds
                            .get(i)
                            .filter(|v| !v.is_null())
                            .map(|v| Expr::literal(bound_type, v.clone()))
                    };
                    (bound(0), bound(1))
                }
                _ => (None, None),
            };
            Some(Expr::op(table, "between", vec![lhs, low, high]))
        }
        op => {
            let mut exprs = vec![lhs];
            if rhs.is_some() {
                exprs.push(rhs);
            }
            Some(Expr::op(table, op, exprs))
        }
    }
}

fn upgrade_logical(logical: &LogicalExpr) -> Expr {
    Expr::op(Some(&logical.table), logical.op.clone(), logical.exprs.clone())
}

fn upgrade_count(count: &CountExpr) -> Expr {
    Expr::id(count.table.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upgrade_comparison() {
        let legacy: Expr = serde_json::from_value(json!({
            "type": "comparison",
            "table": "t1",
            "op": "=",
            "lhs": { "type": "field", "table": "t1", "column": "number" },
            "rhs": { "type": "literal", "valueType": "integer", "value": 3 }
        }))
        .unwrap();
        let upgraded = upgrade_legacy(&legacy).unwrap();
        assert_eq!(
            upgraded,
            Expr::op(
                Some("t1"),
                "=",
                vec![
                    Some(Expr::field("t1", "number")),
                    Some(Expr::literal(LiteralType::Number, json!(3)))
                ]
            )
        );
    }

    #[test]
    fn test_upgrade_unary_comparison_and_true() {
        let legacy = Expr::Comparison(ComparisonExpr {
            table: "t1".into(),
            op: "is null".into(),
            lhs: Some(Box::new(Expr::field("t1", "text"))),
            rhs: None,
        });
        match upgrade_legacy(&legacy).unwrap() {
            Expr::Op(op) => {
                assert_eq!(op.op, "is null");
                assert_eq!(op.exprs.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let legacy = Expr::Comparison(ComparisonExpr {
            table: "t1".into(),
            op: "= true".into(),
            lhs: Some(Box::new(Expr::field("t1", "boolean"))),
            rhs: None,
        });
        assert_eq!(upgrade_legacy(&legacy), Some(Expr::field("t1", "boolean")));
    }

    #[test]
    fn test_upgrade_date_range() {
        let legacy = Expr::Comparison(ComparisonExpr {
            table: "t1".into(),
            op: "between".into(),
            lhs: Some(Box::new(Expr::field("t1", "date"))),
            rhs: Some(Box::new(Expr::literal(
                LiteralType::Date,
                json!(["2020-01-01", "2020-12-31"]),
            ))),
        });
        match upgrade_legacy(&legacy).unwrap() {
            Expr::Op(op) => {
                assert_eq!(op.exprs.len(), 3);
                assert_eq!(op.exprs[1], Some(Expr::date("2020-01-01")));
                assert_eq!(op.exprs[2], Some(Expr::date("2020-12-31")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_upgrade_logical_and_count() {
        let legacy = Expr::Logical(LogicalExpr {
            table: "t1".into(),
            op: "and".into(),
            exprs: vec![Some(Expr::field("t1", "boolean"))],
        });
        assert_eq!(
            upgrade_legacy(&legacy),
            Some(Expr::op(Some("t1"), "and", vec![Some(Expr::field("t1", "boolean"))]))
        );
        assert_eq!(
            upgrade_legacy(&Expr::Count(CountExpr { table: "t1".into() })),
            Some(Expr::id("t1"))
        );
    }
}
