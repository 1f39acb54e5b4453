//! Aggregates over the per-row values of their operands.
//!
//! Callers evaluate each operand once per context row; `columns[i][r]` is
//! operand `i` on row `r`. An absent operand has an empty column.

use super::ops::{as_f64, compare_values, is_true, number};
use super::{EvalError, EvalResult};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

static EMPTY: Vec<Value> = Vec::new();

pub(super) fn aggregate(op: &str, columns: &[Vec<Value>], row_count: usize) -> EvalResult<Value> {
    let column = |i: usize| columns.get(i).unwrap_or(&EMPTY);
    let values = column(0);
    let numbers = || values.iter().filter_map(as_f64);

    let value = match op {
        "count" => Value::from(row_count),
        "sum" => {
            let mut numbers = numbers().peekable();
            match numbers.peek() {
                Some(_) => number(numbers.sum()),
                None => Value::Null,
            }
        }
        "avg" => {
            let (total, n) = numbers().fold((0.0, 0usize), |(t, n), x| (t + x, n + 1));
            if n == 0 {
                Value::Null
            } else {
                number(total / n as f64)
            }
        }
        "min" | "max" => {
            let pick = if op == "min" { Ordering::Less } else { Ordering::Greater };
            values
                .iter()
                .filter(|v| !v.is_null())
                .fold(None::<&Value>, |best, v| match best {
                    Some(b) if compare_values(v, b) != Some(pick) => Some(b),
                    _ => Some(v),
                })
                .cloned()
                .unwrap_or(Value::Null)
        }
        "count distinct" => {
            let distinct: HashSet<String> = values
                .iter()
                .filter(|v| !v.is_null())
                .map(Value::to_string)
                .collect();
            Value::from(distinct.len())
        }
        "array_agg" if values.is_empty() => Value::Null,
        "array_agg" => Value::Array(values.clone()),
        "count where" if values.is_empty() => Value::from(row_count),
        "count where" => Value::from(values.iter().filter(|v| is_true(v)).count()),
        "sum where" => {
            let conditions = column(1);
            let total = values
                .iter()
                .enumerate()
                .filter(|(r, _)| conditions.is_empty() || conditions.get(*r).is_some_and(is_true))
                .filter_map(|(_, v)| as_f64(v))
                .sum();
            number(total)
        }
        "percent where" if values.is_empty() => Value::Null,
        "percent where" => {
            let bases = column(1);
            let in_base = |r: usize| bases.is_empty() || bases.get(r).is_some_and(is_true);
            let denominator = (0..row_count).filter(|r| in_base(*r)).count();
            let numerator = (0..row_count)
                .filter(|r| in_base(*r) && values.get(*r).is_some_and(is_true))
                .count();
            if denominator == 0 {
                Value::Null
            } else {
                number(numerator as f64 * 100.0 / denominator as f64)
            }
        }
        _ => return Err(EvalError::UnknownOp(op.to_string())),
    };
    Ok(value)
}

/// Row indices sorted the way `last`/`first`/`previous` pick their value:
/// rows meeting the condition first, then non-null values, then by ordering
/// (descending unless `ascending`) with null orderings last
fn ordered_rows(values: &[Value], conditions: Option<&[Value]>, orderings: &[Value], ascending: bool) -> Vec<usize> {
    let key = |r: usize| {
        let unmet = conditions.is_some_and(|c| !c.get(r).is_some_and(is_true));
        let missing = unmet || values.get(r).map_or(true, Value::is_null);
        (unmet, missing)
    };
    let mut rows: Vec<usize> = (0..values.len()).collect();
    rows.sort_by(|&x, &y| {
        key(x).cmp(&key(y)).then_with(|| {
            let (ox, oy) = (&orderings[x], &orderings[y]);
            match (ox.is_null(), oy.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => {
                    let order = compare_values(ox, oy).unwrap_or(Ordering::Equal);
                    if ascending {
                        order
                    } else {
                        order.reverse()
                    }
                }
            }
        })
    });
    rows
}

/// Value picked by an ordered aggregate; `orderings[r]` is the ordering
/// column of row `r`
pub(super) fn ordered(op: &str, values: &[Value], conditions: Option<&[Value]>, orderings: &[Value]) -> Value {
    let ascending = matches!(op, "first" | "first where");
    let position = if op == "previous" { 1 } else { 0 };
    let rows = ordered_rows(values, conditions, orderings, ascending);
    rows.get(position)
        .filter(|&&r| conditions.map_or(true, |c| c.get(r).is_some_and(is_true)))
        .and_then(|&r| values.get(r))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Primary keys of the latest row (by ordering) of each partition, among
/// rows meeting the condition
pub(super) fn latest_keys(
    keys: &[Value],
    partitions: &[Value],
    conditions: Option<&[Value]>,
    orderings: &[Value],
) -> Vec<Value> {
    let mut latest: Vec<(String, usize)> = Vec::new();
    for r in 0..keys.len() {
        if conditions.is_some_and(|c| !c.get(r).is_some_and(is_true)) {
            continue;
        }
        let partition = partitions.get(r).map(Value::to_string).unwrap_or_default();
        match latest.iter_mut().find(|(p, _)| *p == partition) {
            Some((_, best)) => {
                if compare_values(&orderings[r], &orderings[*best]) == Some(Ordering::Greater) {
                    *best = r;
                }
            }
            None => latest.push((partition, r)),
        }
    }
    latest.into_iter().map(|(_, r)| keys[r].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn column(values: &[Value]) -> Vec<Value> {
        values.to_vec()
    }

    #[test]
    fn test_ordered_picks() {
        let orderings = column(&[json!(3), json!(4), json!(1), json!(2)]);
        let values = column(&[json!(10), json!(20), json!(30), json!(40)]);
        assert_eq!(ordered("last", &values, None, &orderings), json!(20));
        assert_eq!(ordered("first", &values, None, &orderings), json!(30));
        assert_eq!(ordered("previous", &values, None, &orderings), json!(10));
    }

    #[test]
    fn test_ordered_skips_nulls_and_unmet_rows() {
        let orderings = column(&[json!(1), json!(2), json!(3)]);
        let values = column(&[json!("a"), json!("b"), Value::Null]);
        assert_eq!(ordered("last", &values, None, &orderings), json!("b"));

        let conditions = column(&[json!(true), json!(false), json!(true)]);
        assert_eq!(ordered("last where", &values, Some(&conditions), &orderings), json!("a"));
        let none = column(&[json!(false), json!(false), json!(false)]);
        assert_eq!(ordered("first where", &values, Some(&none), &orderings), Value::Null);
    }

    #[test]
    fn test_aggregates() {
        let values = column(&[json!(1), Value::Null, json!(3)]);
        assert_eq!(aggregate("sum", &[values.clone()], 3).unwrap(), json!(4.0));
        assert_eq!(aggregate("avg", &[values.clone()], 3).unwrap(), json!(2.0));
        assert_eq!(aggregate("max", &[values.clone()], 3).unwrap(), json!(3));
        assert_eq!(aggregate("count", &[], 3).unwrap(), json!(3));
        assert_eq!(aggregate("sum", &[column(&[Value::Null])], 1).unwrap(), Value::Null);

        let flags = column(&[json!(true), json!(false), json!(true), Value::Null]);
        assert_eq!(aggregate("count where", &[flags.clone()], 4).unwrap(), json!(2));
        assert_eq!(aggregate("percent where", &[flags], 4).unwrap(), json!(50.0));

        let repeated = column(&[json!("a"), json!("b"), json!("a"), Value::Null]);
        assert_eq!(aggregate("count distinct", &[repeated], 4).unwrap(), json!(2));
    }

    #[test]
    fn test_latest_keys() {
        let keys = column(&[json!("r1"), json!("r2"), json!("r3")]);
        let partitions = column(&[json!("x"), json!("x"), json!("y")]);
        let orderings = column(&[json!(2), json!(1), json!(5)]);
        assert_eq!(
            latest_keys(&keys, &partitions, None, &orderings),
            vec![json!("r1"), json!("r3")]
        );
        let conditions = column(&[json!(false), json!(true), json!(true)]);
        assert_eq!(
            latest_keys(&keys, &partitions, Some(&conditions), &orderings),
            vec![json!("r2"), json!("r3")]
        );
    }
}
