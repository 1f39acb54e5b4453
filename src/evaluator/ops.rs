//! Non-aggregate operators over JSON values.
//!
//! Null handling mirrors the compiled SQL: comparisons with a null side are
//! null, `and`/`or` are three-valued, `+`/`*` treat null as their identity.

use super::{EvalError, EvalResult};
use crate::compiler::{parse_date_value, relative_window};
use crate::expression::operator::RELATIVE_DATE_OPS;
use crate::expression::LiteralType;
use crate::schema::EnumValue;
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use regex::RegexBuilder;
use serde_json::Value;
use std::cmp::Ordering;

/// Mean earth radius used by `distance` and `line length`, in meters
const EARTH_RADIUS: f64 = 6370986.0;

static NULL: Value = Value::Null;

/// What an operator may need beyond its operand values
pub(super) struct OpEnv<'a> {
    pub now: DateTime<Utc>,
    pub lhs_type: Option<LiteralType>,
    pub enum_values: Option<&'a [EnumValue]>,
    pub locale: Option<&'a str>,
}

pub(super) fn apply_op(op: &str, args: &[Value], env: &OpEnv<'_>) -> EvalResult<Value> {
    let arg = |i: usize| args.get(i).unwrap_or(&NULL);
    let a = arg(0);
    let b = arg(1);

    if RELATIVE_DATE_OPS.iter().any(|(relative, _)| *relative == op) {
        return Ok(relative_date(op, a, env));
    }

    let value = match op {
        "and" => three_valued(args, false),
        "or" => three_valued(args, true),
        "not" => Value::Bool(a != &Value::Bool(true)),

        "+" | "*" => {
            if args.is_empty() {
                Value::Null
            } else if op == "+" {
                number(args.iter().filter_map(as_f64).sum())
            } else {
                number(args.iter().filter_map(as_f64).product())
            }
        }
        "-" => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => number(x - y),
            _ => Value::Null,
        },
        "/" => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) if y != 0.0 => number(x / y),
            _ => Value::Null,
        },
        "round" => as_f64(a).map_or(Value::Null, |x| number(x.round())),
        "floor" => as_f64(a).map_or(Value::Null, |x| number(x.floor())),
        "ceiling" => as_f64(a).map_or(Value::Null, |x| number(x.ceil())),
        "least" | "greatest" => {
            let pick = if op == "least" { Ordering::Less } else { Ordering::Greater };
            args.iter()
                .filter(|v| !v.is_null())
                .fold(None::<&Value>, |best, v| match best {
                    Some(b) if compare_values(v, b) != Some(pick) => Some(b),
                    _ => Some(v),
                })
                .cloned()
                .unwrap_or(Value::Null)
        }

        "=" | "<>" | ">" | "<" | ">=" | "<=" => {
            if a.is_null() || b.is_null() {
                Value::Null
            } else {
                compare(op, a, b)
            }
        }
        "= false" => match a {
            Value::Bool(v) => Value::Bool(!v),
            _ => Value::Null,
        },
        "~*" => match (a, b) {
            (Value::String(text), Value::String(pattern)) => {
                match RegexBuilder::new(pattern).case_insensitive(true).build() {
                    Ok(re) => Value::Bool(re.is_match(text)),
                    Err(e) => {
                        log::debug!("invalid pattern {}: {}", pattern, e);
                        Value::Null
                    }
                }
            }
            _ => Value::Null,
        },
        "between" => {
            let lo = arg(1);
            let hi = arg(2);
            if a.is_null() || (lo.is_null() && hi.is_null()) {
                Value::Null
            } else {
                let above = lo.is_null() || compare_values(a, lo).is_some_and(|o| o != Ordering::Less);
                let below = hi.is_null() || compare_values(a, hi).is_some_and(|o| o != Ordering::Greater);
                Value::Bool(above && below)
            }
        }
        "is null" => Value::Bool(a.is_null()),
        "is not null" => Value::Bool(!a.is_null()),

        "= any" => match (a, b) {
            (_, Value::Array(items)) if items.is_empty() => Value::Bool(false),
            (Value::Null, _) => Value::Null,
            (value, Value::Array(items)) => Value::Bool(items.contains(value)),
            _ => Value::Null,
        },
        "contains" => match (a, b) {
            (_, Value::Array(wanted)) if wanted.is_empty() => Value::Null,
            (Value::Array(items), Value::Array(wanted)) => Value::Bool(wanted.iter().all(|w| items.contains(w))),
            _ => Value::Null,
        },
        "intersects" => match (a, b) {
            (_, Value::Array(wanted)) if wanted.is_empty() => Value::Bool(false),
            (Value::Array(items), Value::Array(wanted)) => Value::Bool(wanted.iter().any(|w| items.contains(w))),
            _ => Value::Null,
        },
        "includes" => match (a, b) {
            (_, Value::Null) => Value::Null,
            (Value::Array(items), value) => Value::Bool(items.contains(value)),
            _ => Value::Null,
        },
        "length" => match a {
            Value::Array(items) => Value::from(items.len()),
            _ => Value::from(0),
        },
        "to text" => to_text(a, env),

        "month" => date_part(a, |d| format!("{:02}", d.month())),
        "yearmonth" => date_part(a, |d| format!("{:04}-{:02}-01", d.year(), d.month())),
        "year" => date_part(a, |d| format!("{:04}-01-01", d.year())),
        "weekofmonth" => date_part(a, |d| ((d.day() - 1) / 7 + 1).to_string()),
        "dayofmonth" => date_part(a, |d| format!("{:02}", d.day())),
        "to date" => date_part(a, |d| d.format("%Y-%m-%d").to_string()),
        "days difference" => difference(a, b, env, 1.0),
        "months difference" => difference(a, b, env, 30.5),
        "years difference" => difference(a, b, env, 365.0),
        "days since" => {
            let now = Value::String(now_value(env));
            difference(&now, a, env, 1.0)
        }
        "current date" => Value::String(env.now.format("%Y-%m-%d").to_string()),
        "current datetime" => Value::String(env.now.to_rfc3339()),

        "latitude" => centroid(a).map_or(Value::Null, |(_, lat)| number(lat)),
        "longitude" => centroid(a).map_or(Value::Null, |(lng, _)| number(lng)),
        "distance" => match (centroid(a), centroid(b)) {
            (Some(from), Some(to)) => number(haversine(from, to)),
            _ => Value::Null,
        },
        "line length" => line_length(a).map_or(Value::Null, number),

        _ => return Err(EvalError::UnknownOp(op.to_string())),
    };
    Ok(value)
}

/// `and` when `dominant` is false, `or` when true
fn three_valued(args: &[Value], dominant: bool) -> Value {
    if args.is_empty() {
        return Value::Null;
    }
    let mut unknown = false;
    for value in args {
        match value {
            Value::Bool(b) if *b == dominant => return Value::Bool(dominant),
            Value::Bool(_) => {}
            _ => unknown = true,
        }
    }
    if unknown {
        Value::Null
    } else {
        Value::Bool(!dominant)
    }
}

pub(super) fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

pub(super) fn number(value: f64) -> Value {
    Value::from(value)
}

pub(super) fn is_true(value: &Value) -> bool {
    value == &Value::Bool(true)
}

/// Order of two non-null values of the same kind; dates compare as strings
pub(super) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => (a == b).then_some(Ordering::Equal),
    }
}

fn compare(op: &str, a: &Value, b: &Value) -> Value {
    let ordering = compare_values(a, b);
    let result = match op {
        "=" => ordering == Some(Ordering::Equal),
        "<>" => ordering != Some(Ordering::Equal),
        ">" => ordering == Some(Ordering::Greater),
        "<" => ordering == Some(Ordering::Less),
        ">=" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        _ => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    };
    Value::Bool(result)
}

fn is_datetime(value: &Value, env: &OpEnv<'_>) -> bool {
    match env.lhs_type {
        Some(LiteralType::Datetime) => true,
        Some(LiteralType::Date) => false,
        _ => value.as_str().is_some_and(|s| s.len() > 10),
    }
}

fn now_value(env: &OpEnv<'_>) -> String {
    match env.lhs_type {
        Some(LiteralType::Datetime) => env.now.to_rfc3339(),
        _ => env.now.format("%Y-%m-%d").to_string(),
    }
}

fn relative_date(op: &str, value: &Value, env: &OpEnv<'_>) -> Value {
    let Some(at) = value.as_str().and_then(parse_date_value) else {
        return Value::Null;
    };
    match relative_window(op, env.now, is_datetime(value, env)) {
        Some(window) => Value::Bool(window.contains(at)),
        None => Value::Null,
    }
}

fn date_part(value: &Value, part: impl Fn(NaiveDateTime) -> String) -> Value {
    value
        .as_str()
        .and_then(parse_date_value)
        .map_or(Value::Null, |d| Value::String(part(d)))
}

/// `(a - b)` in days divided by `unit`; whole days for dates
fn difference(a: &Value, b: &Value, env: &OpEnv<'_>, unit: f64) -> Value {
    let (Some(x), Some(y)) = (a.as_str().and_then(parse_date_value), b.as_str().and_then(parse_date_value)) else {
        return Value::Null;
    };
    let days = if is_datetime(a, env) {
        (x - y).num_seconds() as f64 / 86400.0
    } else {
        (x.date() - y.date()).num_days() as f64
    };
    number(days / unit)
}

fn to_text(value: &Value, env: &OpEnv<'_>) -> Value {
    match (value, env.lhs_type) {
        (Value::Null, _) => Value::Null,
        (Value::String(id), Some(LiteralType::Enum)) => env
            .enum_values
            .and_then(|values| values.iter().find(|v| &v.id == id))
            .map_or(Value::Null, |v| Value::String(v.name.localize(env.locale).to_string())),
        (Value::Array(items), _) => Value::String(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
        ),
        (Value::String(s), _) => Value::String(s.clone()),
        (Value::Number(n), _) => match n.as_f64() {
            Some(x) if x.fract() == 0.0 && x.abs() < 1e15 => Value::String(format!("{}", x as i64)),
            _ => Value::String(n.to_string()),
        },
        (other, _) => Value::String(other.to_string()),
    }
}

/// Every `[lng, lat]` pair of a GeoJSON geometry
fn positions(value: &Value, out: &mut Vec<(f64, f64)>) {
    match value {
        Value::Array(items) => match (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
            (Some(lng), Some(lat)) => out.push((lng, lat)),
            _ => items.iter().for_each(|item| positions(item, out)),
        },
        Value::Object(map) => {
            if let Some(coordinates) = map.get("coordinates") {
                positions(coordinates, out);
            } else if let Some(geometries) = map.get("geometries") {
                positions(geometries, out);
            }
        }
        _ => {}
    }
}

/// Mean position of a geometry's vertices
fn centroid(value: &Value) -> Option<(f64, f64)> {
    let mut points = Vec::new();
    positions(value, &mut points);
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (lng, lat) = points.iter().fold((0.0, 0.0), |(x, y), (lng, lat)| (x + lng, y + lat));
    Some((lng / n, lat / n))
}

fn haversine((lng1, lat1): (f64, f64), (lng2, lat2): (f64, f64)) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS * h.sqrt().asin()
}

fn line_length(value: &Value) -> Option<f64> {
    let lines: Vec<&Value> = match value.get("type").and_then(Value::as_str)? {
        "LineString" => vec![value.get("coordinates")?],
        "MultiLineString" => value.get("coordinates")?.as_array()?.iter().collect(),
        _ => return Some(0.0),
    };
    let mut total = 0.0;
    for line in lines {
        let mut points = Vec::new();
        positions(line, &mut points);
        total += points.windows(2).map(|w| haversine(w[0], w[1])).sum::<f64>();
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn env() -> OpEnv<'static> {
        OpEnv {
            now: Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap(),
            lhs_type: None,
            enum_values: None,
            locale: None,
        }
    }

    fn apply(op: &str, args: &[Value]) -> Value {
        apply_op(op, args, &env()).unwrap()
    }

    #[test]
    fn test_arithmetic_nulls() {
        assert_eq!(apply("+", &[json!(3), Value::Null]), json!(3.0));
        assert_eq!(apply("*", &[json!(3), Value::Null, json!(2)]), json!(6.0));
        assert_eq!(apply("-", &[json!(3), Value::Null]), Value::Null);
        assert_eq!(apply("/", &[json!(3), json!(0)]), Value::Null);
        assert_eq!(apply("/", &[json!(3), Value::Null]), Value::Null);
        assert_eq!(apply("/", &[json!(3), json!(2)]), json!(1.5));
        assert_eq!(apply("greatest", &[json!(3), Value::Null, json!(7)]), json!(7));
    }

    #[test]
    fn test_logic() {
        assert_eq!(apply("and", &[json!(true), Value::Null]), Value::Null);
        assert_eq!(apply("and", &[json!(false), Value::Null]), json!(false));
        assert_eq!(apply("or", &[json!(true), Value::Null]), json!(true));
        assert_eq!(apply("not", &[Value::Null]), json!(true));
        assert_eq!(apply("=", &[json!(1), Value::Null]), Value::Null);
        assert_eq!(apply("=", &[json!(1), json!(1.0)]), json!(true));
        assert_eq!(apply("between", &[json!(5), json!(1), Value::Null]), json!(true));
        assert_eq!(apply("~*", &[json!("Hello"), json!("^hel")]), json!(true));
    }

    #[test]
    fn test_set_ops() {
        assert_eq!(apply("contains", &[json!(["a", "b", "c"]), json!(["a", "b"])]), json!(true));
        assert_eq!(apply("contains", &[json!(["a", "b"]), json!(["a", "b", "c"])]), json!(false));
        assert_eq!(apply("= any", &[json!("a"), json!([])]), json!(false));
        assert_eq!(apply("intersects", &[json!(["a"]), json!(["b", "a"])]), json!(true));
        assert_eq!(apply("length", &[Value::Null]), json!(0));
    }

    #[test]
    fn test_dates() {
        assert_eq!(apply("thismonth", &[json!("2024-03-01")]), json!(true));
        assert_eq!(apply("lastmonth", &[json!("2024-03-01")]), json!(false));
        assert_eq!(apply("days difference", &[json!("2024-03-15"), json!("2024-03-01")]), json!(14.0));
        assert_eq!(apply("days since", &[json!("2024-03-14")]), json!(1.0));
        assert_eq!(apply("yearmonth", &[json!("2024-03-15")]), json!("2024-03-01"));
        assert_eq!(apply("weekofmonth", &[json!("2024-03-15")]), json!("3"));
    }

    #[test]
    fn test_geometry() {
        let a = json!({ "type": "Point", "coordinates": [0.0, 0.0] });
        let b = json!({ "type": "Point", "coordinates": [0.0, 1.0] });
        let distance = as_f64(&apply("distance", &[a, b])).unwrap();
        assert!((distance - 111_194.0).abs() < 100.0);
        let line = json!({ "type": "LineString", "coordinates": [[0.0, 0.0], [0.0, 1.0], [0.0, 2.0]] });
        assert!((as_f64(&apply("line length", &[line])).unwrap() - 2.0 * distance).abs() < 1.0);
    }

    #[test]
    fn test_unknown_op() {
        assert!(matches!(apply_op("frobnicate", &[], &env()), Err(EvalError::UnknownOp(_))));
    }
}
