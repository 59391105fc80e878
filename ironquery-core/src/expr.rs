// src/expr.rs
//! Expression trees evaluated against a single record
//!
//! Expressions are plain data: callers build them directly with the
//! constructor helpers or parse MongoDB-style JSON with [`Expr::from_json`].
//!
//! Numeric policy:
//! - Int op Int stays Int (overflow promotes to Float)
//! - anything involving a Float is Float
//! - Null operands propagate to a Null result
//! - `$avg`/`$sum`/`$min`/`$max` over arrays skip non-numeric elements
//! - `$divide` by zero yields Null

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::error::{QueryError, Result};
use crate::path::FieldPath;
use crate::value::{total_cmp, Record, Value};
use crate::log_warn;

/// Accepted range for `$round` places
pub const MIN_ROUND_PLACES: i32 = -20;
pub const MAX_ROUND_PLACES: i32 = 100;

/// From 2^52 on every f64 is integral, so there is nothing left to round
const ROUNDING_LIMIT: f64 = 4_503_599_627_370_496.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(FieldPath),
    /// Array literal whose elements are expressions
    Array(Vec<Expr>),
    /// Record literal whose fields are expressions
    Record(BTreeMap<String, Expr>),
    IfNull(Box<Expr>, Box<Expr>),
    Avg(Box<Expr>),
    Sum(Box<Expr>),
    Min(Box<Expr>),
    Max(Box<Expr>),
    /// Round to `places` decimal digits, half away from zero
    Round(Box<Expr>, i32),
    Size(Box<Expr>),
    Add(Vec<Expr>),
    Subtract(Box<Expr>, Box<Expr>),
    Multiply(Vec<Expr>),
    Divide(Box<Expr>, Box<Expr>),
    Concat(Vec<Expr>),
}

impl Expr {
    pub fn field(path: &str) -> Expr {
        Expr::Field(FieldPath::from(path))
    }

    pub fn literal(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn if_null(expr: Expr, default: Expr) -> Expr {
        Expr::IfNull(Box::new(expr), Box::new(default))
    }

    pub fn avg(expr: Expr) -> Expr {
        Expr::Avg(Box::new(expr))
    }

    pub fn sum(expr: Expr) -> Expr {
        Expr::Sum(Box::new(expr))
    }

    /// `places` is clamped to the range the parser accepts
    pub fn round(expr: Expr, places: i32) -> Expr {
        Expr::Round(Box::new(expr), places.clamp(MIN_ROUND_PLACES, MAX_ROUND_PLACES))
    }

    pub fn size(expr: Expr) -> Expr {
        Expr::Size(Box::new(expr))
    }

    /// Evaluate against a record
    pub fn evaluate(&self, record: &Record) -> Result<Value> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Field(path) => Ok(path.resolve(record)),
            Expr::Array(items) => items
                .iter()
                .map(|item| item.evaluate(record))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Record(fields) => {
                let mut out = Record::new();
                for (name, expr) in fields {
                    out.insert(name.clone(), expr.evaluate(record)?);
                }
                Ok(Value::Record(out))
            }
            Expr::IfNull(expr, default) => match expr.evaluate(record)? {
                Value::Null => default.evaluate(record),
                value => Ok(value),
            },
            Expr::Avg(expr) => Ok(average(&expr.evaluate(record)?)),
            Expr::Sum(expr) => Ok(sum(&expr.evaluate(record)?)),
            Expr::Min(expr) => Ok(extremum(expr.evaluate(record)?, |o| o.is_lt())),
            Expr::Max(expr) => Ok(extremum(expr.evaluate(record)?, |o| o.is_gt())),
            Expr::Round(expr, places) => round(&expr.evaluate(record)?, *places),
            Expr::Size(expr) => match expr.evaluate(record)? {
                Value::Array(items) => Ok(Value::Int(items.len() as i64)),
                other => Err(QueryError::type_mismatch("$size", "array", other.type_name())),
            },
            Expr::Add(items) => fold_numeric("$add", items, record, Value::Int(0), checked_add),
            Expr::Multiply(items) => {
                fold_numeric("$multiply", items, record, Value::Int(1), checked_mul)
            }
            Expr::Subtract(left, right) => {
                let (l, r) = (left.evaluate(record)?, right.evaluate(record)?);
                if l.is_null() || r.is_null() {
                    return Ok(Value::Null);
                }
                let negated = match r {
                    Value::Int(n) => n.checked_neg().map(Value::Int).unwrap_or(Value::Float(-(n as f64))),
                    Value::Float(f) => Value::Float(-f),
                    other => {
                        return Err(QueryError::type_mismatch("$subtract", "number", other.type_name()))
                    }
                };
                numeric_pair("$subtract", &l, &negated, checked_add)
            }
            Expr::Divide(left, right) => {
                let (l, r) = (left.evaluate(record)?, right.evaluate(record)?);
                if l.is_null() || r.is_null() {
                    return Ok(Value::Null);
                }
                let (x, y) = (number("$divide", &l)?, number("$divide", &r)?);
                if y == 0.0 {
                    return Ok(Value::Null);
                }
                Ok(Value::Float(x / y))
            }
            Expr::Concat(items) => {
                let mut out = String::new();
                for item in items {
                    match item.evaluate(record)? {
                        Value::Null => return Ok(Value::Null),
                        Value::String(s) => out.push_str(&s),
                        other => {
                            return Err(QueryError::type_mismatch("$concat", "string", other.type_name()))
                        }
                    }
                }
                Ok(Value::String(out))
            }
        }
    }

    /// Evaluate a derived field, turning recoverable failures into Null
    ///
    /// `TypeMismatch` is contained to the field being computed; any other
    /// error is returned.
    pub fn evaluate_or_null(&self, record: &Record, field: &FieldPath) -> Result<Value> {
        match self.evaluate(record) {
            Err(err) if err.is_recoverable() => {
                log_warn!("Field '{}' set to null: {}", field, err);
                Ok(Value::Null)
            }
            other => other,
        }
    }

    /// Parse a MongoDB-style aggregation expression
    ///
    /// - `"$a.b"` is a field reference
    /// - `{"$op": args}` is an operator; unknown names fail with `UnknownOperator`
    /// - `{"k": expr, ...}` is a record literal
    /// - arrays are array literals of expressions
    /// - everything else is a literal
    pub fn from_json(json: &JsonValue) -> Result<Expr> {
        match json {
            JsonValue::String(s) if s.starts_with('$') => {
                Ok(Expr::Field(FieldPath::from_reference(s)?))
            }
            JsonValue::Array(items) => Ok(Expr::Array(
                items.iter().map(Expr::from_json).collect::<Result<Vec<_>>>()?,
            )),
            JsonValue::Object(map) => {
                let operator_keys = map.keys().filter(|k| k.starts_with('$')).count();
                if operator_keys == 0 {
                    let mut fields = BTreeMap::new();
                    for (name, value) in map {
                        fields.insert(name.clone(), Expr::from_json(value)?);
                    }
                    return Ok(Expr::Record(fields));
                }
                if map.len() == 1 && map.contains_key("$date") {
                    return Ok(Expr::Literal(Value::from_json(json)));
                }
                match map.iter().next() {
                    Some((op, args)) if map.len() == 1 => parse_operator(op, args),
                    _ => Err(QueryError::InvalidQuery(
                        "Expression object must have exactly one operator".to_string(),
                    )),
                }
            }
            other => Ok(Expr::Literal(Value::from_json(other))),
        }
    }
}

fn parse_operator(op: &str, args: &JsonValue) -> Result<Expr> {
    match op {
        "$literal" => Ok(Expr::Literal(Value::from_json(args))),
        "$ifNull" => {
            let [expr, default] = fixed_args::<2>(op, args)?;
            Ok(Expr::if_null(Expr::from_json(expr)?, Expr::from_json(default)?))
        }
        "$avg" => Ok(Expr::Avg(Box::new(Expr::from_json(args)?))),
        "$sum" => Ok(Expr::Sum(Box::new(Expr::from_json(args)?))),
        "$min" => Ok(Expr::Min(Box::new(Expr::from_json(args)?))),
        "$max" => Ok(Expr::Max(Box::new(Expr::from_json(args)?))),
        "$round" => match args {
            JsonValue::Array(items) if items.len() == 2 => {
                let places = items[1]
                    .as_i64()
                    .filter(|p| (i64::from(MIN_ROUND_PLACES)..=i64::from(MAX_ROUND_PLACES)).contains(p))
                    .ok_or_else(|| {
                        QueryError::Config(format!(
                            "$round places must be an integer in {}..={}, got {}",
                            MIN_ROUND_PLACES, MAX_ROUND_PLACES, items[1]
                        ))
                    })?;
                Ok(Expr::round(Expr::from_json(&items[0])?, places as i32))
            }
            JsonValue::Array(items) if items.len() == 1 => Ok(Expr::round(Expr::from_json(&items[0])?, 0)),
            JsonValue::Array(_) => Err(QueryError::InvalidQuery(
                "$round takes [expression, places]".to_string(),
            )),
            other => Ok(Expr::round(Expr::from_json(other)?, 0)),
        },
        "$size" => match args {
            JsonValue::Array(items) if items.len() == 1 => Ok(Expr::size(Expr::from_json(&items[0])?)),
            other => Ok(Expr::size(Expr::from_json(other)?)),
        },
        "$add" => Ok(Expr::Add(variadic_args(op, args)?)),
        "$multiply" => Ok(Expr::Multiply(variadic_args(op, args)?)),
        "$concat" => Ok(Expr::Concat(variadic_args(op, args)?)),
        "$subtract" => {
            let [left, right] = fixed_args::<2>(op, args)?;
            Ok(Expr::Subtract(
                Box::new(Expr::from_json(left)?),
                Box::new(Expr::from_json(right)?),
            ))
        }
        "$divide" => {
            let [left, right] = fixed_args::<2>(op, args)?;
            Ok(Expr::Divide(
                Box::new(Expr::from_json(left)?),
                Box::new(Expr::from_json(right)?),
            ))
        }
        _ => Err(QueryError::UnknownOperator(op.to_string())),
    }
}

fn fixed_args<'a, const N: usize>(op: &str, args: &'a JsonValue) -> Result<[&'a JsonValue; N]> {
    let items = args
        .as_array()
        .filter(|items| items.len() == N)
        .ok_or_else(|| QueryError::InvalidQuery(format!("{} requires an array of {} arguments", op, N)))?;
    Ok(std::array::from_fn(|i| &items[i]))
}

fn variadic_args(op: &str, args: &JsonValue) -> Result<Vec<Expr>> {
    args.as_array()
        .ok_or_else(|| QueryError::InvalidQuery(format!("{} requires an array", op)))?
        .iter()
        .map(Expr::from_json)
        .collect()
}

fn number(op: &'static str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| QueryError::type_mismatch(op, "number", value.type_name()))
}

/// Numeric elements of an array value, or the value itself when numeric
fn numeric_elements(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().filter(|v| v.is_number()).collect(),
        v if v.is_number() => vec![v],
        _ => Vec::new(),
    }
}

/// Mean of the numeric elements; Null when there are none
pub(crate) fn average(value: &Value) -> Value {
    let nums = numeric_elements(value);
    if nums.is_empty() {
        return Value::Null;
    }
    let total: f64 = nums.iter().filter_map(|v| v.as_f64()).sum();
    Value::Float(total / nums.len() as f64)
}

/// Sum of the numeric elements; Int 0 when there are none
pub(crate) fn sum(value: &Value) -> Value {
    numeric_elements(value)
        .into_iter()
        .fold(Value::Int(0), |acc, v| checked_add(&acc, v))
}

fn extremum(value: Value, wins: impl Fn(std::cmp::Ordering) -> bool) -> Value {
    let candidates: Vec<Value> = match value {
        Value::Array(items) => items.into_iter().filter(|v| !v.is_null()).collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    };
    candidates
        .into_iter()
        .reduce(|best, v| if wins(total_cmp(&v, &best)) { v } else { best })
        .unwrap_or(Value::Null)
}

/// Round half away from zero at `places` decimal digits
///
/// Computed on f64 as `(x * 10^places).round() / 10^places`; `f64::round`
/// rounds half away from zero. Negative `places` round to tens, hundreds...
/// Ints are returned unchanged for `places >= 0`. A float that is already
/// exact at that precision (the scaled value is integral or overflows) is
/// returned unchanged. `places` is clamped like [`Expr::round`].
pub fn round(value: &Value, places: i32) -> Result<Value> {
    let places = places.clamp(MIN_ROUND_PLACES, MAX_ROUND_PLACES);
    match value {
        Value::Null => Ok(Value::Null),
        Value::Int(n) if places >= 0 => Ok(Value::Int(*n)),
        Value::Int(n) => {
            let factor = 10f64.powi(-places);
            Ok(Value::Int(((*n as f64 / factor).round() * factor) as i64))
        }
        Value::Float(f) if !f.is_finite() => Ok(Value::Float(*f)),
        Value::Float(f) => {
            let rounded = if places >= 0 {
                let scaled = f * 10f64.powi(places);
                if !scaled.is_finite() || scaled.abs() >= ROUNDING_LIMIT {
                    return Ok(Value::Float(*f));
                }
                scaled.round() / 10f64.powi(places)
            } else {
                let factor = 10f64.powi(-places);
                (f / factor).round() * factor
            };
            Ok(Value::Float(if rounded.is_finite() { rounded } else { *f }))
        }
        other => Err(QueryError::type_mismatch("$round", "number", other.type_name())),
    }
}

pub(crate) fn checked_add(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x
            .checked_add(*y)
            .map(Value::Int)
            .unwrap_or(Value::Float(*x as f64 + *y as f64)),
        _ => Value::Float(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
    }
}

fn checked_mul(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x
            .checked_mul(*y)
            .map(Value::Int)
            .unwrap_or(Value::Float(*x as f64 * *y as f64)),
        _ => Value::Float(a.as_f64().unwrap_or(0.0) * b.as_f64().unwrap_or(0.0)),
    }
}

fn numeric_pair(op: &'static str, a: &Value, b: &Value, combine: fn(&Value, &Value) -> Value) -> Result<Value> {
    number(op, a)?;
    number(op, b)?;
    Ok(combine(a, b))
}

fn fold_numeric(
    op: &'static str,
    items: &[Expr],
    record: &Record,
    init: Value,
    combine: fn(&Value, &Value) -> Value,
) -> Result<Value> {
    let mut acc = init;
    for item in items {
        let value = item.evaluate(record)?;
        if value.is_null() {
            return Ok(Value::Null);
        }
        acc = numeric_pair(op, &acc, &value, combine)?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::record_from_json;
    use serde_json::json;

    fn rec(json: JsonValue) -> Record {
        record_from_json(&json).unwrap()
    }

    fn eval(expr: JsonValue, doc: JsonValue) -> Result<Value> {
        Expr::from_json(&expr)?.evaluate(&rec(doc))
    }

    #[test]
    fn test_field_reference_missing_is_null() {
        assert_eq!(eval(json!("$nope"), json!({"a": 1})).unwrap(), Value::Null);
    }

    #[test]
    fn test_avg_over_array_path() {
        let doc = json!({"reviews": [{"rating": 5}, {"rating": 3}]});
        let v = eval(json!({"$avg": "$reviews.rating"}), doc).unwrap();
        assert!(matches!(v, Value::Float(f) if f == 4.0));
    }

    #[test]
    fn test_avg_skips_non_numeric() {
        let doc = json!({"xs": [4, "five", null, 6, true]});
        assert_eq!(eval(json!({"$avg": "$xs"}), doc).unwrap(), Value::Float(5.0));
    }

    #[test]
    fn test_avg_empty_or_missing_is_null() {
        assert_eq!(eval(json!({"$avg": "$xs"}), json!({"xs": []})).unwrap(), Value::Null);
        assert_eq!(eval(json!({"$avg": "$xs"}), json!({})).unwrap(), Value::Null);
        assert_eq!(eval(json!({"$avg": "$xs"}), json!({"xs": ["a"]})).unwrap(), Value::Null);
    }

    #[test]
    fn test_if_null() {
        let expr = json!({"$ifNull": ["$reviews", []]});
        assert_eq!(eval(expr.clone(), json!({})).unwrap(), Value::Array(vec![]));
        assert_eq!(
            eval(expr, json!({"reviews": [1]})).unwrap(),
            Value::Array(vec![Value::Int(1)])
        );
    }

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round(&Value::Float(2.5), 0).unwrap(), Value::Float(3.0));
        assert_eq!(round(&Value::Float(-2.5), 0).unwrap(), Value::Float(-3.0));
        assert_eq!(round(&Value::Float(4.333333), 2).unwrap(), Value::Float(4.33));
        assert_eq!(round(&Value::Float(1.005e3), -1).unwrap(), Value::Float(1010.0));
        assert_eq!(round(&Value::Int(1234), -2).unwrap(), Value::Int(1200));
        assert_eq!(round(&Value::Int(7), 2).unwrap(), Value::Int(7));
        assert_eq!(round(&Value::Null, 2).unwrap(), Value::Null);
    }

    #[test]
    fn test_round_string_is_type_mismatch() {
        let err = eval(json!({"$round": ["$name", 2]}), json!({"name": "x"})).unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch { operator: "$round", .. }));
    }

    #[test]
    fn test_round_places_validated() {
        let err = Expr::from_json(&json!({"$round": ["$x", "two"]})).unwrap_err();
        assert!(matches!(err, QueryError::Config(_)));
        assert!(Expr::from_json(&json!({"$round": ["$x", 101]})).is_err());
    }

    #[test]
    fn test_round_large_values_stay_finite() {
        let v = eval(json!({"$round": ["$x", 100]}), json!({"x": 1e300})).unwrap();
        assert_eq!(v, Value::Float(1e300));

        let v = eval(json!({"$round": ["$x", 3]}), json!({"x": 123456789012345678.0})).unwrap();
        assert_eq!(v, Value::Float(123456789012345678.0));

        assert!(matches!(round(&Value::Float(f64::MAX), -20).unwrap(), Value::Float(f) if f.is_finite()));
    }

    #[test]
    fn test_round_places_clamped_for_builders() {
        assert_eq!(round(&Value::Float(1.25), 400).unwrap(), Value::Float(1.25));
        assert_eq!(round(&Value::Float(1.25), -400).unwrap(), Value::Float(0.0));
        assert_eq!(Expr::round(Expr::field("x"), 400), Expr::round(Expr::field("x"), MAX_ROUND_PLACES));

        let v = Expr::round(Expr::literal(2.675), 1000)
            .evaluate(&Record::new())
            .unwrap();
        assert_eq!(v, Value::Float(2.675));
    }

    #[test]
    fn test_arithmetic_int_and_float() {
        let doc = json!({"a": 6, "b": 4, "c": 1.5});
        assert_eq!(eval(json!({"$add": ["$a", "$b"]}), doc.clone()).unwrap(), Value::Int(10));
        assert!(matches!(eval(json!({"$add": ["$a", "$c"]}), doc.clone()).unwrap(), Value::Float(f) if f == 7.5));
        assert_eq!(eval(json!({"$subtract": ["$a", "$b"]}), doc.clone()).unwrap(), Value::Int(2));
        assert_eq!(eval(json!({"$multiply": ["$a", "$b"]}), doc.clone()).unwrap(), Value::Int(24));
        assert_eq!(eval(json!({"$divide": ["$a", "$b"]}), doc.clone()).unwrap(), Value::Float(1.5));
        assert_eq!(eval(json!({"$divide": ["$a", 0]}), doc).unwrap(), Value::Null);
    }

    #[test]
    fn test_arithmetic_overflow_promotes() {
        let doc = json!({"a": i64::MAX});
        let v = eval(json!({"$add": ["$a", 1]}), doc).unwrap();
        assert!(matches!(v, Value::Float(_)));
    }

    #[test]
    fn test_arithmetic_on_string_is_type_mismatch() {
        let err = eval(json!({"$add": ["$name", 1]}), json!({"name": "x"})).unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch { operator: "$add", found: "string", .. }));
    }

    #[test]
    fn test_null_propagates_through_arithmetic() {
        assert_eq!(eval(json!({"$add": ["$missing", 1]}), json!({})).unwrap(), Value::Null);
    }

    #[test]
    fn test_size_and_concat() {
        let doc = json!({"tags": ["a", "b"], "first": "Ada", "last": "L"});
        assert_eq!(eval(json!({"$size": "$tags"}), doc.clone()).unwrap(), Value::Int(2));
        assert_eq!(
            eval(json!({"$concat": ["$first", " ", "$last"]}), doc.clone()).unwrap(),
            Value::from("Ada L")
        );
        assert!(eval(json!({"$size": "$first"}), doc).is_err());
    }

    #[test]
    fn test_min_max_sum_over_arrays() {
        let doc = json!({"xs": [3, 9, null, 1]});
        assert_eq!(eval(json!({"$min": "$xs"}), doc.clone()).unwrap(), Value::Int(1));
        assert_eq!(eval(json!({"$max": "$xs"}), doc.clone()).unwrap(), Value::Int(9));
        assert_eq!(eval(json!({"$sum": "$xs"}), doc).unwrap(), Value::Int(13));
    }

    #[test]
    fn test_record_and_array_literals() {
        let doc = json!({"a": 1, "b": "x"});
        let v = eval(json!({"pair": ["$a", "$b"], "k": {"$literal": "$a"}}), doc).unwrap();
        assert_eq!(v, Value::from_json(&json!({"pair": [1, "x"], "k": "$a"})));
    }

    #[test]
    fn test_unknown_operator() {
        let err = Expr::from_json(&json!({"$frobnicate": 1})).unwrap_err();
        assert!(matches!(err, QueryError::UnknownOperator(ref op) if op == "$frobnicate"));
    }

    #[test]
    fn test_mixed_operator_object_rejected() {
        let err = Expr::from_json(&json!({"$add": [1], "x": 2})).unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery(_)));
    }
}
