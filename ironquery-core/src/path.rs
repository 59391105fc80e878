//! Dotted field paths
//!
//! Resolution rules:
//! - a segment applied to a record selects that field
//! - a numeric segment applied to an array selects that element
//! - any other segment applied to an array maps over the elements and
//!   yields an array of the resolved sub-values, skipping elements where
//!   the rest of the path is missing (`reviews.rating` -> `[5, 4, 3]`)
//! - anything else is missing

use std::fmt;

use crate::error::{QueryError, Result};
use crate::value::{Record, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse and validate a dotted path (`"reviews.rating"`)
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(QueryError::InvalidQuery("Field path cannot be empty".to_string()));
        }
        if path.starts_with('$') {
            return Err(QueryError::InvalidQuery(format!(
                "Field path '{}' cannot start with $",
                path
            )));
        }
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(QueryError::InvalidQuery(format!(
                "Field path '{}' has an empty segment",
                path
            )));
        }
        Ok(FieldPath { segments })
    }

    /// Parse a `"$field.path"` reference as used inside expressions
    pub fn from_reference(reference: &str) -> Result<Self> {
        match reference.strip_prefix('$') {
            Some(rest) if !rest.starts_with('$') => FieldPath::parse(rest),
            _ => Err(QueryError::InvalidQuery(format!(
                "'{}' is not a field reference",
                reference
            ))),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment, i.e. the top-level field name
    pub fn head(&self) -> &str {
        &self.segments[0]
    }

    pub fn is_simple(&self) -> bool {
        self.segments.len() == 1
    }

    /// Resolve against a record; `None` when the path is missing
    pub fn lookup(&self, record: &Record) -> Option<Value> {
        let (first, rest) = self.segments.split_first()?;
        lookup_in(record.get(first)?, rest)
    }

    /// Resolve against a record; missing paths resolve to Null
    pub fn resolve(&self, record: &Record) -> Value {
        self.lookup(record).unwrap_or(Value::Null)
    }

    /// Write `value` at this path, creating intermediate records
    ///
    /// Fails with `TypeMismatch` when an intermediate field exists but is
    /// not a record.
    pub fn assign(&self, record: &mut Record, value: Value) -> Result<()> {
        let (last, parents) = match self.segments.split_last() {
            Some(split) => split,
            None => return Ok(()),
        };

        let mut current = record;
        for part in parents {
            let slot = current
                .entry(part.clone())
                .or_insert_with(|| Value::Record(Record::new()));
            current = match slot {
                Value::Record(map) => map,
                other => {
                    return Err(QueryError::type_mismatch(
                        "field path",
                        "record",
                        other.type_name(),
                    ))
                }
            };
        }
        current.insert(last.clone(), value);
        Ok(())
    }

    /// Write `value` at this path, mapping over arrays met on the way
    ///
    /// Mirrors [`lookup`](Self::lookup): `reviews.flag` on an array of
    /// reviews sets `flag` in every review, a numeric segment selects one
    /// element. Fails with `TypeMismatch` when the path runs through a
    /// scalar (or an array element that is not a record).
    pub fn assign_each(&self, record: &mut Record, value: Value) -> Result<()> {
        assign_in(record, &self.segments, &value)
    }

    /// Visit every value this path reaches, descending into arrays the way
    /// [`lookup`](Self::lookup) does; missing branches are skipped
    pub fn for_each_mut<F>(&self, record: &mut Record, mut visit: F)
    where
        F: FnMut(&mut Value),
    {
        if let Some((first, rest)) = self.segments.split_first() {
            if let Some(value) = record.get_mut(first) {
                visit_in(value, rest, &mut visit);
            }
        }
    }

    /// Remove the value at this path, returning it
    pub fn remove(&self, record: &mut Record) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = record;
        for part in parents {
            current = match current.get_mut(part)? {
                Value::Record(map) => map,
                _ => return None,
            };
        }
        current.remove(last)
    }
}

fn lookup_in(value: &Value, rest: &[String]) -> Option<Value> {
    let (first, tail) = match rest.split_first() {
        Some(split) => split,
        None => return Some(value.clone()),
    };

    match value {
        Value::Record(map) => lookup_in(map.get(first)?, tail),
        Value::Array(items) => {
            if let Ok(index) = first.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    return lookup_in(item, tail);
                }
            }
            let mapped: Vec<Value> = items
                .iter()
                .filter(|item| matches!(item, Value::Record(_) | Value::Array(_)))
                .filter_map(|item| lookup_in(item, rest))
                .collect();
            Some(Value::Array(mapped))
        }
        _ => None,
    }
}

fn assign_in(record: &mut Record, segments: &[String], value: &Value) -> Result<()> {
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => return Ok(()),
    };
    if rest.is_empty() {
        record.insert(first.clone(), value.clone());
        return Ok(());
    }
    let slot = record
        .entry(first.clone())
        .or_insert_with(|| Value::Record(Record::new()));
    assign_into(slot, rest, value)
}

fn assign_into(slot: &mut Value, rest: &[String], value: &Value) -> Result<()> {
    match slot {
        Value::Record(map) => assign_in(map, rest, value),
        Value::Array(items) => {
            if let Some((head, tail)) = rest.split_first() {
                if let Ok(index) = head.parse::<usize>() {
                    if let Some(item) = items.get_mut(index) {
                        if tail.is_empty() {
                            *item = value.clone();
                            return Ok(());
                        }
                        return assign_into(item, tail, value);
                    }
                }
            }
            for item in items.iter_mut() {
                assign_into(item, rest, value)?;
            }
            Ok(())
        }
        other => Err(QueryError::type_mismatch(
            "field path",
            "record",
            other.type_name(),
        )),
    }
}

fn visit_in<F>(value: &mut Value, rest: &[String], visit: &mut F)
where
    F: FnMut(&mut Value),
{
    let (first, tail) = match rest.split_first() {
        Some(split) => split,
        None => {
            visit(value);
            return;
        }
    };

    match value {
        Value::Record(map) => {
            if let Some(inner) = map.get_mut(first) {
                visit_in(inner, tail, visit);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = first.parse::<usize>() {
                if let Some(item) = items.get_mut(index) {
                    visit_in(item, tail, visit);
                    return;
                }
            }
            for item in items.iter_mut() {
                if matches!(item, Value::Record(_) | Value::Array(_)) {
                    visit_in(item, rest, visit);
                }
            }
        }
        _ => {}
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// Builder convenience; unvalidated, see [`FieldPath::parse`]
impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        FieldPath {
            segments: path.split('.').map(str::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{record_from_json, record_to_json};
    use serde_json::json;

    fn rec(json: serde_json::Value) -> Record {
        record_from_json(&json).unwrap()
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse("$a").is_err());
        assert_eq!(FieldPath::parse("a.b").unwrap().segments(), ["a", "b"]);
    }

    #[test]
    fn test_from_reference() {
        assert_eq!(FieldPath::from_reference("$price").unwrap().head(), "price");
        assert!(FieldPath::from_reference("price").is_err());
        assert!(FieldPath::from_reference("$$ROOT").is_err());
    }

    #[test]
    fn test_lookup_simple_and_nested() {
        let r = rec(json!({"name": "Alice", "address": {"city": "NYC"}}));
        assert_eq!(FieldPath::from("name").lookup(&r), Some("Alice".into()));
        assert_eq!(FieldPath::from("address.city").lookup(&r), Some("NYC".into()));
        assert_eq!(FieldPath::from("address.zip").lookup(&r), None);
        assert_eq!(FieldPath::from("missing").resolve(&r), Value::Null);
    }

    #[test]
    fn test_lookup_maps_over_arrays() {
        let r = rec(json!({"reviews": [{"rating": 5}, {"rating": 3}, {"comment": "meh"}]}));
        assert_eq!(
            FieldPath::from("reviews.rating").lookup(&r),
            Some(Value::from_json(&json!([5, 3])))
        );
    }

    #[test]
    fn test_lookup_array_of_scalars_yields_empty_mapping() {
        let r = rec(json!({"tags": ["a", "b"]}));
        assert_eq!(
            FieldPath::from("tags.name").lookup(&r),
            Some(Value::Array(vec![]))
        );
    }

    #[test]
    fn test_lookup_nested_arrays_keep_shape() {
        let r = rec(json!({"x": [[{"a": 1}, {"a": 2}], [{"a": 3}]]}));
        assert_eq!(
            FieldPath::from("x.a").lookup(&r),
            Some(Value::from_json(&json!([[1, 2], [3]])))
        );
    }

    #[test]
    fn test_lookup_numeric_index() {
        let r = rec(json!({"items": [{"name": "item1"}, {"name": "item2"}]}));
        assert_eq!(FieldPath::from("items.1.name").lookup(&r), Some("item2".into()));
        assert_eq!(FieldPath::from("items.0").lookup(&r), Some(Value::from_json(&json!({"name": "item1"}))));
    }

    #[test]
    fn test_assign_creates_intermediate_records() {
        let mut r = rec(json!({"name": "Alice"}));
        FieldPath::from("address.city").assign(&mut r, "NYC".into()).unwrap();
        assert_eq!(FieldPath::from("address.city").lookup(&r), Some("NYC".into()));
    }

    #[test]
    fn test_assign_through_scalar_fails() {
        let mut r = rec(json!({"name": "Alice"}));
        let err = FieldPath::from("name.first").assign(&mut r, "A".into()).unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch { .. }));
    }

    #[test]
    fn test_assign_each_maps_over_array_elements() {
        let mut r = rec(json!({"reviews": [{"rating": 5}, {"rating": 3}]}));
        FieldPath::from("reviews.flag").assign_each(&mut r, Value::Bool(true)).unwrap();
        assert_eq!(
            record_to_json(&r),
            json!({"reviews": [{"rating": 5, "flag": true}, {"rating": 3, "flag": true}]})
        );

        FieldPath::from("reviews.1.flag").assign_each(&mut r, Value::Bool(false)).unwrap();
        assert_eq!(
            FieldPath::from("reviews.flag").lookup(&r),
            Some(Value::from_json(&json!([true, false])))
        );
    }

    #[test]
    fn test_assign_each_through_scalar_fails() {
        let mut r = rec(json!({"price": 10, "tags": ["a"]}));
        let err = FieldPath::from("price.net").assign_each(&mut r, Value::Int(1)).unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch { .. }));
        assert!(FieldPath::from("tags.x").assign_each(&mut r, Value::Int(1)).is_err());
    }

    #[test]
    fn test_for_each_mut_reaches_values_inside_arrays() {
        let mut r = rec(json!({"reviews": [{"tags": [1, 2, 3]}, {"tags": [4]}, {"other": 0}]}));
        let mut seen = 0;
        FieldPath::from("reviews.tags").for_each_mut(&mut r, |v| {
            seen += 1;
            *v = Value::Null;
        });
        assert_eq!(seen, 2);
        assert_eq!(
            record_to_json(&r),
            json!({"reviews": [{"tags": null}, {"tags": null}, {"other": 0}]})
        );
    }

    #[test]
    fn test_remove_nested() {
        let mut r = rec(json!({"a": {"b": 1, "c": 2}}));
        assert_eq!(FieldPath::from("a.b").remove(&mut r), Some(Value::Int(1)));
        assert_eq!(FieldPath::from("a.b").remove(&mut r), None);
        assert_eq!(record_to_json(&r), json!({"a": {"c": 2}}));
    }
}
