// src/query/operators.rs
//! Field-level filter operators
//!
//! Each operator ($eq, $gt, $in, ...) is a separate type implementing
//! [`OperatorMatcher`]; the JSON parser looks them up by name in
//! [`OPERATOR_REGISTRY`].
//!
//! ```text
//! OperatorMatcher trait
//!     ↓
//! ┌────────────────┬────────────────┬────────────────┐
//! │ Comparison     │ Set            │ Element        │
//! │ ($eq, $gt...)  │ ($in, $nin)    │ ($exists...)   │
//! └────────────────┴────────────────┴────────────────┘
//! ```
//!
//! Operands are validated once when the predicate is built; matching
//! itself never fails. Incompatible types simply do not match.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;

use crate::error::{QueryError, Result};
use crate::value::{compare_values, Value};
use crate::log_trace;

const REGEX_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(n) => n,
    None => panic!("regex cache capacity must be non-zero"),
};

lazy_static! {
    /// Compiled $regex patterns, keyed by pattern string (flags inlined)
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> =
        Mutex::new(LruCache::new(REGEX_CACHE_CAPACITY));

    /// Operator name -> implementation
    pub static ref OPERATOR_REGISTRY: HashMap<&'static str, Box<dyn OperatorMatcher>> = {
        let operators: Vec<Box<dyn OperatorMatcher>> = vec![
            Box::new(EqOperator),
            Box::new(NeOperator),
            Box::new(GtOperator),
            Box::new(GteOperator),
            Box::new(LtOperator),
            Box::new(LteOperator),
            Box::new(InOperator),
            Box::new(NinOperator),
            Box::new(ExistsOperator),
            Box::new(SizeOperator),
            Box::new(RegexOperator),
        ];
        operators.into_iter().map(|op| (op.name(), op)).collect()
    };
}

/// Look up an operator by its `$name`
pub fn lookup_operator(name: &str) -> Result<&'static dyn OperatorMatcher> {
    OPERATOR_REGISTRY
        .get(name)
        .map(|op| op.as_ref())
        .ok_or_else(|| QueryError::UnknownOperator(name.to_string()))
}

/// Translate MongoDB-style regex options (i, m, s, x) into inline flags
pub fn build_regex_pattern(pattern: &str, options: &str) -> String {
    let flags: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();

    if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    }
}

fn get_or_compile_regex(pattern: &str) -> Result<Regex> {
    let mut cache = REGEX_CACHE.lock();
    if let Some(regex) = cache.get(pattern) {
        return Ok(regex.clone());
    }

    let regex = Regex::new(pattern).map_err(|e| {
        QueryError::InvalidQuery(format!("Invalid regex pattern '{}': {}", pattern, e))
    })?;
    cache.put(pattern.to_string(), regex.clone());
    Ok(regex)
}

// ============================================================================
// TRAIT DEFINITION
// ============================================================================

/// A field-level filter operator
///
/// `value` is the resolved field (`None` when the path is missing),
/// `operand` the literal from the filter.
pub trait OperatorMatcher: Send + Sync {
    /// Operator name including the `$` prefix
    fn name(&self) -> &'static str;

    /// Check the operand shape when the predicate is built
    fn validate(&self, _operand: &Value) -> Result<()> {
        Ok(())
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool;
}

// ============================================================================
// COMPARISON OPERATORS
// ============================================================================

/// $eq: equal, or (for array fields) any element equal
///
/// A missing field equals null.
pub struct EqOperator;

impl OperatorMatcher for EqOperator {
    fn name(&self) -> &'static str {
        "$eq"
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool {
        match value {
            None => operand.is_null(),
            Some(v) if v == operand => true,
            Some(Value::Array(items)) => items.iter().any(|item| item == operand),
            Some(_) => false,
        }
    }
}

/// $ne: negation of $eq
pub struct NeOperator;

impl OperatorMatcher for NeOperator {
    fn name(&self) -> &'static str {
        "$ne"
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool {
        !EqOperator.matches(value, operand)
    }
}

pub struct GtOperator;

impl OperatorMatcher for GtOperator {
    fn name(&self) -> &'static str {
        "$gt"
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool {
        compare_with_predicate(value, operand, |ord| ord.is_gt())
    }
}

pub struct GteOperator;

impl OperatorMatcher for GteOperator {
    fn name(&self) -> &'static str {
        "$gte"
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool {
        compare_with_predicate(value, operand, |ord| ord.is_ge())
    }
}

pub struct LtOperator;

impl OperatorMatcher for LtOperator {
    fn name(&self) -> &'static str {
        "$lt"
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool {
        compare_with_predicate(value, operand, |ord| ord.is_lt())
    }
}

pub struct LteOperator;

impl OperatorMatcher for LteOperator {
    fn name(&self) -> &'static str {
        "$lte"
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool {
        compare_with_predicate(value, operand, |ord| ord.is_le())
    }
}

// ============================================================================
// SET OPERATORS
// ============================================================================

/// $in: field equals any listed value
pub struct InOperator;

impl OperatorMatcher for InOperator {
    fn name(&self) -> &'static str {
        "$in"
    }

    fn validate(&self, operand: &Value) -> Result<()> {
        require_array(self.name(), operand)
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool {
        match operand {
            Value::Array(candidates) => candidates
                .iter()
                .any(|candidate| EqOperator.matches(value, candidate)),
            _ => false,
        }
    }
}

/// $nin: negation of $in (a missing field is "not in")
pub struct NinOperator;

impl OperatorMatcher for NinOperator {
    fn name(&self) -> &'static str {
        "$nin"
    }

    fn validate(&self, operand: &Value) -> Result<()> {
        require_array(self.name(), operand)
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool {
        !InOperator.matches(value, operand)
    }
}

// ============================================================================
// ELEMENT OPERATORS
// ============================================================================

/// $exists: field presence; an explicit null counts as present
pub struct ExistsOperator;

impl OperatorMatcher for ExistsOperator {
    fn name(&self) -> &'static str {
        "$exists"
    }

    fn validate(&self, operand: &Value) -> Result<()> {
        match operand {
            Value::Bool(_) => Ok(()),
            other => Err(QueryError::InvalidQuery(format!(
                "$exists operator requires a boolean, got {}",
                other.type_name()
            ))),
        }
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool {
        operand.as_bool() == Some(value.is_some())
    }
}

/// $size: array has exactly n elements
pub struct SizeOperator;

impl OperatorMatcher for SizeOperator {
    fn name(&self) -> &'static str {
        "$size"
    }

    fn validate(&self, operand: &Value) -> Result<()> {
        match operand {
            Value::Int(n) if *n >= 0 => Ok(()),
            _ => Err(QueryError::InvalidQuery(
                "$size operator requires a non-negative integer".to_string(),
            )),
        }
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool {
        match (value, operand) {
            (Some(Value::Array(items)), Value::Int(n)) => items.len() as i64 == *n,
            _ => false,
        }
    }
}

/// $regex: string field (or any string element of an array field) matches
///
/// The operand is the pattern with `$options` already folded in as inline
/// flags, see [`build_regex_pattern`].
pub struct RegexOperator;

impl OperatorMatcher for RegexOperator {
    fn name(&self) -> &'static str {
        "$regex"
    }

    fn validate(&self, operand: &Value) -> Result<()> {
        match operand {
            Value::String(pattern) => get_or_compile_regex(pattern).map(|_| ()),
            other => Err(QueryError::InvalidQuery(format!(
                "$regex operator requires a string pattern, got {}",
                other.type_name()
            ))),
        }
    }

    fn matches(&self, value: Option<&Value>, operand: &Value) -> bool {
        let regex = match operand.as_str().map(get_or_compile_regex) {
            Some(Ok(regex)) => regex,
            _ => return false,
        };
        match value {
            Some(Value::String(s)) => regex.is_match(s),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .any(|s| regex.is_match(s)),
            _ => false,
        }
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn require_array(name: &str, operand: &Value) -> Result<()> {
    match operand {
        Value::Array(_) => Ok(()),
        other => Err(QueryError::InvalidQuery(format!(
            "{} operator requires an array, got {}",
            name,
            other.type_name()
        ))),
    }
}

/// Shared by $gt, $gte, $lt, $lte
///
/// Direct comparison first, then any-element matching for array fields.
/// Incompatible types never match.
fn compare_with_predicate<F>(value: Option<&Value>, operand: &Value, predicate: F) -> bool
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    let value = match value {
        Some(v) => v,
        None => return false,
    };

    if let Some(ordering) = compare_values(value, operand) {
        if predicate(ordering) {
            return true;
        }
    }

    match value {
        Value::Array(items) => items.iter().any(|item| {
            compare_values(item, operand)
                .map(&predicate)
                .unwrap_or(false)
        }),
        _ => {
            log_trace!("no ordering between {} and {}", value.type_name(), operand.type_name());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(json: serde_json::Value) -> Value {
        Value::from_json(&json)
    }

    #[test]
    fn test_eq_operator() {
        let op = EqOperator;
        assert!(op.matches(Some(&v(json!("Alice"))), &v(json!("Alice"))));
        assert!(!op.matches(Some(&v(json!("Bob"))), &v(json!("Alice"))));
        assert!(op.matches(Some(&v(json!(5))), &v(json!(5.0))));
        assert!(!op.matches(None, &v(json!("Alice"))));
        assert!(op.matches(None, &Value::Null));
    }

    #[test]
    fn test_eq_array_element_matching() {
        let op = EqOperator;
        assert!(op.matches(Some(&v(json!(["rust", "db"]))), &v(json!("db"))));
        assert!(op.matches(Some(&v(json!(["rust", "db"]))), &v(json!(["rust", "db"]))));
        assert!(!op.matches(Some(&v(json!(["rust"]))), &v(json!("go"))));
    }

    #[test]
    fn test_ne_operator() {
        let op = NeOperator;
        assert!(op.matches(Some(&v(json!("Bob"))), &v(json!("Alice"))));
        assert!(!op.matches(Some(&v(json!("Alice"))), &v(json!("Alice"))));
        assert!(op.matches(None, &v(json!("Alice"))));
    }

    #[test]
    fn test_range_operators() {
        assert!(GtOperator.matches(Some(&v(json!(10))), &v(json!(5))));
        assert!(!GtOperator.matches(Some(&v(json!(5))), &v(json!(5))));
        assert!(GteOperator.matches(Some(&v(json!(5))), &v(json!(5))));
        assert!(LtOperator.matches(Some(&v(json!(40000))), &v(json!(50000))));
        assert!(LteOperator.matches(Some(&v(json!(4.0))), &v(json!(4))));
        assert!(!LtOperator.matches(None, &v(json!(5))));
    }

    #[test]
    fn test_range_type_mismatch_never_matches() {
        let ops: [&dyn OperatorMatcher; 4] = [&GtOperator, &GteOperator, &LtOperator, &LteOperator];
        for op in ops {
            assert!(!op.matches(Some(&v(json!("cheap"))), &v(json!(50000))), "{}", op.name());
            assert!(!op.matches(Some(&v(json!(true))), &v(json!(1))), "{}", op.name());
        }
    }

    #[test]
    fn test_range_array_element_matching() {
        assert!(GteOperator.matches(Some(&v(json!([1, 5, 9]))), &v(json!(8))));
        assert!(!GtOperator.matches(Some(&v(json!([1, 5]))), &v(json!(8))));
    }

    #[test]
    fn test_in_and_nin() {
        let list = v(json!(["NYC", "LA"]));
        assert!(InOperator.matches(Some(&v(json!("LA"))), &list));
        assert!(!InOperator.matches(Some(&v(json!("SF"))), &list));
        assert!(!InOperator.matches(None, &list));
        assert!(NinOperator.matches(None, &list));
        assert!(NinOperator.matches(Some(&v(json!("SF"))), &list));
        assert!(InOperator.validate(&v(json!("NYC"))).is_err());
        assert!(NinOperator.validate(&v(json!(1))).is_err());
    }

    #[test]
    fn test_exists_operator() {
        assert!(ExistsOperator.matches(Some(&Value::Null), &Value::Bool(true)));
        assert!(ExistsOperator.matches(None, &Value::Bool(false)));
        assert!(!ExistsOperator.matches(None, &Value::Bool(true)));
        assert!(ExistsOperator.validate(&v(json!(1))).is_err());
    }

    #[test]
    fn test_size_operator() {
        assert!(SizeOperator.matches(Some(&v(json!([1, 2]))), &Value::Int(2)));
        assert!(!SizeOperator.matches(Some(&v(json!("ab"))), &Value::Int(2)));
        assert!(SizeOperator.validate(&Value::Int(-1)).is_err());
    }

    #[test]
    fn test_regex_operator() {
        let pattern = Value::from(build_regex_pattern("^lap", "i"));
        assert!(RegexOperator.matches(Some(&v(json!("Laptop"))), &pattern));
        assert!(RegexOperator.matches(Some(&v(json!(["Phone", "laptop bag"]))), &pattern));
        assert!(!RegexOperator.matches(Some(&v(json!("Desktop"))), &pattern));
        assert!(!RegexOperator.matches(Some(&v(json!(42))), &pattern));
    }

    #[test]
    fn test_regex_invalid_pattern_rejected() {
        let err = RegexOperator.validate(&Value::from("[unclosed")).unwrap_err();
        assert!(err.to_string().contains("Invalid regex pattern"));
    }

    #[test]
    fn test_build_regex_pattern_filters_options() {
        assert_eq!(build_regex_pattern("abc", ""), "abc");
        assert_eq!(build_regex_pattern("abc", "iq"), "(?i)abc");
        assert_eq!(build_regex_pattern("a.c", "ms"), "(?ms)a.c");
    }

    #[test]
    fn test_operator_registry() {
        for name in ["$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists", "$size", "$regex"] {
            assert_eq!(lookup_operator(name).unwrap().name(), name);
        }
        assert!(matches!(
            lookup_operator("$near"),
            Err(QueryError::UnknownOperator(_))
        ));
    }
}
