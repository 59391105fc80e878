// src/query.rs
//! Filter predicates
//!
//! A [`Predicate`] is a tree of field conditions combined with
//! `and`/`or`/`not`. Field conditions delegate to the operator strategies
//! in [`operators`]. Matching is pure: no side effects, never fails, and a
//! type mismatch between field and operand is simply "no match".
//!
//! ```
//! use ironquery_core::query::Predicate;
//! use ironquery_core::value::{record, Value};
//!
//! let p = Predicate::and(vec![
//!     Predicate::eq("category", "Electronics"),
//!     Predicate::lt("price", 50000),
//! ]);
//! let laptop = record([("category", Value::from("Electronics")), ("price", Value::from(40000))]);
//! assert!(p.matches(&laptop));
//! ```

pub mod operators;

use std::fmt;

use serde_json::Value as JsonValue;

use crate::error::{QueryError, Result};
use crate::path::FieldPath;
use crate::value::{Record, Value};

use self::operators::{
    build_regex_pattern, lookup_operator, EqOperator, GtOperator, GteOperator, LtOperator,
    LteOperator, NeOperator, OperatorMatcher,
};

#[derive(Clone)]
pub enum Predicate {
    /// Matches every record (the empty filter `{}`)
    All,
    Field {
        path: FieldPath,
        op: &'static dyn OperatorMatcher,
        operand: Value,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    fn compare(path: &str, op: &'static dyn OperatorMatcher, operand: impl Into<Value>) -> Self {
        Predicate::Field {
            path: FieldPath::from(path),
            op,
            operand: operand.into(),
        }
    }

    pub fn eq(path: &str, operand: impl Into<Value>) -> Self {
        Self::compare(path, &EqOperator, operand)
    }

    pub fn ne(path: &str, operand: impl Into<Value>) -> Self {
        Self::compare(path, &NeOperator, operand)
    }

    pub fn gt(path: &str, operand: impl Into<Value>) -> Self {
        Self::compare(path, &GtOperator, operand)
    }

    pub fn gte(path: &str, operand: impl Into<Value>) -> Self {
        Self::compare(path, &GteOperator, operand)
    }

    pub fn lt(path: &str, operand: impl Into<Value>) -> Self {
        Self::compare(path, &LtOperator, operand)
    }

    pub fn lte(path: &str, operand: impl Into<Value>) -> Self {
        Self::compare(path, &LteOperator, operand)
    }

    /// Any registered operator by name; validates the operand
    pub fn field(path: &str, op_name: &str, operand: impl Into<Value>) -> Result<Self> {
        let op = lookup_operator(op_name)?;
        let operand = operand.into();
        op.validate(&operand)?;
        Ok(Predicate::Field {
            path: FieldPath::parse(path)?,
            op,
            operand,
        })
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Predicate::And(predicates)
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Predicate::Or(predicates)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(predicate: Predicate) -> Self {
        Predicate::Not(Box::new(predicate))
    }

    /// Evaluate against a record; short-circuits left to right
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Field { path, op, operand } => {
                op.matches(path.lookup(record).as_ref(), operand)
            }
            Predicate::And(predicates) => predicates.iter().all(|p| p.matches(record)),
            Predicate::Or(predicates) => predicates.iter().any(|p| p.matches(record)),
            Predicate::Not(inner) => !inner.matches(record),
        }
    }

    /// Parse a MongoDB-style filter document
    ///
    /// Supports implicit equality (`{"name": "x"}`), field operators
    /// (`{"price": {"$lt": 50000}}`), `$regex` with `$options`, field-level
    /// `$not`, and top-level `$and`, `$or`, `$nor`, `$not`. Several keys in
    /// one document are an implicit `$and`.
    pub fn from_json(filter: &JsonValue) -> Result<Self> {
        let filter_obj = filter
            .as_object()
            .ok_or_else(|| QueryError::InvalidQuery("Filter must be an object".to_string()))?;

        let mut clauses = Vec::with_capacity(filter_obj.len());
        for (key, value) in filter_obj {
            if key.starts_with('$') {
                clauses.push(parse_logical(key, value)?);
            } else {
                clauses.push(parse_field_condition(key, value)?);
            }
        }

        Ok(match clauses.len() {
            0 => Predicate::All,
            1 => clauses.remove(0),
            _ => Predicate::And(clauses),
        })
    }
}

fn parse_logical(key: &str, value: &JsonValue) -> Result<Predicate> {
    match key {
        "$and" | "$or" | "$nor" => {
            let items = value
                .as_array()
                .filter(|items| !items.is_empty())
                .ok_or_else(|| {
                    QueryError::InvalidQuery(format!("{} requires a non-empty array", key))
                })?;
            let predicates = items
                .iter()
                .map(Predicate::from_json)
                .collect::<Result<Vec<_>>>()?;
            Ok(match key {
                "$and" => Predicate::And(predicates),
                "$or" => Predicate::Or(predicates),
                _ => Predicate::not(Predicate::Or(predicates)),
            })
        }
        "$not" => Ok(Predicate::not(Predicate::from_json(value)?)),
        _ => Err(QueryError::UnknownOperator(key.to_string())),
    }
}

fn parse_field_condition(field: &str, condition: &JsonValue) -> Result<Predicate> {
    let path = FieldPath::parse(field)?;

    let condition_obj = match condition {
        JsonValue::Object(obj) if obj.keys().any(|k| k.starts_with('$')) => obj,
        // Direct equality, including against a literal sub-document
        literal => {
            return Ok(Predicate::Field {
                path,
                op: &EqOperator,
                operand: Value::from_json(literal),
            })
        }
    };

    if condition_obj.keys().any(|k| !k.starts_with('$')) {
        return Err(QueryError::InvalidQuery(format!(
            "Condition on '{}' mixes operators and fields",
            field
        )));
    }

    let mut clauses = Vec::with_capacity(condition_obj.len());
    for (op_name, operand) in condition_obj {
        match op_name.as_str() {
            "$options" if condition_obj.contains_key("$regex") => continue,
            "$options" => {
                return Err(QueryError::InvalidQuery(
                    "$options requires $regex".to_string(),
                ))
            }
            "$regex" => {
                let pattern = operand.as_str().ok_or_else(|| {
                    QueryError::InvalidQuery("$regex requires a string pattern".to_string())
                })?;
                let options = condition_obj
                    .get("$options")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                clauses.push(field_clause(
                    &path,
                    "$regex",
                    Value::from(build_regex_pattern(pattern, options)),
                )?);
            }
            "$not" => {
                let inner = parse_field_condition(field, operand)?;
                clauses.push(Predicate::not(inner));
            }
            name => clauses.push(field_clause(&path, name, Value::from_json(operand))?),
        }
    }

    Ok(if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        Predicate::And(clauses)
    })
}

fn field_clause(path: &FieldPath, op_name: &str, operand: Value) -> Result<Predicate> {
    let op = lookup_operator(op_name)?;
    op.validate(&operand)?;
    Ok(Predicate::Field {
        path: path.clone(),
        op,
        operand,
    })
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::All
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => write!(f, "All"),
            Predicate::Field { path, op, operand } => {
                write!(f, "{{{}: {{{}: {}}}}}", path, op.name(), operand)
            }
            Predicate::And(items) => f.debug_tuple("And").field(items).finish(),
            Predicate::Or(items) => f.debug_tuple("Or").field(items).finish(),
            Predicate::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
