// ironquery-core/src/update.rs
// Update operators: $set, $push, $inc, $unset

use serde_json::Value as JsonValue;

use crate::error::{QueryError, Result};
use crate::expr::checked_add;
use crate::find_options::slice_array;
use crate::path::FieldPath;
use crate::value::{Record, Value};

/// A single field modification
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Overwrite or create the field
    Set(FieldPath, Value),
    /// Append to an array field, creating it when absent; `slice` trims after the append
    Push {
        path: FieldPath,
        items: Vec<Value>,
        slice: Option<i64>,
    },
    /// Add to a numeric field; a missing field is set to the increment
    Inc(FieldPath, Value),
    Unset(FieldPath),
}

/// Ordered list of modifications applied to one record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Set(FieldPath::from(path), value.into()));
        self
    }

    pub fn push(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Push {
            path: FieldPath::from(path),
            items: vec![value.into()],
            slice: None,
        });
        self
    }

    pub fn inc(mut self, path: &str, by: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Inc(FieldPath::from(path), by.into()));
        self
    }

    pub fn unset(mut self, path: &str) -> Self {
        self.ops.push(UpdateOp::Unset(FieldPath::from(path)));
        self
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Reject updates that would rewrite the record identity or do nothing
    pub fn validate(&self) -> Result<()> {
        if self.ops.is_empty() {
            return Err(QueryError::InvalidQuery("Update has no operators".to_string()));
        }
        for op in &self.ops {
            let path = match op {
                UpdateOp::Set(path, _)
                | UpdateOp::Inc(path, _)
                | UpdateOp::Unset(path)
                | UpdateOp::Push { path, .. } => path,
            };
            if path.head() == "_id" {
                return Err(QueryError::InvalidQuery("Cannot modify _id field".to_string()));
            }
            if let UpdateOp::Inc(_, by) = op {
                if !by.is_number() {
                    return Err(QueryError::type_mismatch("$inc", "number", by.type_name()));
                }
            }
        }
        Ok(())
    }

    /// Parse `{"$set": {...}, "$push": {...}, "$inc": {...}, "$unset": {...}}`
    pub fn from_json(update_json: &JsonValue) -> Result<Self> {
        let update_ops = update_json
            .as_object()
            .ok_or_else(|| QueryError::InvalidQuery("Update must be an object".to_string()))?;

        let mut update = Update::new();
        for (op, fields) in update_ops {
            let field_values = fields.as_object().ok_or_else(|| {
                QueryError::InvalidQuery(format!("{} requires an object of fields", op))
            })?;

            for (field, value) in field_values {
                let path = FieldPath::parse(field)?;
                let parsed = match op.as_str() {
                    "$set" => UpdateOp::Set(path, Value::from_json(value)),
                    "$inc" => UpdateOp::Inc(path, Value::from_json(value)),
                    "$unset" => UpdateOp::Unset(path),
                    "$push" => parse_push(path, value)?,
                    _ => return Err(QueryError::UnknownOperator(op.clone())),
                };
                update.ops.push(parsed);
            }
        }

        update.validate()?;
        Ok(update)
    }

    /// Apply every operator in order
    ///
    /// Operators run against a scratch copy so a failing operator leaves
    /// `record` untouched.
    pub fn apply(&self, record: &mut Record) -> Result<()> {
        let mut working = record.clone();
        for op in &self.ops {
            apply_op(op, &mut working)?;
        }
        *record = working;
        Ok(())
    }
}

fn parse_push(path: FieldPath, value: &JsonValue) -> Result<UpdateOp> {
    // Handle modifiers: $each, $slice
    if let JsonValue::Object(modifiers) = value {
        if let Some(each) = modifiers.get("$each") {
            let items = each
                .as_array()
                .ok_or_else(|| QueryError::InvalidQuery("$each requires an array".to_string()))?
                .iter()
                .map(Value::from_json)
                .collect();
            let slice = match modifiers.get("$slice") {
                Some(n) => Some(n.as_i64().ok_or_else(|| {
                    QueryError::InvalidQuery("$push $slice requires an integer".to_string())
                })?),
                None => None,
            };
            return Ok(UpdateOp::Push { path, items, slice });
        }
    }
    Ok(UpdateOp::Push {
        path,
        items: vec![Value::from_json(value)],
        slice: None,
    })
}

fn apply_op(op: &UpdateOp, record: &mut Record) -> Result<()> {
    match op {
        UpdateOp::Set(path, value) => path.assign(record, value.clone()),
        UpdateOp::Unset(path) => {
            path.remove(record);
            Ok(())
        }
        UpdateOp::Inc(path, by) => {
            let next = match path.lookup(record) {
                None | Some(Value::Null) => by.clone(),
                Some(current) if current.is_number() && by.is_number() => checked_add(&current, by),
                Some(current) => {
                    return Err(QueryError::type_mismatch("$inc", "number", current.type_name()))
                }
            };
            path.assign(record, next)
        }
        UpdateOp::Push { path, items, slice } => {
            // Get or create array
            let mut array = match path.lookup(record) {
                Some(Value::Array(existing)) => existing,
                None | Some(Value::Null) => Vec::new(),
                Some(other) => {
                    return Err(QueryError::type_mismatch("$push", "array", other.type_name()))
                }
            };
            array.extend(items.iter().cloned());
            if let Some(count) = slice {
                array = slice_array(&array, *count);
            }
            path.assign(record, Value::Array(array))
        }
    }
}
