// ironquery-core/src/ingest.rs
//! Loading records from JSON array files
//!
//! Every failure is returned to the caller: unreadable file, malformed
//! JSON, a root that is not an array, or an element that is not an object.

use std::path::Path;

use serde_json::Value as JsonValue;

use crate::error::{QueryError, Result};
use crate::log_debug;
use crate::value::{record_from_json, Record};

/// Parse a JSON array of objects into records
pub fn records_from_json_str(json: &str) -> Result<Vec<Record>> {
    let root: JsonValue = serde_json::from_str(json)
        .map_err(|e| QueryError::Ingest(format!("malformed JSON: {}", e)))?;
    records_from_json(&root)
}

/// Convert an already parsed JSON array
pub fn records_from_json(root: &JsonValue) -> Result<Vec<Record>> {
    let items = root.as_array().ok_or_else(|| {
        QueryError::Ingest(format!("expected a JSON array, found {}", json_type(root)))
    })?;

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            record_from_json(item).ok_or_else(|| {
                QueryError::Ingest(format!(
                    "element {} is {}, expected an object",
                    index,
                    json_type(item)
                ))
            })
        })
        .collect()
}

/// Read and parse a JSON array file
pub fn load_json_array<P: AsRef<Path>>(path: P) -> Result<Vec<Record>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| QueryError::Ingest(format!("{}: {}", path.display(), e)))?;
    let records = records_from_json_str(&contents).map_err(|e| match e {
        QueryError::Ingest(msg) => QueryError::Ingest(format!("{}: {}", path.display(), msg)),
        other => other,
    })?;
    log_debug!("Loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
