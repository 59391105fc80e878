// ironquery-core/src/format.rs
// Result rendering for callers and the CLI

use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::value::{record_to_json, Record};

/// Records as a JSON array; timestamps become `{"$date": "<RFC 3339>"}`
pub fn to_json_value(records: &[Record]) -> JsonValue {
    JsonValue::Array(records.iter().map(record_to_json).collect())
}

/// Pretty-printed JSON array
pub fn pretty(records: &[Record]) -> Result<String> {
    Ok(serde_json::to_string_pretty(&to_json_value(records))?)
}

/// One compact JSON document per line
pub fn lines(records: &[Record]) -> Result<String> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(&record_to_json(record))?);
        out.push('\n');
    }
    Ok(out)
}
