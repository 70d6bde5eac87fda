//! NDJSON input
//!
//! One JSON object per line. Columns follow the field order of the first
//! object; fields missing from a later object are null and fields the first
//! object lacks are ignored. Strings are taken verbatim, every other value is
//! rendered as JSON text.

use anyhow::{bail, Context, Result};
use serde_json::Value;

#[derive(Debug, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

pub fn parse_ndjson(text: &str) -> Result<Rows> {
    let mut parsed = Rows::default();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("line {}: invalid JSON", index + 1))?;
        let Value::Object(object) = value else {
            bail!("line {}: expected a JSON object", index + 1);
        };

        if parsed.columns.is_empty() && parsed.rows.is_empty() {
            parsed.columns = object.keys().cloned().collect();
        }
        let row = parsed
            .columns
            .iter()
            .map(|column| object.get(column).and_then(render))
            .collect();
        parsed.rows.push(row);
    }

    if parsed.columns.is_empty() && !parsed.rows.is_empty() {
        bail!("first record has no fields");
    }
    Ok(parsed)
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
