use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::types::{JournalEvent, UNKNOWN_EVENT};

/// A line that is not a JSON object. Counted and skipped, never retried.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("unparseable journal line at {source_file:?}:{byte_offset_end}: {reason}")]
pub struct ParseFailure {
    pub reason: String,
    pub raw_line: String,
    pub source_file: PathBuf,
    pub byte_offset_end: u64,
}

/// Parse one journal line into a typed event.
///
/// Lines with a missing or non-string `event` key are kept as
/// [`UNKNOWN_EVENT`] with every field preserved. Only lines that are not a
/// JSON object fail.
pub fn parse_line(
    line: &str,
    source_file: &Path,
    byte_offset_end: u64,
    sequence: u64,
) -> Result<JournalEvent, ParseFailure> {
    let failure = |reason: String| ParseFailure {
        reason,
        raw_line: line.to_string(),
        source_file: source_file.to_path_buf(),
        byte_offset_end,
    };

    let value: Value = serde_json::from_str(line).map_err(|e| failure(e.to_string()))?;
    let fields = match value {
        Value::Object(map) => map,
        other => return Err(failure(format!("expected a JSON object, found {}", kind(&other)))),
    };

    let event_type = fields
        .get("event")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_EVENT)
        .to_string();

    let timestamp = fields
        .get("timestamp")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(JournalEvent {
        source_file: source_file.to_path_buf(),
        byte_offset_end,
        sequence,
        timestamp,
        event_type,
        fields,
    })
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_lines_are_failures() {
        let err = parse_line("[1,2]", Path::new("j.log"), 6, 0).unwrap_err();
        assert!(err.reason.contains("an array"));
        assert_eq!(err.raw_line, "[1,2]");
    }
}
