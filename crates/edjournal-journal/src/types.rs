use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Event type assigned to lines whose `event` key is missing or not a string.
pub const UNKNOWN_EVENT: &str = "Unknown";

/// Open field map of a journal line. Values keep their JSON types.
pub type Fields = Map<String, Value>;

/// One parsed journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEvent {
    pub source_file: PathBuf,
    /// Offset in `source_file` immediately after this line's terminator.
    pub byte_offset_end: u64,
    /// Monotonic across the replay and live stream of one tailer.
    pub sequence: u64,
    /// Event-supplied timestamp, kept verbatim. Empty when absent.
    pub timestamp: String,
    pub event_type: String,
    pub fields: Fields,
}

impl JournalEvent {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    /// Integer view of a numeric field. Floats are truncated toward zero.
    pub fn i64_field(&self, key: &str) -> Option<i64> {
        let value = self.fields.get(key)?;
        value
            .as_i64()
            .or_else(|| value.as_u64().map(|n| n.min(i64::MAX as u64) as i64))
            .or_else(|| value.as_f64().map(|f| f as i64))
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    /// The timestamp as RFC 3339, when it is one.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// File name of the source journal, used as a stable identity across
    /// moves of the journal directory.
    pub fn source_name(&self) -> String {
        file_name_of(&self.source_file)
    }
}

/// Durable read progress for one journal file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLedgerEntry {
    pub path: PathBuf,
    pub size_at_last_read: u64,
    /// Always `<= size_at_last_read`.
    pub bytes_consumed: u64,
    /// Set once a newer journal file exists; the file never grows again.
    pub fully_closed: bool,
    pub last_seen_mtime: Option<DateTime<Utc>>,
}

impl FileLedgerEntry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            size_at_last_read: 0,
            bytes_consumed: 0,
            fully_closed: false,
            last_seen_mtime: None,
        }
    }

    /// Whether the file currently has bytes past the committed offset.
    pub fn has_pending(&self, current_len: u64) -> bool {
        current_len > self.bytes_consumed
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}
