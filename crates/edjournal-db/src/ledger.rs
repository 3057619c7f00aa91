//! File ledger store: per-file read progress.

use chrono::{DateTime, Utc};
use edjournal_journal::FileLedgerEntry;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;

use crate::quarantine::{quarantine_row, RawRow};
use crate::DbError;

const COLUMNS: [&str; 5] = [
    "path",
    "size_at_last_read",
    "bytes_consumed",
    "fully_closed",
    "last_seen_mtime",
];

/// Ledger store with a borrowed connection.
pub struct Ledger<'db> {
    conn: MutexGuard<'db, Connection>,
}

impl<'db> Ledger<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    /// Load every ledger row. Rows that cannot be decoded are moved to the
    /// quarantine table and omitted, so their files are read from the start.
    pub fn load_all(&self) -> Result<Vec<FileLedgerEntry>, DbError> {
        let raw = {
            let mut stmt = self.conn.prepare(
                "SELECT path, size_at_last_read, bytes_consumed, fully_closed, last_seen_mtime FROM file_ledger ORDER BY path",
            )?;
            let rows = stmt.query_map([], |row| RawRow::read(row, &COLUMNS))?;
            let mut raw = Vec::new();
            for row in rows {
                raw.push(row?);
            }
            raw
        };

        let mut entries = Vec::with_capacity(raw.len());
        for row in raw {
            match decode(&row) {
                Ok(entry) => entries.push(entry),
                Err(reason) => quarantine_row(&self.conn, "file_ledger", "path", &row, &reason)?,
            }
        }
        Ok(entries)
    }

    /// Look up one entry. An unreadable row is quarantined and reported as
    /// [`DbError::Corrupt`].
    pub fn get(&self, path: &Path) -> Result<Option<FileLedgerEntry>, DbError> {
        let raw = self
            .conn
            .query_row(
                "SELECT path, size_at_last_read, bytes_consumed, fully_closed, last_seen_mtime FROM file_ledger WHERE path = ?1",
                params![path.to_string_lossy()],
                |row| RawRow::read(row, &COLUMNS),
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some(row) => match decode(&row) {
                Ok(entry) => Ok(Some(entry)),
                Err(reason) => {
                    quarantine_row(&self.conn, "file_ledger", "path", &row, &reason)?;
                    Err(DbError::Corrupt {
                        table: "file_ledger",
                        key: row.key,
                        reason,
                    })
                }
            },
        }
    }

    /// Insert or replace one entry.
    pub fn upsert(&self, entry: &FileLedgerEntry) -> Result<(), DbError> {
        upsert(&self.conn, entry)?;
        Ok(())
    }

    /// Zero every offset so all files are replayed from the start.
    pub fn reset_all(&self) -> Result<usize, DbError> {
        let n = self.conn.execute(
            "UPDATE file_ledger SET size_at_last_read = 0, bytes_consumed = 0, last_seen_mtime = NULL",
            [],
        )?;
        Ok(n)
    }
}

pub(crate) fn upsert(conn: &Connection, entry: &FileLedgerEntry) -> Result<(), rusqlite::Error> {
    conn.execute(
        r#"
        INSERT INTO file_ledger (path, size_at_last_read, bytes_consumed, fully_closed, last_seen_mtime)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(path) DO UPDATE SET
            size_at_last_read = excluded.size_at_last_read,
            bytes_consumed = excluded.bytes_consumed,
            fully_closed = excluded.fully_closed,
            last_seen_mtime = excluded.last_seen_mtime
        "#,
        params![
            entry.path.to_string_lossy(),
            entry.size_at_last_read as i64,
            entry.bytes_consumed as i64,
            entry.fully_closed,
            entry.last_seen_mtime.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

/// Record a file as consumed up to `size` without ever lowering an
/// existing offset.
pub(crate) fn upsert_consumed(
    conn: &Connection,
    path: &Path,
    size: u64,
    mtime: Option<DateTime<Utc>>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        r#"
        INSERT INTO file_ledger (path, size_at_last_read, bytes_consumed, fully_closed, last_seen_mtime)
        VALUES (?1, ?2, ?2, 0, ?3)
        ON CONFLICT(path) DO UPDATE SET
            size_at_last_read = MAX(file_ledger.size_at_last_read, excluded.size_at_last_read),
            bytes_consumed = MAX(file_ledger.bytes_consumed, excluded.bytes_consumed),
            last_seen_mtime = COALESCE(file_ledger.last_seen_mtime, excluded.last_seen_mtime)
        "#,
        params![path.to_string_lossy(), size as i64, mtime.map(|t| t.to_rfc3339())],
    )?;
    Ok(())
}

fn decode(row: &RawRow) -> Result<FileLedgerEntry, String> {
    let path = match row.get("path") {
        Some(SqlValue::Text(s)) if !s.is_empty() => PathBuf::from(s),
        other => return Err(format!("invalid path {:?}", other)),
    };
    let size = non_negative(row.get("size_at_last_read"), "size_at_last_read")?;
    let consumed = non_negative(row.get("bytes_consumed"), "bytes_consumed")?;
    if consumed > size {
        return Err(format!(
            "bytes_consumed {} exceeds size_at_last_read {}",
            consumed, size
        ));
    }
    let fully_closed = match row.get("fully_closed") {
        Some(SqlValue::Integer(0)) => false,
        Some(SqlValue::Integer(1)) => true,
        other => return Err(format!("invalid fully_closed {:?}", other)),
    };
    let last_seen_mtime = match row.get("last_seen_mtime") {
        None | Some(SqlValue::Null) => None,
        Some(SqlValue::Text(s)) => Some(
            DateTime::parse_from_rfc3339(s)
                .map_err(|e| format!("invalid last_seen_mtime {:?}: {}", s, e))?
                .with_timezone(&Utc),
        ),
        Some(other) => return Err(format!("invalid last_seen_mtime {:?}", other)),
    };
    Ok(FileLedgerEntry {
        path,
        size_at_last_read: size,
        bytes_consumed: consumed,
        fully_closed,
        last_seen_mtime,
    })
}

fn non_negative(value: Option<&SqlValue>, column: &str) -> Result<u64, String> {
    match value {
        Some(SqlValue::Integer(n)) if *n >= 0 => Ok(*n as u64),
        other => Err(format!("invalid {} {:?}", column, other)),
    }
}
