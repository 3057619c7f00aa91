//! Unreadable rows, backed up before they are reset.

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::MutexGuard;
use tracing::warn;

use crate::DbError;

/// A row moved out of its table because it could not be decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantinedRow {
    pub table_name: String,
    pub row_key: String,
    /// The raw column values as JSON.
    pub payload: String,
    pub reason: String,
    pub quarantined_at: String,
}

/// Quarantine store with a borrowed connection.
pub struct Quarantine<'db> {
    conn: MutexGuard<'db, Connection>,
}

impl<'db> Quarantine<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    pub fn list(&self) -> Result<Vec<QuarantinedRow>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name, row_key, payload, reason, quarantined_at FROM quarantine ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(QuarantinedRow {
                table_name: row.get(0)?,
                row_key: row.get(1)?,
                payload: row.get(2)?,
                reason: row.get(3)?,
                quarantined_at: row.get(4)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<usize, DbError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM quarantine", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// One row read without interpretation, so it can be backed up verbatim.
/// The first column is the key.
#[derive(Debug, Clone)]
pub(crate) struct RawRow {
    /// Printable form of the key, for logs and the quarantine table.
    pub key: String,
    pub columns: Vec<(&'static str, SqlValue)>,
}

impl RawRow {
    pub fn read(
        row: &rusqlite::Row,
        names: &[&'static str],
    ) -> Result<Self, rusqlite::Error> {
        let mut columns = Vec::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            columns.push((*name, row.get::<_, SqlValue>(idx)?));
        }
        let key = match columns.first() {
            Some((_, SqlValue::Text(s))) => s.clone(),
            Some((_, other)) => format!("{:?}", other),
            None => String::new(),
        };
        Ok(Self { key, columns })
    }

    /// The key as stored, whatever its type.
    fn key_value(&self) -> &SqlValue {
        self.columns.first().map(|(_, v)| v).unwrap_or(&SqlValue::Null)
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn payload(&self) -> String {
        let mut map = Map::new();
        for (name, value) in &self.columns {
            let json = match value {
                SqlValue::Null => Value::Null,
                SqlValue::Integer(i) => Value::from(*i),
                SqlValue::Real(f) => Value::from(*f),
                SqlValue::Text(s) => Value::from(s.as_str()),
                SqlValue::Blob(b) => Value::from(format!("<{} byte blob>", b.len())),
            };
            map.insert((*name).to_string(), json);
        }
        Value::Object(map).to_string()
    }
}

/// Back up `row` into the quarantine table and delete it from `table`, in
/// one transaction. Callers hold no transaction of their own.
pub(crate) fn quarantine_row(
    conn: &Connection,
    table: &'static str,
    key_column: &'static str,
    row: &RawRow,
    reason: &str,
) -> Result<(), DbError> {
    warn!(table, key = %row.key, reason, "quarantining unreadable row");
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO quarantine (table_name, row_key, payload, reason, quarantined_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![table, row.key, row.payload(), reason, Utc::now().to_rfc3339()],
    )?;
    tx.execute(
        &format!("DELETE FROM {} WHERE {} = ?1", table, key_column),
        params![row.key_value()],
    )?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn raw_session(conn: &Connection, id_sql: &str) -> RawRow {
        conn.execute(
            &format!(
                "INSERT INTO sessions (id, identity, start_time, end_time, source_file, stats, updated_at) VALUES ({}, 'Jameson', 'T0', NULL, 'Journal.a.log', '{{}}', 'now')",
                id_sql
            ),
            [],
        )
        .unwrap();
        conn.query_row("SELECT id, stats FROM sessions", [], |row| {
            RawRow::read(row, &["id", "stats"])
        })
        .unwrap()
    }

    #[test]
    fn test_non_text_key_is_deleted() {
        let db = Database::open_in_memory().unwrap();
        {
            let conn = db.lock().unwrap();
            let row = raw_session(&conn, "X'0102'");
            assert_eq!(row.key_value(), &SqlValue::Blob(vec![1, 2]));
            quarantine_row(&conn, "sessions", "id", &row, "blob key").unwrap();
            let left: i64 = conn
                .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
                .unwrap();
            assert_eq!(left, 0);
        }
        assert_eq!(db.quarantine().unwrap().count().unwrap(), 1);
    }

    #[test]
    fn test_failed_delete_keeps_no_backup() {
        let db = Database::open_in_memory().unwrap();
        {
            let conn = db.lock().unwrap();
            let row = raw_session(&conn, "'a'");
            let err = quarantine_row(&conn, "sessions", "no_such_column", &row, "bad").unwrap_err();
            assert!(matches!(err, DbError::Sqlite(_)));
            let left: i64 = conn
                .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
                .unwrap();
            assert_eq!(left, 1);
        }
        assert_eq!(db.quarantine().unwrap().count().unwrap(), 0);
        assert!(db.quarantine().unwrap().list().unwrap().is_empty());
    }
}
