//! Database layer for edjournal.
//!
//! Provides a `Database` struct that owns the SQLite connection and hands
//! out per-table stores for sessions, the file ledger and quarantined rows.
//! Writes that must land together go through [`Database::commit_checkpoint`].

mod ledger;
pub mod legacy;
mod quarantine;
mod sessions;
mod stats;

pub use ledger::Ledger;
pub use legacy::{migrate_legacy, MigrationError, MigrationReport};
pub use quarantine::{Quarantine, QuarantinedRow};
pub use sessions::{session_key, Session, SessionFilter, SessionRollup, Sessions};
pub use stats::{
    CombatStats, CreditStats, ExplorationStats, MissionStats, SessionStats, TradingStats,
    TravelStats,
};

use edjournal_journal::FileLedgerEntry;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("corrupt {table} row {key}: {reason}")]
    Corrupt {
        table: &'static str,
        key: String,
        reason: String,
    },
}

/// Everything one fold step produced, persisted as a single transaction.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    /// Sessions closed during the step, plus the open session if any.
    pub sessions: Vec<Session>,
    pub ledger: Vec<FileLedgerEntry>,
}

impl Checkpoint {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.ledger.is_empty()
    }
}

/// The main database struct that owns the SQLite connection.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at a specific path.
    pub fn open_at(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&conn)?;
        debug!(path = ?path, "opened session store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the default database path.
    ///
    /// The default location is `~/.local/share/edjournal/edjournal.db`.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("edjournal")
            .join("edjournal.db")
    }

    /// Access the sessions store.
    pub fn sessions(&self) -> Result<Sessions<'_>, DbError> {
        Ok(Sessions::new(self.lock()?))
    }

    /// Access the file ledger store.
    pub fn ledger(&self) -> Result<Ledger<'_>, DbError> {
        Ok(Ledger::new(self.lock()?))
    }

    /// Access rows set aside as unreadable.
    pub fn quarantine(&self) -> Result<Quarantine<'_>, DbError> {
        Ok(Quarantine::new(self.lock()?))
    }

    /// Persist sessions and ledger entries atomically.
    pub fn commit_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), DbError> {
        if checkpoint.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for session in &checkpoint.sessions {
            sessions::upsert(&tx, session)?;
        }
        for entry in &checkpoint.ledger {
            ledger::upsert(&tx, entry)?;
        }
        tx.commit()?;
        debug!(
            sessions = checkpoint.sessions.len(),
            ledger = checkpoint.ledger.len(),
            "checkpoint committed"
        );
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Initialize the database schema.
    fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                identity TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                source_file TEXT NOT NULL,
                jumps INTEGER NOT NULL DEFAULT 0,
                light_years REAL NOT NULL DEFAULT 0,
                total_events INTEGER NOT NULL DEFAULT 0,
                credits_delta INTEGER NOT NULL DEFAULT 0,
                stats TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_identity ON sessions(identity, start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_sessions_start_time ON sessions(start_time DESC);

            CREATE TABLE IF NOT EXISTS file_ledger (
                path TEXT PRIMARY KEY,
                size_at_last_read INTEGER NOT NULL,
                bytes_consumed INTEGER NOT NULL,
                fully_closed INTEGER NOT NULL,
                last_seen_mtime TEXT
            );

            CREATE TABLE IF NOT EXISTS quarantine (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                row_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                quarantined_at TEXT NOT NULL
            );
            "#,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_at_creates_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("edjournal.db");
        let db = Database::open_at(&path).unwrap();
        assert!(path.exists());
        assert!(db.ledger().unwrap().load_all().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("edjournal.db");
        {
            let db = Database::open_at(&path).unwrap();
            let mut entry = FileLedgerEntry::new(PathBuf::from("/j/Journal.2024-05-01T120000.01.log"));
            entry.size_at_last_read = 40;
            entry.bytes_consumed = 40;
            db.ledger().unwrap().upsert(&entry).unwrap();
        }
        let db = Database::open_at(&path).unwrap();
        let entries = db.ledger().unwrap().load_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].bytes_consumed, 40);
    }

    #[test]
    fn test_empty_checkpoint_is_a_no_op() {
        let db = Database::open_in_memory().unwrap();
        db.commit_checkpoint(&Checkpoint::default()).unwrap();
        assert!(db.sessions().unwrap().list(&SessionFilter::default()).unwrap().is_empty());
    }
}
