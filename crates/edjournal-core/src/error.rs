use std::path::PathBuf;

use edjournal_db::{DbError, MigrationError};
use edjournal_journal::TailError;
use thiserror::Error;

/// Everything that can go wrong while ingesting. None of these stop the
/// engine; the worker logs them and retries on the next signal.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("transient I/O error on {path:?}: {source}")]
    IoTransient {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("journal directory {path:?} is inaccessible: {source}")]
    IoFatal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt {table} row {key} quarantined: {reason}")]
    StoreCorruption {
        table: &'static str,
        key: String,
        reason: String,
    },

    #[error("legacy migration incomplete: {0}")]
    MigrationConflict(MigrationError),

    #[error("session store error: {0}")]
    Store(DbError),

    #[error("ingestion worker stopped unexpectedly: {0}")]
    WorkerStopped(String),
}

impl From<TailError> for IngestError {
    fn from(err: TailError) -> Self {
        match err {
            TailError::NoSource(path) => IngestError::IoFatal {
                path,
                source: std::io::ErrorKind::NotFound.into(),
            },
            TailError::Transient { path, source } => IngestError::IoTransient { path, source },
            TailError::Fatal { path, source } => IngestError::IoFatal { path, source },
        }
    }
}

impl From<DbError> for IngestError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Corrupt { table, key, reason } => {
                IngestError::StoreCorruption { table, key, reason }
            }
            other => IngestError::Store(other),
        }
    }
}

impl From<MigrationError> for IngestError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Db(db) => db.into(),
            other => IngestError::MigrationConflict(other),
        }
    }
}

impl IngestError {
    /// Whether the worker should consider the store unusable until the next
    /// successful commit.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, IngestError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_rows_map_to_store_corruption() {
        let err: IngestError = DbError::Corrupt {
            table: "sessions",
            key: "abc".to_string(),
            reason: "bad stats".to_string(),
        }
        .into();
        assert!(matches!(err, IngestError::StoreCorruption { table: "sessions", .. }));
        assert!(!err.is_store_failure());
    }

    #[test]
    fn tail_errors_keep_their_path() {
        let err: IngestError = TailError::Transient {
            path: PathBuf::from("/j/Journal.2024-01-01T000000.01.log"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"),
        }
        .into();
        match err {
            IngestError::IoTransient { path, .. } => {
                assert_eq!(path, PathBuf::from("/j/Journal.2024-01-01T000000.01.log"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lock_poisoning_is_a_store_failure() {
        let err: IngestError = DbError::LockPoisoned.into();
        assert!(err.is_store_failure());
    }
}
