//! # edjournal-journal
//!
//! Turns a directory of append-only, line-delimited JSON journal files into
//! an ordered stream of typed events.
//!
//! ## Key Types
//!
//! - [`JournalEvent`] - One parsed line with its position in the stream
//! - [`FileLedgerEntry`] - Durable read progress for one file
//! - [`JournalTailer`] - Ordered, restart-safe reader over the directory
//! - [`DirectoryWatcher`] - Change notifications merged with a poll tick

pub mod files;
pub mod parser;
pub mod tailer;
pub mod types;
pub mod watcher;

pub use files::{is_journal_path, list_journal_files, parse_journal_name, JournalFile};
pub use parser::{parse_line, ParseFailure};
pub use tailer::{Discovery, JournalTailer, ReadBatch, RetryPolicy, TailError, TailerOptions};
pub use types::{Fields, FileLedgerEntry, JournalEvent, UNKNOWN_EVENT};
pub use watcher::{spawn_poll_timer, DirectoryWatcher, WatchSignal};
