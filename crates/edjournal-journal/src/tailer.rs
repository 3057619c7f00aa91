//! Incremental, restart-safe reading of a journal directory.
//!
//! The tailer mirrors the committed file ledger in memory. Each call to
//! [`JournalTailer::next_batch`] reads the oldest file that has bytes past
//! its committed offset and returns the complete lines as events together
//! with the ledger entry that describes the new offset. The caller folds the
//! events, persists the entry atomically with the fold results and then
//! calls [`JournalTailer::commit`]; on failure it calls
//! [`JournalTailer::rollback`] and the same bytes are read again later.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::files::{list_journal_files, JournalFile};
use crate::parser::{parse_line, ParseFailure};
use crate::types::{FileLedgerEntry, JournalEvent};

const DEFAULT_MAX_CHUNK_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TailError {
    /// The journal directory does not exist. A normal startup condition.
    #[error("journal directory {0:?} is not present")]
    NoSource(PathBuf),

    #[error("transient I/O error on {path:?}: {source}")]
    Transient {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("journal directory {path:?} is inaccessible: {source}")]
    Fatal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exponential backoff for files that fail to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempts + 1`, given `attempts` failures so far.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TailerOptions {
    pub max_chunk_bytes: u64,
    pub retry: RetryPolicy,
}

impl Default for TailerOptions {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of listing the journal directory.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub files_known: usize,
    pub newest: Option<PathBuf>,
    /// Ledger entries created or closed by this listing. They carry no
    /// offset advance and can be persisted on their own.
    pub changed: Vec<FileLedgerEntry>,
}

/// Complete lines read from one file past its committed offset.
#[derive(Debug, Clone)]
pub struct ReadBatch {
    pub path: PathBuf,
    pub events: Vec<JournalEvent>,
    pub failures: Vec<ParseFailure>,
    /// Ledger entry to persist together with the fold of `events`.
    pub entry: FileLedgerEntry,
    pub first_sequence: u64,
    /// The file shrank and was re-read from offset zero.
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempts: u32,
    not_before: Instant,
}

pub struct JournalTailer {
    dir: PathBuf,
    options: TailerOptions,
    files: Vec<JournalFile>,
    ledger: HashMap<PathBuf, FileLedgerEntry>,
    retries: HashMap<PathBuf, RetryState>,
    next_sequence: u64,
    parse_failures: u64,
    /// Stat every file on the next pass, including closed, fully read ones.
    verify_all: bool,
}

impl JournalTailer {
    /// Create a tailer over `dir` that resumes from the committed ledger.
    pub fn new(dir: PathBuf, ledger: Vec<FileLedgerEntry>, options: TailerOptions) -> Self {
        Self {
            dir,
            options,
            files: Vec::new(),
            ledger: ledger.into_iter().map(|e| (e.path.clone(), e)).collect(),
            retries: HashMap::new(),
            next_sequence: 0,
            parse_failures: 0,
            verify_all: true,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files_known(&self) -> usize {
        self.files.len()
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    pub fn ledger_entry(&self, path: &Path) -> Option<&FileLedgerEntry> {
        self.ledger.get(path)
    }

    /// Committed ledger entries, in file order where the file is known.
    pub fn ledger_entries(&self) -> Vec<FileLedgerEntry> {
        let mut entries: Vec<FileLedgerEntry> = self.ledger.values().cloned().collect();
        entries.sort_by(|a, b| {
            let ka = JournalFile::from_path(a.path.clone());
            let kb = JournalFile::from_path(b.path.clone());
            ka.cmp(&kb).then_with(|| a.path.cmp(&b.path))
        });
        entries
    }

    /// List the directory, register new files and close superseded ones.
    pub async fn refresh(&mut self) -> Result<Discovery, TailError> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                self.files.clear();
                return Err(TailError::NoSource(self.dir.clone()));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.files.clear();
                return Err(TailError::NoSource(self.dir.clone()));
            }
            Err(source) => {
                return Err(TailError::Fatal {
                    path: self.dir.clone(),
                    source,
                })
            }
        }

        let files = list_journal_files(&self.dir)
            .await
            .map_err(|source| TailError::Fatal {
                path: self.dir.clone(),
                source,
            })?;

        let mut changed = Vec::new();
        let last = files.len().saturating_sub(1);
        for (idx, file) in files.iter().enumerate() {
            let superseded = idx < last;
            match self.ledger.get_mut(&file.path) {
                None => {
                    let mut entry = FileLedgerEntry::new(file.path.clone());
                    entry.fully_closed = superseded;
                    debug!(path = ?file.path, "discovered journal file");
                    self.ledger.insert(file.path.clone(), entry.clone());
                    changed.push(entry);
                }
                Some(entry) if superseded && !entry.fully_closed => {
                    entry.fully_closed = true;
                    debug!(path = ?file.path, "journal file superseded");
                    changed.push(entry.clone());
                }
                Some(_) => {}
            }
        }

        let discovery = Discovery {
            files_known: files.len(),
            newest: files.last().map(|f| f.path.clone()),
            changed,
        };
        self.files = files;
        Ok(discovery)
    }

    /// Re-check the ledger against the directory: entries whose file is gone
    /// are closed, pending retries are cleared and every file is stat'ed on
    /// the next pass.
    pub async fn revalidate(&mut self) -> Result<Discovery, TailError> {
        self.retries.clear();
        self.verify_all = true;

        let mut discovery = self.refresh().await?;
        let present: Vec<&PathBuf> = self.files.iter().map(|f| &f.path).collect();
        for entry in self.ledger.values_mut() {
            if !present.contains(&&entry.path) && !entry.fully_closed {
                warn!(path = ?entry.path, "journal file no longer present; closing");
                entry.fully_closed = true;
                discovery.changed.push(entry.clone());
            }
        }
        Ok(discovery)
    }

    /// Read the oldest file with uncommitted complete lines.
    ///
    /// Returns `Ok(None)` when every file is caught up, or when the next file
    /// in order is waiting out a retry backoff; later files are never read
    /// ahead of an earlier one.
    pub async fn next_batch(&mut self) -> Result<Option<ReadBatch>, TailError> {
        let last = self.files.len().saturating_sub(1);
        for idx in 0..self.files.len() {
            let path = self.files[idx].path.clone();
            let superseded = idx < last;
            let entry = self
                .ledger
                .get(&path)
                .cloned()
                .unwrap_or_else(|| FileLedgerEntry::new(path.clone()));

            if !self.verify_all && is_settled(&entry) {
                continue;
            }

            if let Some(retry) = self.retries.get(&path) {
                if Instant::now() < retry.not_before {
                    debug!(path = ?path, attempts = retry.attempts, "journal file in backoff");
                    return Ok(None);
                }
            }

            match self.read_file(&entry, superseded).await {
                Ok(Some(batch)) => {
                    self.retries.remove(&path);
                    return Ok(Some(batch));
                }
                Ok(None) => {
                    self.retries.remove(&path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = ?path, "journal file vanished before it could be read");
                }
                Err(source) => {
                    let attempts = self.retries.get(&path).map_or(0, |r| r.attempts) + 1;
                    let delay = self.options.retry.delay(attempts);
                    warn!(path = ?path, attempts, delay_ms = delay.as_millis() as u64, error = %source, "journal file unreadable; backing off");
                    self.retries.insert(
                        path.clone(),
                        RetryState {
                            attempts,
                            not_before: Instant::now() + delay,
                        },
                    );
                    return Err(TailError::Transient { path, source });
                }
            }
        }
        self.verify_all = false;
        Ok(None)
    }

    /// Adopt a batch's ledger entry once its fold has been persisted.
    pub fn commit(&mut self, batch: &ReadBatch) {
        self.parse_failures += batch.failures.len() as u64;
        self.ledger.insert(batch.path.clone(), batch.entry.clone());
    }

    /// Forget a batch whose fold could not be persisted.
    pub fn rollback(&mut self, batch: &ReadBatch) {
        self.next_sequence = batch.first_sequence;
    }

    async fn read_file(
        &mut self,
        entry: &FileLedgerEntry,
        superseded: bool,
    ) -> io::Result<Option<ReadBatch>> {
        let mut file = tokio::fs::File::open(&entry.path).await?;
        let meta = file.metadata().await?;
        let len = meta.len();
        let mtime = meta.modified().ok().map(DateTime::<Utc>::from);

        let mut start = entry.bytes_consumed;
        // Journals only grow. Shorter than the last known size means the
        // path was replaced, even if a pending fragment kept the offset low.
        let truncated = len < entry.bytes_consumed || len < entry.size_at_last_read;
        if truncated {
            warn!(
                path = ?entry.path,
                previous = entry.size_at_last_read,
                consumed = entry.bytes_consumed,
                len,
                mtime_changed = mtime != entry.last_seen_mtime,
                "journal file shrank; re-reading from the start"
            );
            start = 0;
        }

        let first_sequence = self.next_sequence;
        let closed = entry.fully_closed || superseded;

        if len == start {
            if !truncated && entry.fully_closed == closed && entry.last_seen_mtime.is_some() {
                return Ok(None);
            }
            return Ok(Some(ReadBatch {
                path: entry.path.clone(),
                events: Vec::new(),
                failures: Vec::new(),
                entry: FileLedgerEntry {
                    path: entry.path.clone(),
                    size_at_last_read: len,
                    bytes_consumed: start,
                    fully_closed: closed,
                    last_seen_mtime: mtime,
                },
                first_sequence,
                truncated,
            }));
        }

        file.seek(io::SeekFrom::Start(start)).await?;
        let available = len - start;
        let want = available.min(self.options.max_chunk_bytes.max(1));
        let mut buf = Vec::with_capacity(want as usize);
        (&mut file).take(want).read_to_end(&mut buf).await?;
        if !buf.contains(&b'\n') && (buf.len() as u64) < available {
            // One line longer than the chunk size.
            file.read_to_end(&mut buf).await?;
        }

        let mut events = Vec::new();
        let mut failures = Vec::new();
        let mut cursor = 0usize;
        while let Some(rel) = buf[cursor..].iter().position(|&b| b == b'\n') {
            let line_end = cursor + rel;
            let end_offset = start + line_end as u64 + 1;
            self.handle_line(&buf[cursor..line_end], &entry.path, end_offset, &mut events, &mut failures);
            cursor = line_end + 1;
        }

        let read_to = start + buf.len() as u64;
        if closed && cursor < buf.len() && read_to >= len {
            // A superseded file never grows again; its unterminated tail is whole.
            self.handle_line(&buf[cursor..], &entry.path, read_to, &mut events, &mut failures);
            cursor = buf.len();
        }

        if cursor == 0 && !truncated {
            // Only an unterminated fragment so far; wait for the writer.
            return Ok(None);
        }

        Ok(Some(ReadBatch {
            path: entry.path.clone(),
            events,
            failures,
            entry: FileLedgerEntry {
                path: entry.path.clone(),
                size_at_last_read: len.max(read_to),
                bytes_consumed: start + cursor as u64,
                fully_closed: closed,
                last_seen_mtime: mtime,
            },
            first_sequence,
            truncated,
        }))
    }

    fn handle_line(
        &mut self,
        raw: &[u8],
        path: &Path,
        end_offset: u64,
        events: &mut Vec<JournalEvent>,
        failures: &mut Vec<ParseFailure>,
    ) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        if line.is_empty() {
            return;
        }
        match parse_line(line, path, end_offset, self.next_sequence) {
            Ok(event) => {
                self.next_sequence += 1;
                events.push(event);
            }
            Err(failure) => {
                debug!(path = ?path, offset = end_offset, reason = %failure.reason, "skipping unparseable journal line");
                failures.push(failure);
            }
        }
    }
}

/// A closed file that has been read to its last known size.
fn is_settled(entry: &FileLedgerEntry) -> bool {
    entry.fully_closed
        && entry.last_seen_mtime.is_some()
        && entry.bytes_consumed >= entry.size_at_last_read
}
