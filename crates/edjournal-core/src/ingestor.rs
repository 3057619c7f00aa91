//! The single writer: reads batches from the tailer, folds them through
//! both views and commits each batch atomically.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use edjournal_db::{Checkpoint, Database, DbError, Session};
use edjournal_journal::{
    FileLedgerEntry, JournalTailer, ReadBatch, TailError, TailerOptions,
};
use edjournal_logging::{IngestEvent, Logger};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::live::{LiveSessionSnapshot, LiveSessionTracker};
use crate::profile::ProfileSink;
use crate::reconstructor::{FoldOutcome, SessionReconstructor};

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub journal_dir: PathBuf,
    pub tailer: TailerOptions,
}

impl IngestorConfig {
    pub fn new(journal_dir: PathBuf) -> Self {
        Self {
            journal_dir,
            tailer: TailerOptions::default(),
        }
    }
}

/// What the presentation layer can know about ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStatus {
    pub directory_present: bool,
    pub files_known: usize,
    /// The first catch-up finished and new lines are followed as written.
    pub live: bool,
    pub store_available: bool,
    pub parse_failures: u64,
    pub events_folded: u64,
    pub orphaned_events: u64,
    pub dropped_notifications: u64,
}

#[derive(Debug, Clone, Copy)]
enum Replay {
    Pending,
    Running { started: Instant, events: u64 },
    Done,
}

/// Work item for the profile sink, in fold order.
enum Notice {
    Event { identity: String, index: usize },
    Closed(Session),
}

pub struct Ingestor {
    db: Arc<Database>,
    config: IngestorConfig,
    tailer: JournalTailer,
    reconstructor: SessionReconstructor,
    live: LiveSessionTracker,
    sink: Arc<dyn ProfileSink>,
    logger: Arc<Logger>,
    status: IngestionStatus,
    replay: Replay,
    missing_reported: bool,
    current_file: Option<PathBuf>,
    interrupted: Arc<AtomicBool>,
}

impl Ingestor {
    /// Load the committed ledger and resume a session left open by a crash.
    pub fn open(
        db: Arc<Database>,
        config: IngestorConfig,
        sink: Arc<dyn ProfileSink>,
        logger: Arc<Logger>,
    ) -> Result<Self, IngestError> {
        let ledger = db.ledger()?.load_all()?;
        let mut open = db.sessions()?.load_open()?;

        // Oldest first; only the newest can still be receiving events.
        let resumed = open.pop();
        if !open.is_empty() {
            let stale: Vec<Session> = open
                .into_iter()
                .map(|mut s| {
                    s.close();
                    s
                })
                .collect();
            warn!(count = stale.len(), "closing sessions left open by an earlier crash");
            db.commit_checkpoint(&Checkpoint {
                sessions: stale,
                ledger: Vec::new(),
            })?;
        }

        let (reconstructor, live) = match resumed {
            Some(session) => {
                info!(identity = %session.identity, session_id = %session.id, "resuming open session");
                let live = LiveSessionTracker::resume(&session);
                (SessionReconstructor::resume(session), live)
            }
            None => (SessionReconstructor::new(), LiveSessionTracker::new()),
        };

        let tailer = JournalTailer::new(config.journal_dir.clone(), ledger, config.tailer);
        Ok(Self {
            db,
            config,
            tailer,
            reconstructor,
            live,
            sink,
            logger,
            status: IngestionStatus {
                store_available: true,
                ..Default::default()
            },
            replay: Replay::Pending,
            missing_reported: false,
            current_file: None,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn journal_dir(&self) -> &Path {
        &self.config.journal_dir
    }

    pub fn status(&self) -> IngestionStatus {
        self.status.clone()
    }

    pub fn reconstructor(&self) -> &SessionReconstructor {
        &self.reconstructor
    }

    pub fn live_snapshot(&self) -> Option<&LiveSessionSnapshot> {
        self.live.snapshot()
    }

    /// Whether the live snapshot changed since the last call.
    pub fn take_live_changes(&mut self) -> bool {
        self.live.take_dirty()
    }

    /// Committed read progress, in file order.
    pub fn ledger_entries(&self) -> Vec<FileLedgerEntry> {
        self.tailer.ledger_entries()
    }

    /// Set to stop a catch-up between batches.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub(crate) fn set_dropped_notifications(&mut self, dropped: u64) {
        self.status.dropped_notifications = dropped;
    }

    /// Read and fold everything written since the last committed offset.
    /// Returns the number of events folded.
    pub async fn catch_up(&mut self) -> Result<u64, IngestError> {
        let discovery = match self.tailer.refresh().await {
            Ok(discovery) => discovery,
            Err(TailError::NoSource(_)) => {
                self.source_lost();
                return Ok(0);
            }
            Err(err) => {
                self.source_lost();
                return Err(err.into());
            }
        };
        self.source_found(discovery.files_known);

        let mut pending: Vec<PathBuf> = discovery.changed.into_iter().map(|e| e.path).collect();
        let mut folded = 0;
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                debug!("catch-up interrupted");
                break;
            }
            match self.tailer.next_batch().await {
                Ok(Some(batch)) => {
                    pending.retain(|p| p != &batch.path);
                    folded += self.apply_batch(batch)?;
                }
                Ok(None) => break,
                // Backing off; the file is retried on a later pass.
                Err(TailError::Transient { .. }) => break,
                Err(TailError::NoSource(_)) => {
                    self.source_lost();
                    return Ok(folded);
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.persist_ledger(&pending)?;

        if !self.interrupted.load(Ordering::SeqCst) {
            self.enter_live();
        }
        Ok(folded)
    }

    /// Re-check the ledger against the directory, then catch up.
    pub async fn revalidate(&mut self) -> Result<u64, IngestError> {
        match self.tailer.revalidate().await {
            Ok(discovery) => {
                let paths: Vec<PathBuf> = discovery.changed.into_iter().map(|e| e.path).collect();
                self.persist_ledger(&paths)?;
            }
            Err(TailError::NoSource(_)) => {
                self.source_lost();
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        }
        self.catch_up().await
    }

    /// Zero every committed offset and forget the in-memory sessions, so the
    /// next catch-up replays every file from the start.
    pub fn reset(&mut self) -> Result<usize, IngestError> {
        let reset = self.db.ledger()?.reset_all()?;
        let ledger = self.db.ledger()?.load_all()?;
        info!(files = reset, "ledger reset; replaying all journal files");
        self.tailer = JournalTailer::new(self.config.journal_dir.clone(), ledger, self.config.tailer);
        self.reconstructor = SessionReconstructor::new();
        self.live = LiveSessionTracker::new();
        self.replay = Replay::Pending;
        self.current_file = None;
        self.status.live = false;
        self.status.directory_present = false;
        Ok(reset)
    }

    /// Close the open session at its last event time and commit it.
    pub fn shutdown(&mut self) -> Result<(), IngestError> {
        if let Some(session) = self.reconstructor.close() {
            self.live.close();
            let checkpoint = Checkpoint {
                sessions: vec![session.clone()],
                ledger: Vec::new(),
            };
            if let Err(err) = self.db.commit_checkpoint(&checkpoint) {
                // Still open in the store; resumed on the next start.
                self.store_failed(&err);
                return Err(err.into());
            }
            self.sink.on_session_closed(&session.identity, &session);
            self.log_closed(&session);
        }
        self.status.live = false;
        self.logger.log(&IngestEvent::ShutdownComplete {
            events: self.status.events_folded,
        });
        Ok(())
    }

    fn apply_batch(&mut self, batch: ReadBatch) -> Result<u64, IngestError> {
        if self.current_file.as_ref() != Some(&batch.path) && !batch.events.is_empty() {
            let offset = self
                .tailer
                .ledger_entry(&batch.path)
                .map_or(0, |e| if batch.truncated { 0 } else { e.bytes_consumed });
            self.logger.log(&IngestEvent::FileOpened {
                path: batch.path.clone(),
                offset,
            });
            self.current_file = Some(batch.path.clone());
        }

        let reconstructor_before = self.reconstructor.clone();
        let live_before = self.live.clone();

        let mut notices = Vec::with_capacity(batch.events.len());
        let mut opened = Vec::new();
        let mut closed = Vec::new();
        for (index, event) in batch.events.iter().enumerate() {
            let outcome = self.reconstructor.fold(event);
            self.live.fold(event, &outcome, self.reconstructor.open_session());
            match outcome {
                FoldOutcome::Orphaned => continue,
                FoldOutcome::Opened { closed: previous } => {
                    if let Some(previous) = previous {
                        closed.push(previous.clone());
                        notices.push(Notice::Closed(previous));
                    }
                    if let Some(session) = self.reconstructor.open_session() {
                        opened.push(session.clone());
                    }
                }
                FoldOutcome::Folded => {}
            }
            if let Some(identity) = self.reconstructor.identity() {
                notices.push(Notice::Event {
                    identity: identity.to_string(),
                    index,
                });
            }
        }

        let mut sessions = closed;
        if !batch.events.is_empty() {
            sessions.extend(self.reconstructor.open_session().cloned());
        }
        let checkpoint = Checkpoint {
            sessions,
            ledger: vec![batch.entry.clone()],
        };
        if let Err(err) = self.db.commit_checkpoint(&checkpoint) {
            self.reconstructor = reconstructor_before;
            self.live = live_before;
            self.tailer.rollback(&batch);
            self.store_failed(&err);
            return Err(err.into());
        }
        self.tailer.commit(&batch);
        self.store_recovered();

        for notice in notices {
            match notice {
                Notice::Event { identity, index } => {
                    self.sink.on_event(&identity, &batch.events[index])
                }
                Notice::Closed(session) => {
                    self.sink.on_session_closed(&session.identity, &session);
                    self.log_closed(&session);
                }
            }
        }
        for session in &opened {
            self.logger.log(&IngestEvent::SessionOpened {
                identity: session.identity.clone(),
                session_id: session.id.clone(),
                start_time: session.start_time.clone(),
                source_file: session.source_file.clone(),
            });
        }
        if !batch.failures.is_empty() {
            self.logger.log(&IngestEvent::ParseFailures {
                path: batch.path.clone(),
                count: batch.failures.len(),
            });
        }

        let folded = batch.events.len() as u64;
        self.status.events_folded += folded;
        self.status.parse_failures = self.tailer.parse_failures();
        self.status.orphaned_events = self.reconstructor.orphaned_events();
        if let Replay::Running { events, .. } = &mut self.replay {
            *events += folded;
        }
        Ok(folded)
    }

    /// Persist ledger entries that changed without a read, such as newly
    /// discovered or superseded files.
    fn persist_ledger(&mut self, paths: &[PathBuf]) -> Result<(), IngestError> {
        let ledger: Vec<FileLedgerEntry> = paths
            .iter()
            .filter_map(|p| self.tailer.ledger_entry(p).cloned())
            .collect();
        if ledger.is_empty() {
            return Ok(());
        }
        let checkpoint = Checkpoint {
            sessions: Vec::new(),
            ledger,
        };
        if let Err(err) = self.db.commit_checkpoint(&checkpoint) {
            self.store_failed(&err);
            return Err(err.into());
        }
        self.store_recovered();
        Ok(())
    }

    fn source_found(&mut self, files_known: usize) {
        self.status.files_known = files_known;
        if !self.status.directory_present {
            self.status.directory_present = true;
            self.missing_reported = false;
            if matches!(self.replay, Replay::Pending) {
                self.logger.log(&IngestEvent::ReplayStarted {
                    journal_dir: self.config.journal_dir.clone(),
                    files: files_known,
                });
                self.replay = Replay::Running {
                    started: Instant::now(),
                    events: 0,
                };
            }
        }
    }

    fn source_lost(&mut self) {
        self.status.directory_present = false;
        self.status.files_known = 0;
        self.status.live = false;
        if !self.missing_reported {
            self.missing_reported = true;
            self.logger.log(&IngestEvent::SourceMissing {
                journal_dir: self.config.journal_dir.clone(),
            });
        }
    }

    fn enter_live(&mut self) {
        if let Replay::Running { started, events } = self.replay {
            self.logger.log(&IngestEvent::ReplayFinished {
                events,
                parse_failures: self.tailer.parse_failures(),
                duration_secs: started.elapsed().as_secs_f64(),
            });
            self.replay = Replay::Done;
        }
        if !self.status.live {
            self.status.live = true;
            self.logger.log(&IngestEvent::LiveModeEntered {
                journal_dir: self.config.journal_dir.clone(),
            });
        }
    }

    fn store_failed(&mut self, err: &DbError) {
        warn!(error = %err, "session store commit failed; will retry");
        if self.status.store_available {
            self.status.store_available = false;
            self.logger.log(&IngestEvent::StoreUnavailable {
                error: err.to_string(),
            });
        }
    }

    fn store_recovered(&mut self) {
        if !self.status.store_available {
            self.status.store_available = true;
            self.logger.log(&IngestEvent::StoreRecovered);
        }
    }

    fn log_closed(&self, session: &Session) {
        self.logger.log(&IngestEvent::SessionClosed {
            identity: session.identity.clone(),
            session_id: session.id.clone(),
            end_time: session.end_time.clone().unwrap_or_default(),
            jumps: session.stats.travel.jumps,
            total_events: session.stats.total_events,
            credits_delta: session.stats.credits_delta(),
        });
    }
}
