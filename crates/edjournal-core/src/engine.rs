//! Background worker and the handle the presentation layer talks to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use edjournal_db::{Database, Session, SessionFilter, SessionRollup};
use edjournal_journal::{spawn_poll_timer, DirectoryWatcher, WatchSignal};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::IngestError;
use crate::ingestor::{IngestionStatus, Ingestor};
use crate::live::LiveSessionSnapshot;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fallback directory poll, in case a notification is missed.
    pub poll_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

type LiveSlot = Option<Arc<LiveSessionSnapshot>>;

pub struct Engine;

impl Engine {
    /// Start the worker. It owns the ingestor until shutdown.
    pub fn spawn(ingestor: Ingestor, config: EngineConfig) -> EngineHandle {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(ingestor.status());
        let (live_tx, live_rx) = watch::channel(ingestor.live_snapshot().cloned().map(Arc::new));
        let db = ingestor.db().clone();
        let interrupted = ingestor.interrupt_handle();

        let worker = Worker {
            ingestor,
            rx,
            status_tx,
            live_tx,
        };
        let task = tokio::spawn(worker.run(tx.clone(), config));

        EngineHandle {
            db,
            tx,
            interrupted,
            status_rx,
            live_rx,
            task: Some(task),
        }
    }
}

struct Worker {
    ingestor: Ingestor,
    rx: mpsc::Receiver<WatchSignal>,
    status_tx: watch::Sender<IngestionStatus>,
    live_tx: watch::Sender<LiveSlot>,
}

impl Worker {
    async fn run(
        mut self,
        tx: mpsc::Sender<WatchSignal>,
        config: EngineConfig,
    ) -> Result<(), IngestError> {
        let mut watcher = DirectoryWatcher::new(self.ingestor.journal_dir().to_path_buf(), tx.clone());
        let poll = spawn_poll_timer(tx, config.poll_interval);
        info!(dir = ?self.ingestor.journal_dir(), "ingestion worker started");

        let first = self.ingestor.catch_up().await;
        self.after_step(first, &mut watcher);

        while let Some(signal) = self.rx.recv().await {
            let step = match self.coalesce(signal) {
                WatchSignal::Shutdown => break,
                WatchSignal::Rescan => self.ingestor.revalidate().await,
                WatchSignal::Changed(_) | WatchSignal::Poll => self.ingestor.catch_up().await,
            };
            self.after_step(step, &mut watcher);
        }

        watcher.stop();
        poll.abort();
        let result = self.ingestor.shutdown();
        self.publish(&watcher);
        info!("ingestion worker stopped");
        result
    }

    /// Fold queued signals into one: shutdown wins, then rescan.
    fn coalesce(&mut self, first: WatchSignal) -> WatchSignal {
        let mut signal = first;
        while let Ok(next) = self.rx.try_recv() {
            match next {
                WatchSignal::Shutdown => return WatchSignal::Shutdown,
                WatchSignal::Rescan => signal = WatchSignal::Rescan,
                _ => {}
            }
        }
        signal
    }

    fn after_step(&mut self, step: Result<u64, IngestError>, watcher: &mut DirectoryWatcher) {
        match step {
            Ok(0) => {}
            Ok(folded) => debug!(folded, "caught up"),
            Err(err) if err.is_store_failure() => {
                error!(error = %err, "session store unavailable; retrying on the next signal")
            }
            Err(err) => warn!(error = %err, "ingestion step failed; retrying on the next signal"),
        }
        if self.ingestor.status().directory_present {
            watcher.ensure_watching();
        } else {
            watcher.stop();
        }
        self.publish(watcher);
    }

    fn publish(&mut self, watcher: &DirectoryWatcher) {
        self.ingestor.set_dropped_notifications(watcher.dropped_events());
        self.status_tx.send_replace(self.ingestor.status());
        if self.ingestor.take_live_changes() {
            let snapshot = self.ingestor.live_snapshot().cloned().map(Arc::new);
            self.live_tx.send_replace(snapshot);
        }
    }
}

/// Reader side of the live snapshot. A new publication marks it dirty;
/// reading clears the flag.
#[derive(Debug, Clone)]
pub struct LiveView {
    rx: watch::Receiver<LiveSlot>,
}

impl LiveView {
    pub fn is_dirty(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    pub fn read(&mut self) -> LiveSlot {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the next publication. `false` once the engine is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Presentation-facing interface to a running engine. Reads never wait on
/// the worker.
pub struct EngineHandle {
    db: Arc<Database>,
    tx: mpsc::Sender<WatchSignal>,
    interrupted: Arc<AtomicBool>,
    status_rx: watch::Receiver<IngestionStatus>,
    live_rx: watch::Receiver<LiveSlot>,
    task: Option<JoinHandle<Result<(), IngestError>>>,
}

impl EngineHandle {
    /// Closed sessions, newest first.
    pub fn list_closed_sessions(&self, identity: Option<&str>) -> Result<Vec<Session>, IngestError> {
        self.list_sessions(&SessionFilter {
            identity: identity.map(str::to_string),
            ..Default::default()
        })
    }

    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>, IngestError> {
        Ok(self.db.sessions()?.list(filter)?)
    }

    pub fn aggregate_statistics(&self, identity: Option<&str>) -> Result<SessionRollup, IngestError> {
        let filter = SessionFilter {
            identity: identity.map(str::to_string),
            ..Default::default()
        };
        Ok(self.db.sessions()?.rollup(&filter)?)
    }

    /// The open session's snapshot, if it belongs to `identity`.
    pub fn live_snapshot(&self, identity: &str) -> Option<Arc<LiveSessionSnapshot>> {
        self.live_rx
            .borrow()
            .as_ref()
            .filter(|s| s.identity == identity)
            .cloned()
    }

    pub fn live_view(&self) -> LiveView {
        LiveView {
            rx: self.live_rx.clone(),
        }
    }

    /// Ask the worker to re-validate the ledger against the directory.
    /// `false` if the request could not be queued.
    pub fn force_rescan(&self) -> bool {
        self.tx.try_send(WatchSignal::Rescan).is_ok()
    }

    pub fn ingestion_status(&self) -> IngestionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_updates(&self) -> watch::Receiver<IngestionStatus> {
        self.status_rx.clone()
    }

    /// Stop listening, let the in-flight batch finish, close the open
    /// session and commit it.
    pub async fn shutdown(mut self) -> Result<(), IngestError> {
        self.interrupted.store(true, Ordering::SeqCst);
        let _ = self.tx.send(WatchSignal::Shutdown).await;
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| IngestError::WorkerStopped(e.to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.interrupted.store(true, Ordering::SeqCst);
            let _ = self.tx.try_send(WatchSignal::Shutdown);
        }
    }
}
