use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::files::is_journal_path;

/// Everything that can wake the ingestion worker, merged into one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    /// A journal file was created or written.
    Changed(PathBuf),
    /// Fallback poll tick, in case a notification was missed.
    Poll,
    /// Re-validate the ledger against the directory.
    Rescan,
    Shutdown,
}

/// Forwards change notifications for journal files in one directory.
///
/// The directory may not exist yet; call [`DirectoryWatcher::ensure_watching`]
/// on every poll tick and the watch is attached once it appears.
pub struct DirectoryWatcher {
    dir: PathBuf,
    tx: mpsc::Sender<WatchSignal>,
    watcher: Option<RecommendedWatcher>,
    dropped: Arc<AtomicU64>,
}

impl DirectoryWatcher {
    pub fn new(dir: PathBuf, tx: mpsc::Sender<WatchSignal>) -> Self {
        Self {
            dir,
            tx,
            watcher: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Notifications lost because the worker's channel was full. The poll
    /// tick catches up on them.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Attach the notification source if the directory exists.
    pub fn ensure_watching(&mut self) -> bool {
        if self.watcher.is_some() {
            return true;
        }
        if !self.dir.is_dir() {
            return false;
        }
        match self.start() {
            Ok(watcher) => {
                info!(dir = ?self.dir, "watching journal directory");
                self.watcher = Some(watcher);
                true
            }
            Err(e) => {
                warn!(dir = ?self.dir, error = %e, "could not watch journal directory; relying on polling");
                false
            }
        }
    }

    /// Drop the notification source, e.g. after the directory vanished.
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!(dir = ?self.dir, "stopped watching journal directory");
        }
    }

    fn start(&self) -> notify::Result<RecommendedWatcher> {
        let tx = self.tx.clone();
        let dropped = self.dropped.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => forward(&tx, &dropped, event),
            Err(e) => error!("journal watcher error: {}", e),
        })?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }
}

fn forward(tx: &mpsc::Sender<WatchSignal>, dropped: &AtomicU64, event: Event) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    for path in event.paths.into_iter().filter(|p| is_journal_path(p)) {
        if tx.try_send(WatchSignal::Changed(path)).is_err() {
            let count = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if count == 1 || count % 100 == 0 {
                warn!(dropped_total = count, "journal watcher channel full; event dropped");
            }
        }
    }
}

/// Send [`WatchSignal::Poll`] every `period` until the receiver is gone or
/// the returned task is aborted.
pub fn spawn_poll_timer(tx: mpsc::Sender<WatchSignal>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match tx.try_send(WatchSignal::Poll) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    #[test]
    fn forwards_only_journal_creates_and_writes() {
        let (tx, mut rx) = mpsc::channel(8);
        let dropped = AtomicU64::new(0);

        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/j/Journal.2024-01-01T000000.01.log"))
            .add_path(PathBuf::from("/j/Status.json"));
        forward(&tx, &dropped, create);

        let remove = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/j/Journal.2024-01-01T000000.01.log"));
        forward(&tx, &dropped, remove);

        assert_eq!(
            rx.try_recv().unwrap(),
            WatchSignal::Changed(PathBuf::from("/j/Journal.2024-01-01T000000.01.log"))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn counts_events_dropped_on_a_full_channel() {
        let (tx, _rx) = mpsc::channel(1);
        let dropped = AtomicU64::new(0);
        for _ in 0..3 {
            let event = Event::new(EventKind::Create(CreateKind::File))
                .add_path(PathBuf::from("/j/Journal.2024-01-01T000000.01.log"));
            forward(&tx, &dropped, event);
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn poll_timer_ticks_into_the_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_poll_timer(tx, Duration::from_millis(10));
        let signal = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(signal, Some(WatchSignal::Poll));
        handle.abort();
    }
}
