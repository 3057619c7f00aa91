//! Session segmentation of the ordered event stream.

use edjournal_db::Session;
use edjournal_journal::JournalEvent;

use crate::rules::fold_stats;

/// The event type that starts a session.
pub const SESSION_OPENING_EVENT: &str = "LoadGame";

/// Identity named by a session-opening event, if `event` is one.
pub fn opening_identity(event: &JournalEvent) -> Option<&str> {
    if event.event_type != SESSION_OPENING_EVENT {
        return None;
    }
    event.str_field("Commander").filter(|c| !c.trim().is_empty())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ReconstructorState {
    #[default]
    NoOpenSession,
    SessionOpen(Session),
}

/// What folding one event did to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome {
    /// No session was open; the event is not attributed to anyone.
    Orphaned,
    /// A new session was opened. The previously open one, if any, was
    /// closed and is returned for commit.
    Opened { closed: Option<Session> },
    /// Folded into the open session.
    Folded,
}

/// Segments the stream into sessions and folds each event into the open
/// one. Events are folded strictly in the order they are given.
#[derive(Debug, Clone, Default)]
pub struct SessionReconstructor {
    state: ReconstructorState,
    orphaned: u64,
}

impl SessionReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue a session that was checkpointed open before a crash.
    pub fn resume(session: Session) -> Self {
        Self {
            state: ReconstructorState::SessionOpen(session),
            orphaned: 0,
        }
    }

    pub fn state(&self) -> &ReconstructorState {
        &self.state
    }

    pub fn open_session(&self) -> Option<&Session> {
        match &self.state {
            ReconstructorState::SessionOpen(session) => Some(session),
            ReconstructorState::NoOpenSession => None,
        }
    }

    pub fn identity(&self) -> Option<&str> {
        self.open_session().map(|s| s.identity.as_str())
    }

    /// Events seen while no session was open.
    pub fn orphaned_events(&self) -> u64 {
        self.orphaned
    }

    pub fn fold(&mut self, event: &JournalEvent) -> FoldOutcome {
        if let Some(identity) = opening_identity(event) {
            let mut session = Session::new(identity, &event.timestamp, &event.source_name());
            fold_stats(&mut session.stats, event);
            let previous = std::mem::replace(
                &mut self.state,
                ReconstructorState::SessionOpen(session),
            );
            let closed = match previous {
                ReconstructorState::SessionOpen(mut open) => {
                    open.close();
                    Some(open)
                }
                ReconstructorState::NoOpenSession => None,
            };
            return FoldOutcome::Opened { closed };
        }

        match &mut self.state {
            ReconstructorState::SessionOpen(session) => {
                fold_stats(&mut session.stats, event);
                FoldOutcome::Folded
            }
            ReconstructorState::NoOpenSession => {
                self.orphaned += 1;
                FoldOutcome::Orphaned
            }
        }
    }

    /// Close the open session, stamping it with its last folded event time.
    pub fn close(&mut self) -> Option<Session> {
        match std::mem::take(&mut self.state) {
            ReconstructorState::SessionOpen(mut session) => {
                session.close();
                Some(session)
            }
            ReconstructorState::NoOpenSession => None,
        }
    }
}
