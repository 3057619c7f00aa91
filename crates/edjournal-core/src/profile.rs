//! Profile store seam.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use edjournal_db::Session;
use edjournal_journal::JournalEvent;
use serde::{Deserialize, Serialize};

pub const DEFAULT_RECENT_EVENTS: usize = 100;

/// Receives every folded event and every closed session. Calls happen on
/// the ingestion worker after the fold is committed and must return
/// quickly.
pub trait ProfileSink: Send + Sync {
    fn on_event(&self, identity: &str, event: &JournalEvent);

    fn on_session_closed(&self, identity: &str, session: &Session);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProfileSink;

impl ProfileSink for NoopProfileSink {
    fn on_event(&self, _identity: &str, _event: &JournalEvent) {}

    fn on_session_closed(&self, _identity: &str, _session: &Session) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentEvent {
    pub event_type: String,
    pub timestamp: String,
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct IdentityProfile {
    recent: VecDeque<RecentEvent>,
    sessions_closed: u64,
    last_session: Option<String>,
}

/// Keeps a capped list of recent events per identity.
#[derive(Debug)]
pub struct RecentEvents {
    cap: usize,
    profiles: Mutex<HashMap<String, IdentityProfile>>,
}

impl Default for RecentEvents {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_EVENTS)
    }
}

impl RecentEvents {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            profiles: Mutex::new(HashMap::new()),
        }
    }

    /// Most recent first.
    pub fn recent(&self, identity: &str) -> Vec<RecentEvent> {
        self.profiles
            .lock()
            .ok()
            .and_then(|p| p.get(identity).map(|p| p.recent.iter().rev().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn sessions_closed(&self, identity: &str) -> u64 {
        self.profiles
            .lock()
            .ok()
            .and_then(|p| p.get(identity).map(|p| p.sessions_closed))
            .unwrap_or(0)
    }

    pub fn last_session(&self, identity: &str) -> Option<String> {
        self.profiles
            .lock()
            .ok()
            .and_then(|p| p.get(identity).and_then(|p| p.last_session.clone()))
    }
}

impl ProfileSink for RecentEvents {
    fn on_event(&self, identity: &str, event: &JournalEvent) {
        let Ok(mut profiles) = self.profiles.lock() else {
            return;
        };
        let profile = profiles.entry(identity.to_string()).or_default();
        if profile.recent.len() == self.cap {
            profile.recent.pop_front();
        }
        profile.recent.push_back(RecentEvent {
            event_type: event.event_type.clone(),
            timestamp: event.timestamp.clone(),
            sequence: event.sequence,
        });
    }

    fn on_session_closed(&self, identity: &str, session: &Session) {
        let Ok(mut profiles) = self.profiles.lock() else {
            return;
        };
        let profile = profiles.entry(identity.to_string()).or_default();
        profile.sessions_closed += 1;
        profile.last_session = Some(session.id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests::event;
    use serde_json::json;

    #[test]
    fn recent_events_are_capped_per_identity() {
        let sink = RecentEvents::new(3);
        for i in 0..5 {
            let mut e = event(json!({"event": "Scan", "timestamp": format!("T{i}")}));
            e.sequence = i;
            sink.on_event("Jameson", &e);
        }
        sink.on_event("Harper", &event(json!({"event": "Docked"})));

        let recent = sink.recent("Jameson");
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].timestamp, "T4");
        assert_eq!(recent[2].timestamp, "T2");
        assert_eq!(sink.recent("Harper").len(), 1);
        assert!(sink.recent("Nobody").is_empty());
    }

    #[test]
    fn closed_sessions_are_counted() {
        let sink = RecentEvents::default();
        let mut session = Session::new("Jameson", "T0", "Journal.2024-05-01T120000.01.log");
        session.close();
        sink.on_session_closed("Jameson", &session);
        sink.on_session_closed("Jameson", &session);
        assert_eq!(sink.sessions_closed("Jameson"), 2);
        assert_eq!(sink.last_session("Jameson"), Some(session.id));
    }
}
