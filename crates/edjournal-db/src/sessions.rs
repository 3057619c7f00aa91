//! Sessions store for persistent session storage.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::MutexGuard;

use crate::quarantine::{quarantine_row, RawRow};
use crate::stats::SessionStats;
use crate::DbError;

const COLUMNS: [&str; 6] = [
    "id",
    "identity",
    "start_time",
    "end_time",
    "source_file",
    "stats",
];

const SELECT: &str = "SELECT id, identity, start_time, end_time, source_file, stats FROM sessions";

/// Stable key of a session: the journal file it started in plus its start
/// time. Re-folding the same bytes always yields the same key.
pub fn session_key(source_file: &str, start_time: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_file.as_bytes());
    hasher.update(b"|");
    hasher.update(start_time.as_bytes());
    hex::encode(hasher.finalize())
}

/// A session record. Open while `end_time` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub identity: String,
    pub start_time: String,
    pub end_time: Option<String>,
    /// File name of the journal the session started in.
    pub source_file: String,
    pub stats: SessionStats,
}

impl Session {
    pub fn new(identity: &str, start_time: &str, source_file: &str) -> Self {
        Self {
            id: session_key(source_file, start_time),
            identity: identity.to_string(),
            start_time: start_time.to_string(),
            end_time: None,
            source_file: source_file.to_string(),
            stats: SessionStats::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Stamp the end time with the last folded event time, falling back to
    /// the start time for a session that saw no timestamped event.
    pub fn close(&mut self) {
        let end = self
            .stats
            .last_event_time
            .clone()
            .unwrap_or_else(|| self.start_time.clone());
        self.end_time = Some(end);
    }
}

/// Filter parameters for listing sessions.
#[derive(Debug, Default, Clone)]
pub struct SessionFilter {
    pub identity: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Totals across closed sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRollup {
    pub total_sessions: usize,
    pub total_jumps: u64,
    pub total_light_years: f64,
    pub total_docked: u64,
    pub total_undocked: u64,
    pub total_planets_landed: u64,
    pub total_events: u64,
    pub total_credits_delta: i64,
    pub total_money_earned: i64,
    pub total_money_spent: i64,
    pub total_kills: u64,
    pub total_deaths: u64,
    /// Sessions in which the commander died at least once.
    pub sessions_with_death: usize,
    pub total_bounties: i64,
    pub total_combat_bonds: i64,
    pub total_exploration_value: i64,
    pub total_trade_profit: i64,
    pub total_mission_rewards: i64,
    pub total_systems_visited: usize,
    pub total_stations_visited: usize,
    pub total_scans: u64,
    pub total_fss_scans: u64,
    pub total_dss_scans: u64,
    pub total_codex_entries: u64,
    pub total_missions_accepted: u64,
    pub total_missions_completed: u64,
    pub total_missions_failed: u64,
    pub total_missions_abandoned: u64,
    pub first_session: Option<String>,
    pub last_session: Option<String>,
}

impl SessionRollup {
    /// Sum `sessions`, which are ordered newest first.
    pub fn from_sessions(sessions: &[Session]) -> Self {
        let mut rollup = SessionRollup {
            total_sessions: sessions.len(),
            first_session: sessions.last().map(|s| s.start_time.clone()),
            last_session: sessions.first().map(|s| s.start_time.clone()),
            ..Default::default()
        };
        let mut systems = BTreeSet::new();
        let mut stations = BTreeSet::new();
        let mut light_years = 0.0;

        for s in sessions {
            let st = &s.stats;
            rollup.total_jumps += st.travel.jumps;
            light_years += st.travel.light_years;
            rollup.total_docked += st.travel.docked;
            rollup.total_undocked += st.travel.undocked;
            rollup.total_planets_landed += st.travel.planets_landed;
            rollup.total_events += st.total_events;
            rollup.total_credits_delta = rollup.total_credits_delta.saturating_add(st.credits_delta());
            rollup.total_money_earned = rollup.total_money_earned.saturating_add(st.credits.earned);
            rollup.total_money_spent = rollup.total_money_spent.saturating_add(st.credits.spent);
            rollup.total_kills += st.combat.kills;
            rollup.total_deaths += st.combat.deaths;
            if st.died {
                rollup.sessions_with_death += 1;
            }
            rollup.total_bounties = rollup.total_bounties.saturating_add(st.combat.bounties_earned);
            rollup.total_combat_bonds = rollup.total_combat_bonds.saturating_add(st.combat.combat_bonds);
            rollup.total_exploration_value = rollup.total_exploration_value.saturating_add(st.exploration.exploration_value);
            rollup.total_trade_profit = rollup.total_trade_profit.saturating_add(st.trading.trade_profit);
            rollup.total_mission_rewards = rollup.total_mission_rewards.saturating_add(st.missions.rewards);
            rollup.total_scans += st.exploration.scans;
            rollup.total_fss_scans += st.exploration.fss_scans;
            rollup.total_dss_scans += st.exploration.dss_scans;
            rollup.total_codex_entries += st.exploration.codex_entries;
            rollup.total_missions_accepted += st.missions.accepted;
            rollup.total_missions_completed += st.missions.completed;
            rollup.total_missions_failed += st.missions.failed;
            rollup.total_missions_abandoned += st.missions.abandoned;
            systems.extend(st.systems_visited.iter().cloned());
            stations.extend(st.stations_visited.iter().cloned());
        }

        rollup.total_light_years = (light_years * 100.0).round() / 100.0;
        rollup.total_systems_visited = systems.len();
        rollup.total_stations_visited = stations.len();
        rollup
    }
}

/// Sessions store with a borrowed connection.
pub struct Sessions<'db> {
    conn: MutexGuard<'db, Connection>,
}

impl<'db> Sessions<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    /// Insert or update a session keyed by its id.
    pub fn upsert(&self, session: &Session) -> Result<(), DbError> {
        upsert(&self.conn, session)
    }

    /// Look up one session, open or closed. An unreadable row is
    /// quarantined and reported as [`DbError::Corrupt`].
    pub fn get(&self, id: &str) -> Result<Option<Session>, DbError> {
        let raw = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT),
                params![id],
                |row| RawRow::read(row, &COLUMNS),
            )
            .optional()?;
        let Some(row) = raw else {
            return Ok(None);
        };
        match decode(&row) {
            Ok(session) => Ok(Some(session)),
            Err(reason) => {
                quarantine_row(&self.conn, "sessions", "id", &row, &reason)?;
                Err(DbError::Corrupt {
                    table: "sessions",
                    key: row.key,
                    reason,
                })
            }
        }
    }

    /// List closed sessions matching the filter, newest first.
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, DbError> {
        let mut sql = format!("{} WHERE end_time IS NOT NULL", SELECT);
        let mut param_values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref identity) = filter.identity {
            sql.push_str(" AND identity = ?");
            param_values.push(Box::new(identity.clone()));
        }

        if let Some(after) = filter.after {
            sql.push_str(" AND start_time >= ?");
            param_values.push(Box::new(after.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }

        if let Some(before) = filter.before {
            sql.push_str(" AND start_time <= ?");
            param_values.push(Box::new(before.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }

        sql.push_str(" ORDER BY start_time DESC, id");

        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let params: Vec<&dyn rusqlite::ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let raw = self.query_raw(&sql, params.as_slice())?;
        self.decode_all(raw)
    }

    /// Sessions checkpointed while open, oldest first. Non-empty only after
    /// the process stopped without closing them.
    pub fn load_open(&self) -> Result<Vec<Session>, DbError> {
        let sql = format!("{} WHERE end_time IS NULL ORDER BY start_time, id", SELECT);
        let raw = self.query_raw(&sql, &[])?;
        self.decode_all(raw)
    }

    /// Aggregate statistics over closed sessions matching the filter.
    pub fn rollup(&self, filter: &SessionFilter) -> Result<SessionRollup, DbError> {
        let unlimited = SessionFilter {
            limit: None,
            ..filter.clone()
        };
        let sessions = self.list(&unlimited)?;
        Ok(SessionRollup::from_sessions(&sessions))
    }

    /// Distinct identities with at least one session.
    pub fn identities(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT identity FROM sessions ORDER BY identity")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut identities = Vec::new();
        for row in rows {
            identities.push(row?);
        }
        Ok(identities)
    }

    pub fn count(&self) -> Result<usize, DbError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    // Helper methods

    fn query_raw(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<RawRow>, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| RawRow::read(row, &COLUMNS))?;
        let mut raw = Vec::new();
        for row in rows {
            raw.push(row?);
        }
        Ok(raw)
    }

    /// Decode rows, quarantining any that cannot be read.
    fn decode_all(&self, raw: Vec<RawRow>) -> Result<Vec<Session>, DbError> {
        let mut sessions = Vec::with_capacity(raw.len());
        for row in raw {
            match decode(&row) {
                Ok(session) => sessions.push(session),
                Err(reason) => quarantine_row(&self.conn, "sessions", "id", &row, &reason)?,
            }
        }
        Ok(sessions)
    }
}

/// A stored end time survives an upsert of the same session still open: a
/// replay rebuilds sessions that already closed, and they stay closed.
pub(crate) fn upsert(conn: &Connection, session: &Session) -> Result<(), DbError> {
    let stats = serde_json::to_string(&session.stats)?;
    conn.execute(
        r#"
        INSERT INTO sessions (
            id, identity, start_time, end_time, source_file,
            jumps, light_years, total_events, credits_delta, stats, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            identity = excluded.identity,
            end_time = COALESCE(excluded.end_time, sessions.end_time),
            jumps = excluded.jumps,
            light_years = excluded.light_years,
            total_events = excluded.total_events,
            credits_delta = excluded.credits_delta,
            stats = excluded.stats,
            updated_at = excluded.updated_at
        "#,
        params![
            session.id,
            session.identity,
            session.start_time,
            session.end_time,
            session.source_file,
            session.stats.travel.jumps as i64,
            session.stats.travel.light_years,
            session.stats.total_events as i64,
            session.stats.credits_delta(),
            stats,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn text(row: &RawRow, column: &str) -> Result<String, String> {
    match row.get(column) {
        Some(SqlValue::Text(s)) => Ok(s.clone()),
        other => Err(format!("invalid {} {:?}", column, other)),
    }
}

fn decode(row: &RawRow) -> Result<Session, String> {
    let end_time = match row.get("end_time") {
        None | Some(SqlValue::Null) => None,
        Some(SqlValue::Text(s)) => Some(s.clone()),
        other => return Err(format!("invalid end_time {:?}", other)),
    };
    let stats_json = text(row, "stats")?;
    let stats: SessionStats =
        serde_json::from_str(&stats_json).map_err(|e| format!("unreadable stats: {}", e))?;
    Ok(Session {
        id: text(row, "id")?,
        identity: text(row, "identity")?,
        start_time: text(row, "start_time")?,
        end_time,
        source_file: text(row, "source_file")?,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn closed(identity: &str, start: &str, end: &str, jumps: u64) -> Session {
        let mut s = Session::new(identity, start, "Journal.2024-05-01T120000.01.log");
        s.stats.travel.jumps = jumps;
        s.stats.last_event_time = Some(end.to_string());
        s.close();
        s
    }

    #[test]
    fn test_session_key_is_stable_and_distinct() {
        let a = session_key("Journal.a.log", "2024-05-01T12:00:00Z");
        assert_eq!(a, session_key("Journal.a.log", "2024-05-01T12:00:00Z"));
        assert_ne!(a, session_key("Journal.b.log", "2024-05-01T12:00:00Z"));
        assert_ne!(a, session_key("Journal.a.log", "2024-05-01T12:00:01Z"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_close_uses_last_event_time() {
        let mut s = Session::new("Jameson", "T0", "Journal.a.log");
        s.close();
        assert_eq!(s.end_time.as_deref(), Some("T0"));

        let mut s = Session::new("Jameson", "T0", "Journal.a.log");
        s.stats.last_event_time = Some("T1".to_string());
        s.close();
        assert_eq!(s.end_time.as_deref(), Some("T1"));
    }

    #[test]
    fn test_upsert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let mut session = closed("Jameson", "2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z", 3);
        session.stats.systems_visited.insert("Sol".to_string());
        db.sessions().unwrap().upsert(&session).unwrap();

        let loaded = db.sessions().unwrap().get(&session.id).unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let session = closed("Jameson", "2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z", 3);
        let store = db.sessions().unwrap();
        store.upsert(&session).unwrap();
        store.upsert(&session).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_open_upsert_keeps_stored_end_time() {
        let db = Database::open_in_memory().unwrap();
        let session = closed("Jameson", "2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z", 3);
        let store = db.sessions().unwrap();
        store.upsert(&session).unwrap();

        let mut replayed = session.clone();
        replayed.end_time = None;
        replayed.stats.travel.jumps = 2;
        store.upsert(&replayed).unwrap();

        let stored = store.get(&session.id).unwrap().unwrap();
        assert_eq!(stored.end_time.as_deref(), Some("2024-05-01T13:00:00Z"));
        assert_eq!(stored.stats.travel.jumps, 2);
        assert!(store.load_open().unwrap().is_empty());
    }

    #[test]
    fn test_list_filters_and_orders() {
        let db = Database::open_in_memory().unwrap();
        let store = db.sessions().unwrap();
        store.upsert(&closed("Jameson", "2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z", 1)).unwrap();
        store.upsert(&closed("Jameson", "2024-05-03T12:00:00Z", "2024-05-03T13:00:00Z", 2)).unwrap();
        store.upsert(&closed("Harper", "2024-05-02T12:00:00Z", "2024-05-02T13:00:00Z", 4)).unwrap();
        store.upsert(&Session::new("Jameson", "2024-05-04T12:00:00Z", "Journal.x.log")).unwrap();

        let all = store.list(&SessionFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].start_time, "2024-05-03T12:00:00Z");

        let jameson = store
            .list(&SessionFilter {
                identity: Some("Jameson".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(jameson.len(), 2);

        let after = store
            .list(&SessionFilter {
                after: Some("2024-05-02T00:00:00Z".parse().unwrap()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(after.len(), 2);

        let limited = store
            .list(&SessionFilter {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);

        assert_eq!(store.load_open().unwrap().len(), 1);
        assert_eq!(store.identities().unwrap(), vec!["Harper", "Jameson"]);
    }

    #[test]
    fn test_rollup_sums_and_counts_distinct_places() {
        let mut a = closed("Jameson", "2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z", 2);
        a.stats.travel.light_years = 10.004;
        a.stats.systems_visited.extend(["Sol".to_string(), "Achenar".to_string()]);
        a.stats.credits.first_balance = Some(100);
        a.stats.credits.last_balance = Some(300);
        let mut b = closed("Jameson", "2024-05-02T12:00:00Z", "2024-05-02T13:00:00Z", 1);
        b.stats.travel.light_years = 5.0;
        b.stats.systems_visited.insert("Sol".to_string());
        b.stats.combat.deaths = 1;
        b.stats.died = true;

        let db = Database::open_in_memory().unwrap();
        let store = db.sessions().unwrap();
        store.upsert(&a).unwrap();
        store.upsert(&b).unwrap();

        let rollup = store.rollup(&SessionFilter::default()).unwrap();
        assert_eq!(rollup.total_sessions, 2);
        assert_eq!(rollup.total_jumps, 3);
        assert_eq!(rollup.total_light_years, 15.0);
        assert_eq!(rollup.total_systems_visited, 2);
        assert_eq!(rollup.total_credits_delta, 200);
        assert_eq!(rollup.total_deaths, 1);
        assert_eq!(rollup.sessions_with_death, 1);
        assert_eq!(rollup.first_session.as_deref(), Some("2024-05-01T12:00:00Z"));
        assert_eq!(rollup.last_session.as_deref(), Some("2024-05-02T12:00:00Z"));
    }

    #[test]
    fn test_rollup_saturates_extreme_credits() {
        let mut a = closed("Jameson", "2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z", 0);
        a.stats.credits.first_balance = Some(-i64::MAX);
        a.stats.credits.last_balance = Some(i64::MAX);
        a.stats.credits.earned = i64::MAX;
        a.stats.combat.bounties_earned = i64::MAX;
        let b = a.clone();

        assert_eq!(a.stats.credits_delta(), i64::MAX);
        let rollup = SessionRollup::from_sessions(&[a, b]);
        assert_eq!(rollup.total_credits_delta, i64::MAX);
        assert_eq!(rollup.total_money_earned, i64::MAX);
        assert_eq!(rollup.total_bounties, i64::MAX);
    }

    #[test]
    fn test_get_reports_corrupt_row() {
        let db = Database::open_in_memory().unwrap();
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO sessions (id, identity, start_time, end_time, source_file, stats, updated_at) VALUES ('bad', 'Jameson', 'T0', NULL, 'Journal.a.log', '[]', 'now')",
                [],
            )
            .unwrap();
        }
        let err = db.sessions().unwrap().get("bad").unwrap_err();
        assert!(matches!(err, DbError::Corrupt { table: "sessions", .. }));
        assert!(db.sessions().unwrap().get("bad").unwrap().is_none());
        assert_eq!(db.quarantine().unwrap().count().unwrap(), 1);
    }

    #[test]
    fn test_rollup_of_nothing_is_zero() {
        let db = Database::open_in_memory().unwrap();
        let rollup = db.sessions().unwrap().rollup(&SessionFilter::default()).unwrap();
        assert_eq!(rollup, SessionRollup::default());
    }

    #[test]
    fn test_corrupt_stats_are_quarantined() {
        let db = Database::open_in_memory().unwrap();
        db.sessions()
            .unwrap()
            .upsert(&closed("Jameson", "2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z", 1))
            .unwrap();
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO sessions (id, identity, start_time, end_time, source_file, stats, updated_at) VALUES ('broken', 'Jameson', 'T0', 'T1', 'Journal.a.log', '{not json', 'now')",
                [],
            )
            .unwrap();
        }

        let list = db.sessions().unwrap().list(&SessionFilter::default()).unwrap();
        assert_eq!(list.len(), 1);
        assert!(db.sessions().unwrap().get("broken").unwrap().is_none());
        let quarantined = db.quarantine().unwrap().list().unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].row_key, "broken");
        assert_eq!(db.sessions().unwrap().count().unwrap(), 1);
    }
}
