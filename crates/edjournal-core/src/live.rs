//! In-memory view of the currently open session.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use edjournal_db::{Session, SessionStats};
use edjournal_journal::JournalEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reconstructor::FoldOutcome;
use crate::rules::fold_stats;

/// Rank and progress categories reported by the game.
pub const RANK_CATEGORIES: &[&str] = &[
    "Combat",
    "Trade",
    "Explore",
    "Empire",
    "Federation",
    "CQC",
    "Mercenary",
    "Exobiologist",
];

/// Map a textual reputation level onto the 0-100 scale.
pub fn reputation_level(text: &str) -> Option<f64> {
    match text.trim().to_ascii_lowercase().as_str() {
        "hostile" => Some(0.0),
        "unfriendly" => Some(25.0),
        "neutral" => Some(50.0),
        "cordial" => Some(60.0),
        "friendly" => Some(75.0),
        "allied" => Some(100.0),
        _ => None,
    }
}

/// Normalize a reputation value to 0-100. Fractions in (0, 1) are read as
/// a 0.0-1.0 scale; everything else is clamped.
pub fn normalize_reputation(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => {
            let v = n.as_f64()?;
            if !v.is_finite() {
                return None;
            }
            let scaled = if v > 0.0 && v < 1.0 { v * 100.0 } else { v };
            Some(scaled.clamp(0.0, 100.0))
        }
        Value::String(s) => reputation_level(s),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveMission {
    pub mission_id: u64,
    pub name: String,
    pub faction: String,
    pub expiry: String,
    pub destination_system: String,
    pub destination_station: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactionEffect {
    pub faction: String,
    pub reputation_trend: String,
    pub reputation: String,
    /// "<influence> <trend>" per affected system.
    pub influence: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialReward {
    pub name: String,
    pub category: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionSummary {
    pub name: String,
    pub faction: String,
    pub reward: i64,
    pub faction_effects: Vec<FactionEffect>,
    pub materials_reward: Vec<MaterialReward>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerplayStatus {
    pub power: Option<String>,
    pub rank: Option<i64>,
    pub merits: Option<i64>,
    pub votes: Option<i64>,
    pub time_pledged: Option<i64>,
}

/// Per-second rates over the open session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveRates {
    pub span_secs: f64,
    pub credits_earned_per_sec: f64,
    pub credits_net_per_sec: f64,
    pub light_years_per_sec: f64,
    pub jumps_per_sec: f64,
}

/// Everything known about the open session. Published to readers as an
/// immutable copy; `version` increases with every fold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSessionSnapshot {
    pub session_id: String,
    pub identity: String,
    pub start_time: String,
    pub source_file: String,
    pub stats: SessionStats,
    pub active_missions: BTreeMap<u64, ActiveMission>,
    pub completed_missions: Vec<MissionSummary>,
    pub failed_missions: Vec<MissionSummary>,
    pub reputation: BTreeMap<String, f64>,
    pub ranks: BTreeMap<String, i64>,
    pub progress: BTreeMap<String, i64>,
    pub powerplay: Option<PowerplayStatus>,
    pub version: u64,
}

impl LiveSessionSnapshot {
    fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            identity: session.identity.clone(),
            start_time: session.start_time.clone(),
            source_file: session.source_file.clone(),
            stats: session.stats.clone(),
            ..Default::default()
        }
    }

    pub fn current_system(&self) -> Option<&str> {
        self.stats.last_system.as_deref()
    }

    pub fn current_ship(&self) -> Option<&str> {
        self.stats.last_ship.as_deref()
    }

    pub fn current_credits(&self) -> Option<i64> {
        self.stats.credits.last_balance
    }

    /// Rates between the session start and the last folded event. `None`
    /// when either time is not RFC 3339 or no time has passed.
    pub fn rates(&self) -> Option<LiveRates> {
        let start = parse_time(&self.start_time)?;
        let last = parse_time(self.stats.last_event_time.as_deref()?)?;
        let span_secs = (last - start).num_milliseconds() as f64 / 1000.0;
        if span_secs <= 0.0 {
            return None;
        }
        Some(LiveRates {
            span_secs,
            credits_earned_per_sec: self.stats.credits.earned as f64 / span_secs,
            credits_net_per_sec: self.stats.credits_delta() as f64 / span_secs,
            light_years_per_sec: self.stats.travel.light_years / span_secs,
            jumps_per_sec: self.stats.travel.jumps as f64 / span_secs,
        })
    }

    fn apply(&mut self, event: &JournalEvent) {
        fold_stats(&mut self.stats, event);
        match event.event_type.as_str() {
            "MissionAccepted" => self.mission_accepted(event),
            "MissionCompleted" => self.mission_completed(event),
            "MissionFailed" => {
                self.remove_mission(event);
                self.failed_missions.push(MissionSummary {
                    name: text(event, "Name"),
                    faction: text(event, "Faction"),
                    ..Default::default()
                });
            }
            "MissionAbandoned" => self.remove_mission(event),
            "Rank" => collect_categories(&mut self.ranks, event),
            "Progress" => collect_categories(&mut self.progress, event),
            "Powerplay" => {
                self.powerplay = Some(PowerplayStatus {
                    power: event.str_field("Power").map(str::to_string),
                    rank: event.i64_field("Rank"),
                    merits: event.i64_field("Merits"),
                    votes: event.i64_field("Votes"),
                    time_pledged: event.i64_field("TimePledged"),
                });
            }
            "Reputation" => self.reputation_update(event),
            _ => {}
        }
    }

    fn mission_accepted(&mut self, event: &JournalEvent) {
        let Some(mission_id) = event.u64_field("MissionID") else {
            return;
        };
        self.active_missions.insert(
            mission_id,
            ActiveMission {
                mission_id,
                name: text(event, "Name"),
                faction: text(event, "Faction"),
                expiry: text(event, "Expiry"),
                destination_system: text(event, "DestinationSystem"),
                destination_station: text(event, "DestinationStation"),
            },
        );
    }

    fn mission_completed(&mut self, event: &JournalEvent) {
        self.remove_mission(event);
        let faction_effects = array(event, "FactionEffects")
            .filter_map(Value::as_object)
            .map(|fe| FactionEffect {
                faction: obj_text(fe.get("Faction")),
                reputation_trend: obj_text(fe.get("ReputationTrend")),
                reputation: obj_text(fe.get("Reputation")),
                influence: fe
                    .get("Influence")
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .filter_map(Value::as_object)
                            .filter_map(|inf| {
                                let amount = obj_text(inf.get("Influence"));
                                let trend = obj_text(inf.get("Trend"));
                                let joined = format!("{} {}", amount, trend).trim().to_string();
                                (!joined.is_empty()).then_some(joined)
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();
        let materials_reward = array(event, "MaterialsReward")
            .filter_map(Value::as_object)
            .map(|mat| MaterialReward {
                name: localised(mat, "Name"),
                category: localised(mat, "Category"),
                count: mat.get("Count").and_then(Value::as_i64).unwrap_or(0),
            })
            .collect();
        self.completed_missions.push(MissionSummary {
            name: text(event, "Name"),
            faction: text(event, "Faction"),
            reward: event.i64_field("Reward").unwrap_or(0),
            faction_effects,
            materials_reward,
        });
    }

    fn remove_mission(&mut self, event: &JournalEvent) {
        if let Some(mission_id) = event.u64_field("MissionID") {
            self.active_missions.remove(&mission_id);
        }
    }

    /// Accepts `{"Factions": [{"Name", "Reputation"}]}` or flat
    /// `{faction: value}` fields.
    fn reputation_update(&mut self, event: &JournalEvent) {
        if let Some(factions) = event.field("Factions").and_then(Value::as_array) {
            for entry in factions.iter().filter_map(Value::as_object) {
                let Some(name) = entry.get("Name").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(score) = entry.get("Reputation").and_then(normalize_reputation) {
                    self.reputation.insert(name.to_string(), score);
                }
            }
            return;
        }
        for (key, value) in &event.fields {
            if matches!(key.as_str(), "event" | "timestamp" | "Factions") {
                continue;
            }
            if let Some(score) = normalize_reputation(value) {
                self.reputation.insert(key.clone(), score);
            }
        }
    }
}

/// Folds the same ordered stream as the reconstructor, scoped to the open
/// session.
#[derive(Debug, Clone, Default)]
pub struct LiveSessionTracker {
    current: Option<LiveSessionSnapshot>,
    version: u64,
    dirty: bool,
}

impl LiveSessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session resumed after a restart. Mission and reputation
    /// detail from before the restart is not recovered.
    pub fn resume(session: &Session) -> Self {
        let mut tracker = Self::new();
        tracker.reset_to(session);
        tracker
    }

    /// Apply one event after the reconstructor folded it. `open` is the
    /// reconstructor's open session after the fold.
    pub fn fold(&mut self, event: &JournalEvent, outcome: &FoldOutcome, open: Option<&Session>) {
        match outcome {
            FoldOutcome::Opened { .. } => {
                if let Some(session) = open {
                    self.reset_to(session);
                }
            }
            FoldOutcome::Folded => {
                if let Some(snapshot) = self.current.as_mut() {
                    snapshot.apply(event);
                    self.version += 1;
                    snapshot.version = self.version;
                    self.dirty = true;
                }
            }
            FoldOutcome::Orphaned => {}
        }
    }

    /// Drop the snapshot of a session that was just closed.
    pub fn close(&mut self) -> Option<LiveSessionSnapshot> {
        let snapshot = self.current.take();
        if snapshot.is_some() {
            self.version += 1;
            self.dirty = true;
        }
        snapshot
    }

    pub fn snapshot(&self) -> Option<&LiveSessionSnapshot> {
        self.current.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Read and clear the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn reset_to(&mut self, session: &Session) {
        self.version += 1;
        let mut snapshot = LiveSessionSnapshot::from_session(session);
        snapshot.version = self.version;
        self.current = Some(snapshot);
        self.dirty = true;
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn text(event: &JournalEvent, key: &str) -> String {
    obj_text(event.field(key))
}

fn obj_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn localised(obj: &serde_json::Map<String, Value>, key: &str) -> String {
    obj.get(&format!("{}_Localised", key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| obj_text(obj.get(key)))
}

fn array<'a>(event: &'a JournalEvent, key: &str) -> impl Iterator<Item = &'a Value> {
    event
        .field(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn collect_categories(target: &mut BTreeMap<String, i64>, event: &JournalEvent) {
    for category in RANK_CATEGORIES {
        if let Some(value) = event.i64_field(category) {
            target.insert(category.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstructor::SessionReconstructor;
    use crate::rules::tests::event;
    use serde_json::json;

    fn run(events: &[Value]) -> (SessionReconstructor, LiveSessionTracker) {
        let mut recon = SessionReconstructor::new();
        let mut live = LiveSessionTracker::new();
        for value in events {
            let e = event(value.clone());
            let outcome = recon.fold(&e);
            live.fold(&e, &outcome, recon.open_session());
        }
        (recon, live)
    }

    fn opening() -> Value {
        json!({"event": "LoadGame", "Commander": "Jameson", "timestamp": "2024-05-01T12:00:00Z", "Credits": 1000})
    }

    #[test]
    fn reputation_from_factions_array() {
        let (_, live) = run(&[
            opening(),
            json!({"event": "Reputation", "Factions": [
                {"Name": "Federation", "Reputation": "Friendly"},
                {"Name": "Empire", "Reputation": 42.5},
                {"Reputation": "Allied"}
            ]}),
        ]);
        let rep = &live.snapshot().unwrap().reputation;
        assert_eq!(rep.get("Federation"), Some(&75.0));
        assert_eq!(rep.get("Empire"), Some(&42.5));
        assert_eq!(rep.len(), 2);
    }

    #[test]
    fn reputation_from_flat_fields() {
        let (_, live) = run(&[
            opening(),
            json!({"event": "Reputation", "timestamp": "2024-05-01T12:00:01Z",
                   "Empire": 0.5, "Federation": 250.0, "Alliance": "Hostile", "Independent": "Unknown"}),
        ]);
        let rep = &live.snapshot().unwrap().reputation;
        assert_eq!(rep.get("Empire"), Some(&50.0));
        assert_eq!(rep.get("Federation"), Some(&100.0));
        assert_eq!(rep.get("Alliance"), Some(&0.0));
        assert!(!rep.contains_key("Independent"));
        assert!(!rep.contains_key("timestamp"));
    }

    #[test]
    fn missions_move_from_active_to_resolved() {
        let (recon, live) = run(&[
            opening(),
            json!({"event": "MissionAccepted", "MissionID": 7, "Name": "Courier", "Faction": "Sol Workers",
                   "DestinationSystem": "Lave", "DestinationStation": "Lave Station"}),
            json!({"event": "MissionAccepted", "MissionID": 8, "Name": "Delivery"}),
            json!({"event": "MissionAccepted", "MissionID": 9, "Name": "Massacre"}),
            json!({"event": "MissionCompleted", "MissionID": 7, "Name": "Courier", "Faction": "Sol Workers",
                   "Reward": 50000,
                   "FactionEffects": [{"Faction": "Sol Workers", "ReputationTrend": "UpGood", "Reputation": "+",
                                       "Influence": [{"Influence": "++", "Trend": "UpGood"}]}],
                   "MaterialsReward": [{"Name": "iron", "Name_Localised": "Iron", "Category": "Raw", "Count": 3}]}),
            json!({"event": "MissionFailed", "MissionID": 8, "Name": "Delivery", "Faction": "Lave Co"}),
            json!({"event": "MissionAbandoned", "MissionID": 9}),
        ]);
        let snapshot = live.snapshot().unwrap();
        assert!(snapshot.active_missions.is_empty());
        assert_eq!(snapshot.completed_missions.len(), 1);
        let done = &snapshot.completed_missions[0];
        assert_eq!(done.reward, 50000);
        assert_eq!(done.faction_effects[0].influence, vec!["++ UpGood".to_string()]);
        assert_eq!(done.materials_reward[0].name, "Iron");
        assert_eq!(snapshot.failed_missions[0].faction, "Lave Co");

        // The historical record keeps counts only.
        let stats = &recon.open_session().unwrap().stats;
        assert_eq!(stats.missions.accepted, 3);
        assert_eq!(stats.missions.completed, 1);
        assert_eq!(stats.missions.failed, 1);
        assert_eq!(stats.missions.abandoned, 1);
    }

    #[test]
    fn live_stats_match_the_historical_fold() {
        let (recon, live) = run(&[
            json!({"event": "Fileheader"}),
            opening(),
            json!({"event": "FSDJump", "JumpDist": 8.5, "StarSystem": "Lave", "timestamp": "2024-05-01T12:10:00Z"}),
            json!({"event": "Bounty", "TotalReward": 2000}),
            json!({"event": "Rank", "Combat": 3, "Trade": 5}),
            json!({"event": "Powerplay", "Power": "Zachary Hudson", "Rank": 2, "Merits": 120}),
        ]);
        let snapshot = live.snapshot().unwrap();
        assert_eq!(snapshot.stats, recon.open_session().unwrap().stats);
        assert_eq!(snapshot.ranks.get("Trade"), Some(&5));
        assert_eq!(snapshot.powerplay.as_ref().unwrap().merits, Some(120));
        assert_eq!(snapshot.current_system(), Some("Lave"));
        assert_eq!(snapshot.current_credits(), Some(1000));
    }

    #[test]
    fn version_and_dirty_flag() {
        let mut recon = SessionReconstructor::new();
        let mut live = LiveSessionTracker::new();
        let e = event(json!({"event": "Fileheader"}));
        let outcome = recon.fold(&e);
        live.fold(&e, &outcome, recon.open_session());
        assert!(!live.is_dirty());
        assert_eq!(live.version(), 0);

        let e = event(opening());
        let outcome = recon.fold(&e);
        live.fold(&e, &outcome, recon.open_session());
        assert!(live.take_dirty());
        assert!(!live.take_dirty());
        let before = live.version();

        let e = event(json!({"event": "Scan"}));
        let outcome = recon.fold(&e);
        live.fold(&e, &outcome, recon.open_session());
        assert!(live.is_dirty());
        assert_eq!(live.version(), before + 1);
        assert_eq!(live.snapshot().unwrap().version, before + 1);
    }

    #[test]
    fn new_session_resets_the_snapshot() {
        let (_, live) = run(&[
            opening(),
            json!({"event": "MissionAccepted", "MissionID": 1}),
            json!({"event": "LoadGame", "Commander": "Harper", "timestamp": "2024-05-01T13:00:00Z"}),
        ]);
        let snapshot = live.snapshot().unwrap();
        assert_eq!(snapshot.identity, "Harper");
        assert!(snapshot.active_missions.is_empty());
        assert_eq!(snapshot.stats.total_events, 1);
    }

    #[test]
    fn rates_need_a_time_span() {
        let (_, live) = run(&[opening()]);
        assert!(live.snapshot().unwrap().rates().is_none());

        let (_, live) = run(&[
            opening(),
            json!({"event": "FSDJump", "JumpDist": 20.0, "timestamp": "2024-05-01T12:00:10Z", "Credits": 2000}),
        ]);
        let rates = live.snapshot().unwrap().rates().unwrap();
        assert_eq!(rates.span_secs, 10.0);
        assert_eq!(rates.light_years_per_sec, 2.0);
        assert_eq!(rates.credits_earned_per_sec, 100.0);
        assert_eq!(rates.jumps_per_sec, 0.1);
    }
}
