//! Import of the flat-file format used before the SQLite store.
//!
//! The legacy data directory holds `sessions.json`
//! (`{"sessions": {<id>: {...}}}`) and `processed_files.json`
//! (`{"processed_files": [<path>, ...]}`). Both are read fully, upserted in
//! one transaction and then renamed with a `.migrated` suffix. The upserts
//! are keyed, so an import interrupted before the rename simply runs again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::sessions::{self, Session};
use crate::stats::SessionStats;
use crate::{ledger, Database, DbError};

pub const LEGACY_SESSIONS_FILE: &str = "sessions.json";
pub const LEGACY_PROCESSED_FILE: &str = "processed_files.json";
pub const MIGRATED_SUFFIX: &str = "migrated";

/// Identity recorded for legacy sessions that never saw a commander name.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path:?} is not a legacy artifact: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// Data was imported but an artifact could not be renamed; the next run
    /// imports it again.
    #[error("imported {path:?} but could not mark it migrated: {source}")]
    Conflict {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Outcome of one migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub sessions: usize,
    pub files: usize,
    /// Entries that could not be interpreted and were left out.
    pub skipped: usize,
    pub renamed: Vec<PathBuf>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.renamed.is_empty() && self.sessions == 0 && self.files == 0
    }
}

/// Whether `dir` still holds unmigrated legacy artifacts.
pub fn has_legacy_artifacts(dir: &Path) -> bool {
    dir.join(LEGACY_SESSIONS_FILE).is_file() || dir.join(LEGACY_PROCESSED_FILE).is_file()
}

pub fn migrated_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(MIGRATED_SUFFIX);
    path.with_file_name(name)
}

/// Import whatever legacy artifacts exist in `dir`.
pub fn migrate_legacy(db: &Database, dir: &Path) -> Result<MigrationReport, MigrationError> {
    let sessions_path = dir.join(LEGACY_SESSIONS_FILE);
    let processed_path = dir.join(LEGACY_PROCESSED_FILE);
    let mut report = MigrationReport::default();

    let legacy_sessions = match read_json(&sessions_path)? {
        Some(doc) => load_sessions(&sessions_path, doc, &mut report)?,
        None => Vec::new(),
    };
    let processed = match read_json(&processed_path)? {
        Some(doc) => load_processed(&processed_path, doc, &mut report)?,
        None => Vec::new(),
    };

    let present: Vec<PathBuf> = [sessions_path, processed_path]
        .into_iter()
        .filter(|p| p.is_file())
        .collect();
    if present.is_empty() {
        return Ok(report);
    }

    {
        let mut conn = db.lock()?;
        let tx = conn.transaction().map_err(DbError::from)?;
        for session in &legacy_sessions {
            sessions::upsert(&tx, session)?;
        }
        for path in &processed {
            let (size, mtime) = stat(path);
            ledger::upsert_consumed(&tx, path, size, mtime).map_err(DbError::from)?;
        }
        tx.commit().map_err(DbError::from)?;
    }
    report.sessions = legacy_sessions.len();
    report.files = processed.len();

    for path in present {
        let target = migrated_path(&path);
        std::fs::rename(&path, &target).map_err(|source| MigrationError::Conflict {
            path: path.clone(),
            source,
        })?;
        report.renamed.push(target);
    }

    info!(
        sessions = report.sessions,
        files = report.files,
        skipped = report.skipped,
        "legacy artifacts migrated"
    );
    Ok(report)
}

fn read_json(path: &Path) -> Result<Option<Value>, MigrationError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(MigrationError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| MigrationError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn load_sessions(
    path: &Path,
    doc: Value,
    report: &mut MigrationReport,
) -> Result<Vec<Session>, MigrationError> {
    let entries = match doc {
        Value::Object(mut obj) => match obj.remove("sessions") {
            Some(Value::Object(map)) => map,
            None | Some(Value::Null) => Map::new(),
            Some(_) => {
                return Err(MigrationError::Malformed {
                    path: path.to_path_buf(),
                    reason: "\"sessions\" is not an object".to_string(),
                })
            }
        },
        _ => {
            return Err(MigrationError::Malformed {
                path: path.to_path_buf(),
                reason: "top level is not an object".to_string(),
            })
        }
    };

    let mut sessions = Vec::with_capacity(entries.len());
    for (legacy_id, value) in entries {
        match serde_json::from_value::<LegacySession>(value) {
            Ok(legacy) => match legacy.into_session() {
                Some(session) => sessions.push(session),
                None => {
                    warn!(legacy_id = %legacy_id, "legacy session has no log file; skipping");
                    report.skipped += 1;
                }
            },
            Err(e) => {
                warn!(legacy_id = %legacy_id, error = %e, "unreadable legacy session; skipping");
                report.skipped += 1;
            }
        }
    }
    Ok(sessions)
}

fn load_processed(
    path: &Path,
    doc: Value,
    report: &mut MigrationReport,
) -> Result<Vec<PathBuf>, MigrationError> {
    let items = match doc {
        Value::Object(mut obj) => match obj.remove("processed_files") {
            Some(Value::Array(items)) => items,
            None | Some(Value::Null) => Vec::new(),
            Some(_) => {
                return Err(MigrationError::Malformed {
                    path: path.to_path_buf(),
                    reason: "\"processed_files\" is not a list".to_string(),
                })
            }
        },
        _ => {
            return Err(MigrationError::Malformed {
                path: path.to_path_buf(),
                reason: "top level is not an object".to_string(),
            })
        }
    };

    let mut files = BTreeSet::new();
    for item in items {
        match item {
            Value::String(s) if !s.is_empty() => {
                files.insert(PathBuf::from(s));
            }
            other => {
                warn!(entry = %other, "unreadable processed-file entry; skipping");
                report.skipped += 1;
            }
        }
    }
    Ok(files.into_iter().collect())
}

/// Whole-file size and mtime. A file that no longer exists is recorded as
/// empty.
fn stat(path: &Path) -> (u64, Option<DateTime<Utc>>) {
    match std::fs::metadata(path) {
        Ok(meta) => (
            meta.len(),
            meta.modified().ok().map(DateTime::<Utc>::from),
        ),
        Err(_) => (0, None),
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(d)?.unwrap_or(0.0))
}

fn lenient_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    let values = Option::<Vec<Value>>::deserialize(d)?.unwrap_or_default();
    Ok(values
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect())
}

/// One entry of the legacy `sessions` map. Numbers may be stored as floats
/// or be null; both are tolerated.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacySession {
    log_file: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    commander: Option<String>,
    #[serde(deserialize_with = "lenient_event_counts")]
    event_counts: BTreeMap<String, u64>,
    first_ship: Option<String>,
    last_ship: Option<String>,
    first_system: Option<String>,
    last_system: Option<String>,
    first_credits: Option<f64>,
    last_credits: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    credits_change: f64,
    #[serde(deserialize_with = "lenient_f64")]
    jumps: f64,
    #[serde(deserialize_with = "lenient_f64")]
    light_years_traveled: f64,
    #[serde(deserialize_with = "lenient_f64")]
    docked_count: f64,
    #[serde(deserialize_with = "lenient_f64")]
    undocked_count: f64,
    #[serde(deserialize_with = "lenient_f64")]
    planets_landed: f64,
    #[serde(deserialize_with = "lenient_f64")]
    total_events: f64,
    #[serde(deserialize_with = "lenient_f64")]
    bounties_earned: f64,
    #[serde(deserialize_with = "lenient_f64")]
    bounty_count: f64,
    #[serde(deserialize_with = "lenient_f64")]
    combat_bonds: f64,
    #[serde(deserialize_with = "lenient_f64")]
    kills: f64,
    #[serde(deserialize_with = "lenient_f64")]
    deaths: f64,
    #[serde(deserialize_with = "lenient_f64")]
    scans: f64,
    #[serde(deserialize_with = "lenient_f64")]
    fss_scans: f64,
    #[serde(deserialize_with = "lenient_f64")]
    dss_scans: f64,
    #[serde(deserialize_with = "lenient_f64")]
    codex_entries: f64,
    #[serde(deserialize_with = "lenient_f64")]
    exploration_value: f64,
    #[serde(deserialize_with = "lenient_f64")]
    market_buys: f64,
    #[serde(deserialize_with = "lenient_f64")]
    market_sells: f64,
    #[serde(deserialize_with = "lenient_f64")]
    trade_profit: f64,
    #[serde(deserialize_with = "lenient_f64")]
    missions_accepted: f64,
    #[serde(deserialize_with = "lenient_f64")]
    missions_completed: f64,
    #[serde(deserialize_with = "lenient_f64")]
    missions_failed: f64,
    #[serde(deserialize_with = "lenient_f64")]
    mission_rewards: f64,
    #[serde(deserialize_with = "lenient_list")]
    systems_visited: Vec<String>,
    #[serde(deserialize_with = "lenient_list")]
    stations_visited: Vec<String>,
    #[serde(deserialize_with = "lenient_list")]
    unique_ships: Vec<String>,
    #[serde(deserialize_with = "lenient_ranks")]
    start_ranks: BTreeMap<String, i64>,
    #[serde(deserialize_with = "lenient_ranks")]
    end_ranks: BTreeMap<String, i64>,
    died: Option<Value>,
}

fn lenient_event_counts<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<BTreeMap<String, u64>, D::Error> {
    let raw = Option::<Map<String, Value>>::deserialize(d)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| v.as_f64().map(|n| (k, n.max(0.0) as u64)))
        .collect())
}

fn lenient_ranks<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<String, i64>, D::Error> {
    let raw = Option::<Map<String, Value>>::deserialize(d)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| v.as_f64().map(|n| (k, amount(n))))
        .collect())
}

fn count(n: f64) -> u64 {
    if n.is_finite() && n > 0.0 {
        n as u64
    } else {
        0
    }
}

fn amount(n: f64) -> i64 {
    if n.is_finite() {
        n as i64
    } else {
        0
    }
}

impl LegacySession {
    fn into_session(self) -> Option<Session> {
        let log_file = self.log_file.filter(|s| !s.is_empty())?;
        let source_file = Path::new(&log_file)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(log_file);
        let start_time = self.start_time.unwrap_or_default();
        let identity = self
            .commander
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string());

        let mut session = Session::new(&identity, &start_time, &source_file);
        let credits_delta = amount(self.credits_change);
        let first_balance = self.first_credits.map(amount);
        let last_balance = match (first_balance, self.last_credits) {
            (_, Some(last)) => Some(amount(last)),
            (Some(first), None) => Some(first.saturating_add(credits_delta)),
            (None, None) => None,
        };

        let mut stats = SessionStats {
            total_events: count(self.total_events),
            event_counts: self.event_counts,
            first_ship: self.first_ship,
            last_ship: self.last_ship,
            first_system: self.first_system,
            last_system: self.last_system,
            systems_visited: self.systems_visited.into_iter().collect(),
            stations_visited: self.stations_visited.into_iter().collect(),
            ships: self.unique_ships.into_iter().collect(),
            last_event_time: self.end_time.clone(),
            ..Default::default()
        };
        stats.travel.jumps = count(self.jumps);
        stats.travel.light_years = if self.light_years_traveled.is_finite() {
            self.light_years_traveled.max(0.0)
        } else {
            0.0
        };
        stats.travel.docked = count(self.docked_count);
        stats.travel.undocked = count(self.undocked_count);
        stats.travel.planets_landed = count(self.planets_landed);

        stats.credits.first_balance = first_balance;
        stats.credits.last_balance = last_balance;
        // Only the net change was recorded.
        let net = match (first_balance, last_balance) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => credits_delta,
        };
        if net >= 0 {
            stats.credits.earned = net;
        } else {
            stats.credits.spent = net.saturating_neg();
        }

        stats.combat.kills = count(self.kills);
        stats.combat.deaths = count(self.deaths);
        stats.died = self.died.as_ref().and_then(Value::as_bool).unwrap_or(false)
            || stats.combat.deaths > 0;
        stats.start_ranks = self.start_ranks;
        stats.end_ranks = self.end_ranks;
        stats.combat.bounty_count = count(self.bounty_count);
        stats.combat.bounties_earned = amount(self.bounties_earned);
        stats.combat.combat_bonds = amount(self.combat_bonds);

        stats.exploration.scans = count(self.scans);
        stats.exploration.fss_scans = count(self.fss_scans);
        stats.exploration.dss_scans = count(self.dss_scans);
        stats.exploration.codex_entries = count(self.codex_entries);
        stats.exploration.exploration_value = amount(self.exploration_value);

        stats.trading.market_buys = count(self.market_buys);
        stats.trading.market_sells = count(self.market_sells);
        stats.trading.trade_profit = amount(self.trade_profit);

        stats.missions.accepted = count(self.missions_accepted);
        stats.missions.completed = count(self.missions_completed);
        stats.missions.failed = count(self.missions_failed);
        stats.missions.rewards = amount(self.mission_rewards);

        session.stats = stats;
        session.close();
        Some(session)
    }
}
