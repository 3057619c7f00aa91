//! Aggregate counters carried by a session.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TravelStats {
    pub jumps: u64,
    pub light_years: f64,
    pub docked: u64,
    pub undocked: u64,
    pub planets_landed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreditStats {
    pub first_balance: Option<i64>,
    pub last_balance: Option<i64>,
    /// Sum of positive balance changes.
    pub earned: i64,
    /// Sum of negative balance changes, as a positive number.
    pub spent: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CombatStats {
    pub kills: u64,
    pub deaths: u64,
    pub bounty_count: u64,
    pub bounties_earned: i64,
    pub bond_count: u64,
    pub combat_bonds: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExplorationStats {
    pub scans: u64,
    pub fss_scans: u64,
    pub dss_scans: u64,
    pub codex_entries: u64,
    pub exploration_value: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TradingStats {
    pub market_buys: u64,
    pub market_sells: u64,
    pub trade_profit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MissionStats {
    pub accepted: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub rewards: i64,
}

/// The statistical bag of one session. Bounded in size: per-mission detail
/// lives only in the live snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionStats {
    pub total_events: u64,
    pub event_counts: BTreeMap<String, u64>,
    pub travel: TravelStats,
    pub credits: CreditStats,
    pub combat: CombatStats,
    pub exploration: ExplorationStats,
    pub trading: TradingStats,
    pub missions: MissionStats,
    pub first_ship: Option<String>,
    pub last_ship: Option<String>,
    pub first_system: Option<String>,
    pub last_system: Option<String>,
    pub systems_visited: BTreeSet<String>,
    pub stations_visited: BTreeSet<String>,
    pub ships: BTreeSet<String>,
    /// Timestamp of the last folded event that carried one.
    pub last_event_time: Option<String>,
    /// Rank per category (`combat`, `trade`, `exploration`, ...) when the
    /// session started.
    pub start_ranks: BTreeMap<String, i64>,
    /// Ranks reached through promotions during the session.
    pub end_ranks: BTreeMap<String, i64>,
    pub died: bool,
}

impl SessionStats {
    /// Net balance change over the session.
    pub fn credits_delta(&self) -> i64 {
        match (self.credits.first_balance, self.credits.last_balance) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => 0,
        }
    }

    /// Dockings plus undockings.
    pub fn docking_count(&self) -> u64 {
        self.travel.docked + self.travel.undocked
    }

    pub fn money_earned(&self) -> i64 {
        self.credits.earned
    }

    pub fn money_spent(&self) -> i64 {
        self.credits.spent
    }
}
