//! Statistical fold rules.
//!
//! Every event passes through [`fold_stats`]: a set of rules common to all
//! event types, then the rule registered for its `event_type`, if any. The
//! historical session and the live snapshot both fold through here, so the
//! live view is always a superset of the historical aggregate.

use edjournal_db::SessionStats;
use edjournal_journal::JournalEvent;

/// A per-event-type contribution to the session aggregate.
pub type FoldRule = fn(&mut SessionStats, &JournalEvent);

/// Event types whose statistical rule is registered in [`rule_for`].
pub const CLASSIFIED_EVENTS: &[&str] = &[
    "LoadGame",
    "FSDJump",
    "Location",
    "CarrierJump",
    "Docked",
    "Undocked",
    "Touchdown",
    "Bounty",
    "FactionKillBond",
    "Died",
    "Rank",
    "Promotion",
    "Scan",
    "FSSBodySignals",
    "SAAScanComplete",
    "CodexEntry",
    "SellExplorationData",
    "MultiSellExplorationData",
    "MarketBuy",
    "MarketSell",
    "MissionAccepted",
    "MissionCompleted",
    "MissionFailed",
    "MissionAbandoned",
];

/// Dispatch table from event type to its fold rule.
pub fn rule_for(event_type: &str) -> Option<FoldRule> {
    let rule: FoldRule = match event_type {
        "LoadGame" => load_game,
        "FSDJump" => fsd_jump,
        "Location" | "CarrierJump" => location,
        "Docked" => docked,
        "Undocked" => |stats, _| stats.travel.undocked += 1,
        "Touchdown" => |stats, _| stats.travel.planets_landed += 1,
        "Bounty" => bounty,
        "FactionKillBond" => kill_bond,
        "Died" => died,
        "Rank" => rank,
        "Promotion" => promotion,
        "Scan" => |stats, _| stats.exploration.scans += 1,
        "FSSBodySignals" => |stats, _| stats.exploration.fss_scans += 1,
        "SAAScanComplete" => |stats, _| stats.exploration.dss_scans += 1,
        "CodexEntry" => |stats, _| stats.exploration.codex_entries += 1,
        "SellExplorationData" | "MultiSellExplorationData" => sell_exploration_data,
        "MarketBuy" => |stats, _| stats.trading.market_buys += 1,
        "MarketSell" => market_sell,
        "MissionAccepted" => |stats, _| stats.missions.accepted += 1,
        "MissionCompleted" => mission_completed,
        "MissionFailed" => |stats, _| stats.missions.failed += 1,
        "MissionAbandoned" => |stats, _| stats.missions.abandoned += 1,
        _ => return None,
    };
    Some(rule)
}

/// Fold one event into `stats`.
pub fn fold_stats(stats: &mut SessionStats, event: &JournalEvent) {
    stats.total_events += 1;
    *stats
        .event_counts
        .entry(event.event_type.clone())
        .or_insert(0) += 1;
    if !event.timestamp.is_empty() {
        stats.last_event_time = Some(event.timestamp.clone());
    }

    if let Some(rule) = rule_for(&event.event_type) {
        rule(stats, event);
    }

    if let Some(ship) = event.str_field("Ship").filter(|s| !s.is_empty()) {
        if stats.first_ship.is_none() {
            stats.first_ship = Some(ship.to_string());
        }
        stats.last_ship = Some(ship.to_string());
        stats.ships.insert(ship.to_string());
    }

    if let Some(balance) = event.i64_field("Credits") {
        apply_balance(stats, balance);
    }
}

/// Track a reported credit balance. The change from the previous balance
/// counts as earned or spent.
fn apply_balance(stats: &mut SessionStats, balance: i64) {
    let credits = &mut stats.credits;
    if let Some(previous) = credits.last_balance {
        let change = balance.saturating_sub(previous);
        if change > 0 {
            credits.earned = credits.earned.saturating_add(change);
        } else {
            credits.spent = credits.spent.saturating_add(change.saturating_neg());
        }
    }
    if credits.first_balance.is_none() {
        credits.first_balance = Some(balance);
    }
    credits.last_balance = Some(balance);
}

fn visit_system(stats: &mut SessionStats, event: &JournalEvent) {
    if let Some(system) = event.str_field("StarSystem").filter(|s| !s.is_empty()) {
        stats.last_system = Some(system.to_string());
        stats.systems_visited.insert(system.to_string());
    }
}

/// Rank categories: session key, `LoadGame` field, `Rank`/`Promotion` field.
const RANK_FIELDS: &[(&str, &str, &str)] = &[
    ("combat", "Rank", "Combat"),
    ("trade", "TradeRank", "Trade"),
    ("exploration", "ExploreRank", "Explore"),
    ("empire", "EmpireRank", "Empire"),
    ("federation", "FederationRank", "Federation"),
    ("cqc", "CQCRank", "CQC"),
    ("soldier", "SoldierRank", "Soldier"),
    ("exobiologist", "ExobiologistRank", "Exobiologist"),
];

fn load_game(stats: &mut SessionStats, event: &JournalEvent) {
    for (key, load_field, _) in RANK_FIELDS {
        if let Some(rank) = event.i64_field(load_field) {
            stats.start_ranks.insert(key.to_string(), rank);
        }
    }
    if stats.first_system.is_none() {
        stats.first_system = event
            .str_field("StarSystem")
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }
    visit_system(stats, event);
}

fn fsd_jump(stats: &mut SessionStats, event: &JournalEvent) {
    stats.travel.jumps += 1;
    if let Some(dist) = event.f64_field("JumpDist").filter(|d| d.is_finite() && *d > 0.0) {
        stats.travel.light_years += dist;
    }
    visit_system(stats, event);
    if stats.first_system.is_none() {
        stats.first_system = stats.last_system.clone();
    }
}

fn location(stats: &mut SessionStats, event: &JournalEvent) {
    visit_system(stats, event);
    if stats.first_system.is_none() {
        stats.first_system = stats.last_system.clone();
    }
}

fn docked(stats: &mut SessionStats, event: &JournalEvent) {
    stats.travel.docked += 1;
    if let Some(station) = event.str_field("StationName").filter(|s| !s.is_empty()) {
        stats.stations_visited.insert(station.to_string());
    }
}

/// The `Rank` summary follows `LoadGame`; it only fills categories the
/// session has no starting rank for yet.
fn rank(stats: &mut SessionStats, event: &JournalEvent) {
    for (key, _, field) in RANK_FIELDS {
        if let Some(rank) = event.i64_field(field) {
            stats.start_ranks.entry(key.to_string()).or_insert(rank);
        }
    }
}

/// `Promotion` carries the new rank under the category name
/// (`{"Combat": 4}`). The older `Rank`/`NewRank` pair names the category
/// in text instead.
fn promotion(stats: &mut SessionStats, event: &JournalEvent) {
    for (key, _, field) in RANK_FIELDS {
        if let Some(rank) = event.i64_field(field) {
            stats.end_ranks.insert(key.to_string(), rank);
        }
    }
    if let (Some(category), Some(rank)) = (event.str_field("Rank"), event.i64_field("NewRank")) {
        let category = category.to_ascii_lowercase();
        let matched = RANK_FIELDS.iter().find(|(key, _, field)| {
            category.contains(key) || category.contains(&field.to_ascii_lowercase())
        });
        if let Some((key, _, _)) = matched {
            stats.end_ranks.insert(key.to_string(), rank);
        }
    }
}

fn died(stats: &mut SessionStats, _event: &JournalEvent) {
    stats.combat.deaths += 1;
    stats.died = true;
}

fn bounty(stats: &mut SessionStats, event: &JournalEvent) {
    let reward = event.i64_field("TotalReward").unwrap_or(0);
    if reward > 0 {
        stats.combat.kills += 1;
        stats.combat.bounty_count += 1;
        stats.combat.bounties_earned = stats.combat.bounties_earned.saturating_add(reward);
    }
}

fn kill_bond(stats: &mut SessionStats, event: &JournalEvent) {
    let reward = event.i64_field("Reward").unwrap_or(0);
    if reward > 0 {
        stats.combat.kills += 1;
        stats.combat.bond_count += 1;
        stats.combat.combat_bonds = stats.combat.combat_bonds.saturating_add(reward);
    }
}

fn sell_exploration_data(stats: &mut SessionStats, event: &JournalEvent) {
    let earnings = event.i64_field("TotalEarnings").unwrap_or(0);
    if earnings > 0 {
        stats.exploration.exploration_value =
            stats.exploration.exploration_value.saturating_add(earnings);
    }
}

fn market_sell(stats: &mut SessionStats, event: &JournalEvent) {
    stats.trading.market_sells += 1;
    let sale = event.i64_field("TotalSale").unwrap_or(0);
    let paid = event
        .i64_field("AvgPricePaid")
        .unwrap_or(0)
        .saturating_mul(event.i64_field("Count").unwrap_or(0));
    let profit = sale.saturating_sub(paid);
    if profit > 0 {
        stats.trading.trade_profit = stats.trading.trade_profit.saturating_add(profit);
    }
}

fn mission_completed(stats: &mut SessionStats, event: &JournalEvent) {
    stats.missions.completed += 1;
    let reward = event.i64_field("Reward").unwrap_or(0);
    if reward > 0 {
        stats.missions.rewards = stats.missions.rewards.saturating_add(reward);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::path::PathBuf;

    pub(crate) fn event(value: Value) -> JournalEvent {
        let fields = value.as_object().cloned().unwrap_or_default();
        JournalEvent {
            source_file: PathBuf::from("/j/Journal.2024-05-01T120000.01.log"),
            byte_offset_end: 0,
            sequence: 0,
            timestamp: fields
                .get("timestamp")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            event_type: fields
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string(),
            fields,
        }
    }

    fn fold_all(events: &[Value]) -> SessionStats {
        let mut stats = SessionStats::default();
        for e in events {
            fold_stats(&mut stats, &event(e.clone()));
        }
        stats
    }

    #[test]
    fn every_classified_event_has_a_rule() {
        for name in CLASSIFIED_EVENTS {
            assert!(rule_for(name).is_some(), "{name} has no rule");
        }
        assert!(rule_for("Music").is_none());
    }

    #[test]
    fn jumps_accumulate_distance_and_systems() {
        let stats = fold_all(&[
            json!({"event": "LoadGame", "timestamp": "T0", "StarSystem": "Sol", "Ship": "Anaconda"}),
            json!({"event": "FSDJump", "timestamp": "T1", "JumpDist": 10.5, "StarSystem": "Alpha Centauri"}),
            json!({"event": "FSDJump", "timestamp": "T2", "JumpDist": 4.25, "StarSystem": "Barnard's Star"}),
        ]);
        assert_eq!(stats.travel.jumps, 2);
        assert_eq!(stats.travel.light_years, 14.75);
        assert_eq!(stats.first_system.as_deref(), Some("Sol"));
        assert_eq!(stats.last_system.as_deref(), Some("Barnard's Star"));
        assert_eq!(stats.systems_visited.len(), 3);
        assert_eq!(stats.first_ship.as_deref(), Some("Anaconda"));
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.event_counts["FSDJump"], 2);
        assert_eq!(stats.last_event_time.as_deref(), Some("T2"));
    }

    #[test]
    fn balance_changes_split_into_earned_and_spent() {
        let stats = fold_all(&[
            json!({"event": "LoadGame", "Credits": 1000}),
            json!({"event": "Statistics", "Credits": 1500}),
            json!({"event": "Loadout", "Credits": 1200}),
        ]);
        assert_eq!(stats.credits.earned, 500);
        assert_eq!(stats.credits.spent, 300);
        assert_eq!(stats.credits_delta(), 200);
    }

    #[test]
    fn extreme_balances_saturate() {
        let stats = fold_all(&[
            json!({"event": "LoadGame", "Credits": i64::MAX}),
            json!({"event": "Statistics", "Credits": -i64::MAX}),
            json!({"event": "Statistics", "Credits": i64::MAX}),
            json!({"event": "Bounty", "TotalReward": i64::MAX}),
            json!({"event": "Bounty", "TotalReward": i64::MAX}),
            json!({"event": "MarketSell", "TotalSale": i64::MAX, "AvgPricePaid": -2, "Count": i64::MAX}),
        ]);
        assert_eq!(stats.credits.spent, i64::MAX);
        assert_eq!(stats.credits.earned, i64::MAX);
        assert_eq!(stats.credits_delta(), 0);
        assert_eq!(stats.combat.bounties_earned, i64::MAX);
        assert_eq!(stats.trading.trade_profit, i64::MAX);

        let swing = fold_all(&[
            json!({"event": "LoadGame", "Credits": -i64::MAX}),
            json!({"event": "Statistics", "Credits": i64::MAX}),
        ]);
        assert_eq!(swing.credits.earned, i64::MAX);
        assert_eq!(swing.credits_delta(), i64::MAX);
    }

    #[test]
    fn ranks_and_death_are_tracked() {
        let stats = fold_all(&[
            json!({"event": "LoadGame", "Rank": 3, "TradeRank": 5}),
            json!({"event": "Rank", "Combat": 9, "Trade": 9, "Explore": 2, "Empire": 0}),
            json!({"event": "Promotion", "Combat": 4}),
            json!({"event": "Promotion", "Rank": "Exploration", "NewRank": 3}),
            json!({"event": "Died", "KillerName": "Pirate"}),
        ]);
        assert_eq!(stats.start_ranks["combat"], 3);
        assert_eq!(stats.start_ranks["trade"], 5);
        assert_eq!(stats.start_ranks["exploration"], 2);
        assert_eq!(stats.start_ranks["empire"], 0);
        assert_eq!(stats.end_ranks["combat"], 4);
        assert_eq!(stats.end_ranks["exploration"], 3);
        assert!(!stats.end_ranks.contains_key("trade"));
        assert!(stats.died);
        assert_eq!(stats.combat.deaths, 1);

        let calm = fold_all(&[json!({"event": "LoadGame"})]);
        assert!(!calm.died);
        assert!(calm.start_ranks.is_empty());
    }

    #[test]
    fn combat_rewards_need_a_positive_reward() {
        let stats = fold_all(&[
            json!({"event": "Bounty", "TotalReward": 25000}),
            json!({"event": "Bounty", "TotalReward": 0}),
            json!({"event": "FactionKillBond", "Reward": 10000}),
            json!({"event": "Died"}),
        ]);
        assert_eq!(stats.combat.kills, 2);
        assert_eq!(stats.combat.bounty_count, 1);
        assert_eq!(stats.combat.bounties_earned, 25000);
        assert_eq!(stats.combat.combat_bonds, 10000);
        assert_eq!(stats.combat.deaths, 1);
    }

    #[test]
    fn market_sell_counts_only_positive_profit() {
        let stats = fold_all(&[
            json!({"event": "MarketSell", "TotalSale": 5000, "AvgPricePaid": 100, "Count": 20}),
            json!({"event": "MarketSell", "TotalSale": 500, "AvgPricePaid": 100, "Count": 20}),
            json!({"event": "MarketBuy"}),
        ]);
        assert_eq!(stats.trading.market_sells, 2);
        assert_eq!(stats.trading.market_buys, 1);
        assert_eq!(stats.trading.trade_profit, 3000);
    }

    #[test]
    fn docking_and_missions() {
        let stats = fold_all(&[
            json!({"event": "Docked", "StationName": "Abraham Lincoln"}),
            json!({"event": "Undocked"}),
            json!({"event": "MissionAccepted", "MissionID": 1}),
            json!({"event": "MissionCompleted", "MissionID": 1, "Reward": 90000}),
            json!({"event": "MissionFailed", "MissionID": 2}),
            json!({"event": "MissionAbandoned", "MissionID": 3}),
            json!({"event": "MultiSellExplorationData", "TotalEarnings": 120000}),
        ]);
        assert_eq!(stats.docking_count(), 2);
        assert!(stats.stations_visited.contains("Abraham Lincoln"));
        assert_eq!(stats.missions.accepted, 1);
        assert_eq!(stats.missions.completed, 1);
        assert_eq!(stats.missions.rewards, 90000);
        assert_eq!(stats.missions.failed, 1);
        assert_eq!(stats.missions.abandoned, 1);
        assert_eq!(stats.exploration.exploration_value, 120000);
    }

    #[test]
    fn unknown_events_still_count() {
        let stats = fold_all(&[json!({"NoEvent": true})]);
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.event_counts["Unknown"], 1);
        assert!(stats.last_event_time.is_none());
    }
}
