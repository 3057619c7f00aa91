use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use colored::Colorize;

use edjournal_db::{Database, Session, SessionFilter, SessionRollup};
use edjournal_journal::FileLedgerEntry;

pub struct ListArgs {
    pub commander: Option<String>,
    pub limit: Option<usize>,
    pub after: Option<String>,
    pub before: Option<String>,
    pub json: bool,
}

pub fn handle_sessions_command(db: &Database, args: ListArgs) -> Result<()> {
    let filter = build_filter(args.commander, args.after, args.before, args.limit)?;
    let sessions = db.sessions()?.list(&filter)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else if sessions.is_empty() {
        println!("{}", "No sessions found.".dimmed());
    } else {
        print_sessions_table(&sessions);
    }
    Ok(())
}

pub fn handle_stats_command(db: &Database, commander: Option<String>, json: bool) -> Result<()> {
    let filter = build_filter(commander.clone(), None, None, None)?;
    let rollup = db.sessions()?.rollup(&filter)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rollup)?);
    } else if rollup.total_sessions == 0 {
        println!("{}", "No sessions found.".dimmed());
    } else {
        print_stats(commander.as_deref(), &rollup);
    }

    let quarantined = db.quarantine()?.count()?;
    if quarantined > 0 && !json {
        println!();
        println!(
            "{}",
            format!("{} unreadable row(s) were quarantined", quarantined).bright_yellow()
        );
    }
    Ok(())
}

fn build_filter(
    commander: Option<String>,
    after: Option<String>,
    before: Option<String>,
    limit: Option<usize>,
) -> Result<SessionFilter> {
    let after = after
        .map(|s| parse_date(&s, false))
        .transpose()?;
    let before = before
        .map(|s| parse_date(&s, true))
        .transpose()?;

    Ok(SessionFilter {
        identity: commander,
        after,
        before,
        limit,
    })
}

/// `YYYY-MM-DD` as the first or last second of that day, UTC.
fn parse_date(s: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| anyhow!("Invalid date '{}': {}", s, e))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| anyhow!("Invalid date '{}'", s))
}

fn print_sessions_table(sessions: &[Session]) {
    println!(
        "{:<20} {:<16} {:<8} {:<6} {:<9} {:<12} {}",
        "STARTED".dimmed(),
        "COMMANDER".dimmed(),
        "DURATION".dimmed(),
        "JUMPS".dimmed(),
        "LY".dimmed(),
        "CREDITS".dimmed(),
        "SHIP".dimmed(),
    );

    for s in sessions {
        let started = display_time(&s.start_time);
        let duration = s
            .end_time
            .as_deref()
            .and_then(|end| span_secs(&s.start_time, end))
            .map(format_duration)
            .unwrap_or_else(|| "...".to_string());
        let delta = s.stats.credits_delta();
        let credits = if delta > 0 {
            format!("+{}", delta).bright_green().to_string()
        } else if delta < 0 {
            delta.to_string().bright_red().to_string()
        } else {
            "0".dimmed().to_string()
        };
        let ship = s.stats.last_ship.as_deref().unwrap_or("-");

        println!(
            "{:<20} {:<16} {:<8} {:<6} {:<9.2} {:<12} {}",
            started,
            s.identity,
            duration,
            s.stats.travel.jumps,
            s.stats.travel.light_years,
            credits,
            ship
        );
    }
}

fn print_stats(commander: Option<&str>, rollup: &SessionRollup) {
    let title = match commander {
        Some(name) => format!("=== Statistics for CMDR {} ===", name),
        None => "=== Session Statistics ===".to_string(),
    };
    println!("{}", title.bright_blue().bold());
    println!("{}  {}", "Sessions:".dimmed(), rollup.total_sessions);
    if let (Some(first), Some(last)) = (&rollup.first_session, &rollup.last_session) {
        println!(
            "{}  {} .. {}",
            "Span:".dimmed(),
            display_time(first),
            display_time(last)
        );
    }
    println!("{}  {}", "Events:".dimmed(), rollup.total_events);

    println!();
    println!("{}", "Travel:".dimmed());
    println!(
        "  {} jumps, {:.2} ly, {} systems",
        rollup.total_jumps, rollup.total_light_years, rollup.total_systems_visited
    );
    println!(
        "  {} docked, {} stations, {} landings",
        rollup.total_docked, rollup.total_stations_visited, rollup.total_planets_landed
    );

    println!("{}", "Credits:".dimmed());
    println!(
        "  net {}, earned {}, spent {}",
        rollup.total_credits_delta, rollup.total_money_earned, rollup.total_money_spent
    );
    println!(
        "  bounties {}, bonds {}, exploration {}, trade {}, missions {}",
        rollup.total_bounties,
        rollup.total_combat_bonds,
        rollup.total_exploration_value,
        rollup.total_trade_profit,
        rollup.total_mission_rewards
    );

    println!("{}", "Combat:".dimmed());
    println!(
        "  {} kills, {} deaths in {} sessions",
        rollup.total_kills, rollup.total_deaths, rollup.sessions_with_death
    );

    println!("{}", "Exploration:".dimmed());
    println!(
        "  {} scans, {} FSS, {} DSS, {} codex",
        rollup.total_scans, rollup.total_fss_scans, rollup.total_dss_scans, rollup.total_codex_entries
    );

    println!("{}", "Missions:".dimmed());
    println!(
        "  {} accepted, {} completed, {} failed, {} abandoned",
        rollup.total_missions_accepted,
        rollup.total_missions_completed,
        rollup.total_missions_failed,
        rollup.total_missions_abandoned
    );
}

pub fn print_ledger(entries: &[FileLedgerEntry]) {
    if entries.is_empty() {
        println!("{}", "No journal files found.".dimmed());
        return;
    }

    println!(
        "{:<40} {:<12} {:<12} {}",
        "FILE".dimmed(),
        "CONSUMED".dimmed(),
        "SIZE".dimmed(),
        "STATE".dimmed(),
    );
    for entry in entries {
        let name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry.path.display().to_string());
        let state = if entry.fully_closed {
            "closed".dimmed().to_string()
        } else if entry.has_pending(entry.size_at_last_read) {
            "pending".bright_yellow().to_string()
        } else {
            "active".bright_cyan().to_string()
        };
        println!(
            "{:<40} {:<12} {:<12} {}",
            name, entry.bytes_consumed, entry.size_at_last_read, state
        );
    }
}

fn display_time(ts: &str) -> String {
    DateTime::parse_from_rfc3339(ts)
        .map(|t| t.with_timezone(&Utc).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|_| ts.to_string())
}

fn span_secs(start: &str, end: &str) -> Option<f64> {
    let start = DateTime::parse_from_rfc3339(start).ok()?;
    let end = DateTime::parse_from_rfc3339(end).ok()?;
    Some((end - start).num_seconds().max(0) as f64)
}

fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else if secs < 3600.0 {
        let mins = (secs / 60.0).floor() as u64;
        let remaining_secs = (secs % 60.0) as u64;
        format!("{}m {}s", mins, remaining_secs)
    } else {
        let hours = (secs / 3600.0).floor() as u64;
        let mins = ((secs % 3600.0) / 60.0) as u64;
        format!("{}h {}m", hours, mins)
    }
}
