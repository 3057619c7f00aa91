mod config;
mod sessions;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::Notify;
use tracing::{info, warn};

use config::Config;
use edjournal_core::{
    Engine, EngineConfig, IngestionStatus, Ingestor, IngestorConfig, LiveSessionSnapshot,
    NoopProfileSink, RecentEvents,
};
use edjournal_db::legacy::has_legacy_artifacts;
use edjournal_db::{migrate_legacy, Database, MigrationError, MigrationReport};
use edjournal_logging::{init_tracing, IngestEvent, LogFormat, Logger};

#[derive(Parser, Debug)]
#[command(
    name = "edjournal",
    about = "Elite Dangerous journal ingestion and session history",
    version,
    author
)]
struct Cli {
    /// Config file (default: <config dir>/edjournal/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory the game writes journal files into
    #[arg(long, global = true)]
    journal_dir: Option<PathBuf>,

    /// Directory for the database and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Directory holding flat-file history to import (default: ~/.edla)
    #[arg(long, global = true)]
    legacy_dir: Option<PathBuf>,

    /// Diagnostic log level (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatChoice>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay the journal directory, then follow it until Ctrl+C (default)
    Watch,

    /// List closed sessions, newest first
    Sessions {
        /// Only sessions of this commander
        #[arg(long)]
        commander: Option<String>,

        /// Show at most this many sessions
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Show sessions started on or after this date (YYYY-MM-DD)
        #[arg(long)]
        after: Option<String>,

        /// Show sessions started on or before this date (YYYY-MM-DD)
        #[arg(long)]
        before: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show totals across closed sessions
    Stats {
        /// Only sessions of this commander
        #[arg(long)]
        commander: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Import legacy session and processed-file lists
    Migrate,

    /// Re-check the file ledger against the journal directory and catch up
    Rescan {
        /// Zero every read offset first so all files are replayed
        #[arg(long)]
        reset: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatChoice {
    Pretty,
    Json,
    Compact,
}

impl From<LogFormatChoice> for LogFormat {
    fn from(choice: LogFormatChoice) -> Self {
        match choice {
            LogFormatChoice::Pretty => LogFormat::Pretty,
            LogFormatChoice::Json => LogFormat::Json,
            LogFormatChoice::Compact => LogFormat::Compact,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?.unwrap_or_default();
    apply_overrides(&mut config, &cli);

    // Keep the guard alive until exit so buffered file logs are flushed.
    let log_dir = config.log_dir();
    let _tracing_guard = init_tracing(
        &config.logging.level,
        config.logging.format,
        log_dir.as_deref(),
    );

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(&config).await,
        Command::Sessions {
            commander,
            limit,
            after,
            before,
            json,
        } => {
            let db = open_database(&config)?;
            sessions::handle_sessions_command(
                &db,
                sessions::ListArgs {
                    commander,
                    limit,
                    after,
                    before,
                    json,
                },
            )
        }
        Command::Stats { commander, json } => {
            let db = open_database(&config)?;
            sessions::handle_stats_command(&db, commander, json)
        }
        Command::Migrate => {
            let db = open_database(&config)?;
            let dir = config.legacy_dir();
            let logger = create_logger(&config)?;
            if !has_legacy_artifacts(&dir) {
                eprintln!("No legacy artifacts in {}", dir.display());
                return Ok(());
            }
            let report = migrate_legacy(&db, &dir)
                .with_context(|| format!("Failed to migrate {}", dir.display()))?;
            log_migration(&logger, &report);
            Ok(())
        }
        Command::Rescan { reset } => rescan(&config, reset).await,
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(ref dir) = cli.journal_dir {
        config.journal_dir = Some(dir.clone());
    }
    if let Some(ref dir) = cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(ref dir) = cli.legacy_dir {
        config.legacy_dir = Some(dir.clone());
    }
    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
}

fn open_database(config: &Config) -> Result<Database> {
    let path = config.database_path();
    Database::open_at(&path).with_context(|| format!("Failed to open {}", path.display()))
}

fn create_logger(config: &Config) -> Result<Logger> {
    match config.log_dir() {
        Some(dir) => {
            let path = dir.join("ingest.jsonl");
            Logger::with_file(config.logging.format, &path)
                .with_context(|| format!("Failed to open {}", path.display()))
        }
        None => Ok(Logger::new(config.logging.format)),
    }
}

fn ingestor_config(config: &Config) -> IngestorConfig {
    IngestorConfig {
        journal_dir: config.journal_dir(),
        tailer: config.tailer_options(),
    }
}

async fn watch(config: &Config) -> Result<()> {
    let db = Arc::new(open_database(config)?);
    let logger = Arc::new(create_logger(config)?);

    run_pending_migration(&db, &config.legacy_dir(), &logger)?;

    let sink = Arc::new(RecentEvents::new(config.recent_events));
    let ingestor = Ingestor::open(db, ingestor_config(config), sink, logger.clone())
        .context("Failed to open the ingestion state")?;

    // Stop a long replay between batches as soon as Ctrl+C arrives.
    let interrupt_handle = ingestor.interrupt_handle();
    let stop = Arc::new(Notify::new());
    let stop_signal = stop.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted. Closing the open session...");
        interrupt_handle.store(true, Ordering::SeqCst);
        stop_signal.notify_one();
    })
    .context("Failed to install the Ctrl+C handler")?;

    let handle = Engine::spawn(
        ingestor,
        EngineConfig {
            poll_interval: config.poll_interval,
            ..Default::default()
        },
    );
    info!(journal_dir = ?config.journal_dir(), "watching journal directory");

    stop.notified().await;

    let status = handle.ingestion_status();
    let live = handle.live_view().read();
    handle
        .shutdown()
        .await
        .context("Ingestion worker failed during shutdown")?;
    if let Some(snapshot) = live.as_deref() {
        print_live(snapshot);
    }
    print_status(&status);
    Ok(())
}

/// Where the session that was just closed left off.
fn print_live(snapshot: &LiveSessionSnapshot) {
    eprintln!();
    eprintln!("CMDR {}", snapshot.identity);
    if let Some(system) = snapshot.current_system() {
        eprintln!("System: {}", system);
    }
    if let Some(ship) = snapshot.current_ship() {
        eprintln!("Ship: {}", ship);
    }
    if let Some(credits) = snapshot.current_credits() {
        eprintln!("Credits: {} ({:+} this session)", credits, snapshot.stats.credits_delta());
    }
}

/// Import legacy artifacts before the first ingestion. A conflict leaves
/// the artifacts in place; the next start imports them again.
fn run_pending_migration(db: &Database, dir: &Path, logger: &Logger) -> Result<()> {
    if !has_legacy_artifacts(dir) {
        return Ok(());
    }
    match migrate_legacy(db, dir) {
        Ok(report) => {
            log_migration(logger, &report);
            Ok(())
        }
        Err(err @ MigrationError::Conflict { .. }) => {
            warn!(error = %err, "legacy migration incomplete; will retry on next start");
            Ok(())
        }
        Err(err) => {
            Err(err).with_context(|| format!("Failed to migrate legacy artifacts in {}", dir.display()))
        }
    }
}

fn log_migration(logger: &Logger, report: &MigrationReport) {
    logger.log(&IngestEvent::MigrationFinished {
        sessions: report.sessions,
        files: report.files,
        skipped: report.skipped,
    });
}

async fn rescan(config: &Config, reset: bool) -> Result<()> {
    let db = Arc::new(open_database(config)?);
    let logger = Arc::new(create_logger(config)?);
    let mut ingestor = Ingestor::open(
        db,
        ingestor_config(config),
        Arc::new(NoopProfileSink),
        logger,
    )
    .context("Failed to open the ingestion state")?;

    if reset {
        let files = ingestor.reset().context("Failed to reset the file ledger")?;
        eprintln!("Reset {} ledger entries", files);
    }
    // The open session stays checkpointed as open; `watch` resumes it.
    ingestor
        .revalidate()
        .await
        .context("Failed to catch up with the journal directory")?;

    sessions::print_ledger(&ingestor.ledger_entries());
    print_status(&ingestor.status());
    Ok(())
}

fn print_status(status: &IngestionStatus) {
    eprintln!();
    if !status.directory_present {
        eprintln!("=== NO JOURNAL DIRECTORY ===");
    } else if !status.store_available {
        eprintln!("=== STORE UNAVAILABLE ===");
    } else {
        eprintln!("=== DONE ===");
    }
    eprintln!("Files: {}", status.files_known);
    eprintln!("Events folded: {}", status.events_folded);
    if status.parse_failures > 0 {
        eprintln!("Unreadable lines: {}", status.parse_failures);
    }
    if status.orphaned_events > 0 {
        eprintln!("Events outside a session: {}", status.orphaned_events);
    }
    if status.dropped_notifications > 0 {
        eprintln!("Dropped notifications: {}", status.dropped_notifications);
    }
}
