use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// User-facing progress of the ingestion engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    ReplayStarted {
        journal_dir: PathBuf,
        files: usize,
    },
    FileOpened {
        path: PathBuf,
        offset: u64,
    },
    ReplayFinished {
        events: u64,
        parse_failures: u64,
        duration_secs: f64,
    },
    LiveModeEntered {
        journal_dir: PathBuf,
    },
    SessionOpened {
        identity: String,
        session_id: String,
        start_time: String,
        source_file: String,
    },
    SessionClosed {
        identity: String,
        session_id: String,
        end_time: String,
        jumps: u64,
        total_events: u64,
        credits_delta: i64,
    },
    ParseFailures {
        path: PathBuf,
        count: usize,
    },
    SourceMissing {
        journal_dir: PathBuf,
    },
    StoreUnavailable {
        error: String,
    },
    StoreRecovered,
    MigrationFinished {
        sessions: usize,
        files: usize,
        skipped: usize,
    },
    ShutdownComplete {
        events: u64,
    },
}

impl IngestEvent {
    /// Add a timestamp to serialize with the event
    fn with_timestamp(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        value
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format with colors
    #[default]
    Pretty,
    /// JSON lines format for machine consumption
    Json,
    /// Compact single-line format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Logger for ingestion events - handles both console output and file logging
pub struct Logger {
    format: LogFormat,
    quiet: bool,
    file_writer: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            quiet: false,
            file_writer: None,
        }
    }

    /// A logger that prints nothing. Used by tests and one-shot commands.
    pub fn quiet() -> Self {
        Self {
            format: LogFormat::Compact,
            quiet: true,
            file_writer: None,
        }
    }

    /// Create a logger with file output in addition to console
    pub fn with_file(format: LogFormat, log_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Self {
            format,
            quiet: false,
            file_writer: Some(Mutex::new(file)),
        })
    }

    pub fn log(&self, event: &IngestEvent) {
        // File output is always JSON
        if let Some(ref writer) = self.file_writer {
            if let Ok(mut file) = writer.lock() {
                let json = event.with_timestamp();
                let _ = writeln!(file, "{}", json);
            }
        }

        if self.quiet {
            return;
        }

        match self.format {
            LogFormat::Json => self.log_json(event),
            LogFormat::Pretty => self.log_pretty(event),
            LogFormat::Compact => self.log_compact(event),
        }
    }

    fn log_json(&self, event: &IngestEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{}", json);
        }
    }

    fn log_pretty(&self, event: &IngestEvent) {
        let mut stderr = std::io::stderr();
        match event {
            IngestEvent::ReplayStarted { journal_dir, files } => {
                let _ = writeln!(
                    stderr,
                    "{} {} {} ({} {})",
                    "▶".bright_blue(),
                    "Replaying".bold(),
                    journal_dir.display().to_string().dimmed(),
                    files,
                    plural(*files as u64, "file", "files")
                );
            }
            IngestEvent::FileOpened { path, offset } => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                if *offset > 0 {
                    let _ = writeln!(
                        stderr,
                        "    {} {} {}",
                        "│".dimmed(),
                        name,
                        format!("from byte {}", offset).dimmed()
                    );
                } else {
                    let _ = writeln!(stderr, "    {} {}", "│".dimmed(), name);
                }
            }
            IngestEvent::ReplayFinished {
                events,
                parse_failures,
                duration_secs,
            } => {
                let _ = writeln!(
                    stderr,
                    "    {} {} {} ({:.1}s)",
                    "✓".bright_green(),
                    events,
                    plural(*events, "event", "events"),
                    duration_secs
                );
                if *parse_failures > 0 {
                    let _ = writeln!(
                        stderr,
                        "    {} {} unreadable {} skipped",
                        "⚠".bright_yellow(),
                        parse_failures,
                        plural(*parse_failures, "line", "lines")
                    );
                }
            }
            IngestEvent::LiveModeEntered { .. } => {
                let _ = writeln!(
                    stderr,
                    "{} {}",
                    "●".bright_green(),
                    "Live: waiting for new journal entries".bright_green()
                );
            }
            IngestEvent::SessionOpened {
                identity,
                start_time,
                ..
            } => {
                let _ = writeln!(
                    stderr,
                    "  {} {} {}",
                    "▶".bright_cyan(),
                    format!("CMDR {}", identity).bright_cyan().bold(),
                    format!("session started {}", start_time).dimmed()
                );
            }
            IngestEvent::SessionClosed {
                identity,
                end_time,
                jumps,
                total_events,
                credits_delta,
                ..
            } => {
                let credits = if *credits_delta >= 0 {
                    format!("+{} cr", credits_delta).green()
                } else {
                    format!("{} cr", credits_delta).red()
                };
                let _ = writeln!(
                    stderr,
                    "  {} CMDR {} session closed {} ({} {}, {} {}, {})",
                    "■".bright_magenta(),
                    identity,
                    end_time.dimmed(),
                    jumps,
                    plural(*jumps, "jump", "jumps"),
                    total_events,
                    plural(*total_events, "event", "events"),
                    credits
                );
            }
            IngestEvent::ParseFailures { path, count } => {
                let _ = writeln!(
                    stderr,
                    "    {} {} unreadable {} in {}",
                    "⚠".bright_yellow(),
                    count,
                    plural(*count as u64, "line", "lines"),
                    path.display()
                );
            }
            IngestEvent::SourceMissing { journal_dir } => {
                let _ = writeln!(
                    stderr,
                    "{} Journal directory not found: {} (waiting)",
                    "⚠".bright_yellow(),
                    journal_dir.display()
                );
            }
            IngestEvent::StoreUnavailable { error } => {
                let _ = writeln!(
                    stderr,
                    "{} Session store unavailable: {}",
                    "✗".bright_red(),
                    error.bright_red()
                );
            }
            IngestEvent::StoreRecovered => {
                let _ = writeln!(stderr, "{} Session store available again", "✓".bright_green());
            }
            IngestEvent::MigrationFinished {
                sessions,
                files,
                skipped,
            } => {
                let _ = writeln!(
                    stderr,
                    "{} Imported {} legacy {} and {} processed {}",
                    "✓".bright_green(),
                    sessions,
                    plural(*sessions as u64, "session", "sessions"),
                    files,
                    plural(*files as u64, "file", "files")
                );
                if *skipped > 0 {
                    let _ = writeln!(
                        stderr,
                        "    {} {} malformed {} skipped",
                        "⚠".bright_yellow(),
                        skipped,
                        plural(*skipped as u64, "entry", "entries")
                    );
                }
            }
            IngestEvent::ShutdownComplete { events } => {
                let _ = writeln!(
                    stderr,
                    "{} Stopped after {} {}",
                    "■".dimmed(),
                    events,
                    plural(*events, "event", "events")
                );
            }
        }
    }

    fn log_compact(&self, event: &IngestEvent) {
        let mut stderr = std::io::stderr();
        let timestamp = chrono::Utc::now().format("%H:%M:%S");
        let msg = match event {
            IngestEvent::ReplayStarted { files, .. } => {
                format!("[{}] replay:start files={}", timestamp, files)
            }
            IngestEvent::FileOpened { path, offset } => {
                format!("[{}] file:{} @{}", timestamp, path.display(), offset)
            }
            IngestEvent::ReplayFinished {
                events,
                parse_failures,
                duration_secs,
            } => format!(
                "[{}] replay:done events={} failures={} {:.1}s",
                timestamp, events, parse_failures, duration_secs
            ),
            IngestEvent::LiveModeEntered { .. } => format!("[{}] live", timestamp),
            IngestEvent::SessionOpened {
                identity,
                start_time,
                ..
            } => format!("[{}] session:open {} {}", timestamp, identity, start_time),
            IngestEvent::SessionClosed {
                identity,
                end_time,
                jumps,
                total_events,
                credits_delta,
                ..
            } => format!(
                "[{}] session:close {} {} jumps={} events={} credits={}",
                timestamp, identity, end_time, jumps, total_events, credits_delta
            ),
            IngestEvent::ParseFailures { path, count } => {
                format!("[{}] parse:fail:{} {}", timestamp, count, path.display())
            }
            IngestEvent::SourceMissing { journal_dir } => {
                format!("[{}] source:missing {}", timestamp, journal_dir.display())
            }
            IngestEvent::StoreUnavailable { error } => {
                format!("[{}] store:unavailable {}", timestamp, error)
            }
            IngestEvent::StoreRecovered => format!("[{}] store:ok", timestamp),
            IngestEvent::MigrationFinished {
                sessions,
                files,
                skipped,
            } => format!(
                "[{}] migrate:done sessions={} files={} skipped={}",
                timestamp, sessions, files, skipped
            ),
            IngestEvent::ShutdownComplete { events } => {
                format!("[{}] stop events={}", timestamp, events)
            }
        };
        let _ = writeln!(stderr, "{}", msg);
    }
}

fn plural(n: u64, one: &'static str, many: &'static str) -> &'static str {
    if n == 1 {
        one
    } else {
        many
    }
}
