//! Configuration file support for edjournal.
//!
//! Loads `config.toml` from the platform config directory unless a path is
//! given on the command line. Every key is optional.

use anyhow::{Context, Result};
use edjournal_journal::{RetryPolicy, TailerOptions};
use edjournal_logging::LogFormat;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The config file name
pub const CONFIG_FILE_NAME: &str = "config.toml";

const DEFAULT_MAX_CHUNK_BYTES: u64 = 4 * 1024 * 1024;

const LEGACY_DIR_NAME: &str = ".edla";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Directory the game writes journal files into
    pub journal_dir: Option<PathBuf>,
    /// Holds the database and log files
    pub data_dir: Option<PathBuf>,
    /// Where the flat-file history from before the database lives
    pub legacy_dir: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub max_chunk_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub retry_base: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_cap: Duration,
    /// Recent events kept per commander
    pub recent_events: usize,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            journal_dir: None,
            data_dir: None,
            legacy_dir: None,
            poll_interval: Duration::from_secs(2),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(30),
            recent_events: edjournal_core::DEFAULT_RECENT_EVENTS,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Also write diagnostics and progress to `<data_dir>/logs`
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: false,
        }
    }
}

impl Config {
    /// Load configuration from `path`.
    ///
    /// Returns:
    /// - `Ok(Some(config))` if file exists and parses successfully
    /// - `Ok(None)` if file does not exist
    /// - `Err(...)` if file exists but fails to parse (hard error)
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Ok(Some(config))
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("edjournal")
            .join(CONFIG_FILE_NAME)
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.journal_dir.clone().unwrap_or_else(default_journal_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("edjournal")
        })
    }

    /// Defaults to `~/.edla`, where the flat-file sessions were kept.
    pub fn legacy_dir(&self) -> PathBuf {
        self.legacy_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(LEGACY_DIR_NAME)
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("edjournal.db")
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.logging.file.then(|| self.data_dir().join("logs"))
    }

    pub fn tailer_options(&self) -> TailerOptions {
        TailerOptions {
            max_chunk_bytes: self.max_chunk_bytes.max(1),
            retry: RetryPolicy {
                base: self.retry_base,
                cap: self.retry_cap.max(self.retry_base),
            },
        }
    }
}

/// Where the game writes journals on Windows, relative to the home directory.
fn default_journal_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Saved Games")
        .join("Frontier Developments")
        .join("Elite Dangerous")
}
