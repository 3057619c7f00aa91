//! # edjournal-logging
//!
//! Logging for the edjournal ingestion engine.
//!
//! ## Key Types
//!
//! - [`Logger`] - User-facing ingestion progress
//! - [`IngestEvent`] - Progress event types
//! - [`LogFormat`] - Output formats (Pretty, JSON, Compact)
//!
//! Diagnostics go through `tracing`; [`init_tracing`] installs the subscriber.

mod events;

pub use events::{IngestEvent, LogFormat, Logger};

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing for the application.
///
/// When `log_dir` is set, diagnostics are also written to a daily-rolling
/// JSON file there. Keep the returned guard alive until exit or buffered
/// lines are lost.
pub fn init_tracing(level: &str, format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "edjournal.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let result = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty | LogFormat::Compact => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("tracing already initialized: {}", e);
    }
    guard
}
