//! Diagnostic tracing for the gauntlet.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: operator diagnostics on stderr, optionally
//!   mirrored at DEBUG level to a log file. Controlled by `--log-level` or
//!   `RUST_LOG`.
//! - **Invocation log (`io/invocation_log`)** and **run report
//!   (`io/report`)**: product artifacts. Always written, unaffected by log
//!   level.

use std::fs::{self, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`. When `log_file` is set, a second
/// layer appends every DEBUG-and-above event to it; keep the returned guard
/// alive until exit so buffered lines are flushed.
///
/// # Example
/// ```bash
/// RUST_LOG=gauntlet=debug gauntlet ./project --source new.py --dest src/main.py
/// ```
pub fn init(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{level}'"))?;
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_filter(filter);

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(console).init();
        return Ok(None);
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .init();
    Ok(Some(guard))
}
