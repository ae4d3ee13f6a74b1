//! Tracing setup for the CLI.
//!
//! Diagnostics go to stderr so command output on stdout stays clean. The
//! long-running commands (`run`, `serve`) also write JSON lines to a daily
//! file under `.anvil/logs/`.
//!
//! Filter: `ANVIL_LOG`, then `RUST_LOG`, then `info` (`debug` with `--verbose`).

use anyhow::{Result, anyhow};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    pub format: LogFormat,
    pub verbose: bool,
    /// Directory for the rolling log file; no file when unset
    pub log_dir: Option<PathBuf>,
}

fn filter_directive(anvil_log: Option<String>, rust_log: Option<String>, verbose: bool) -> String {
    anvil_log
        .filter(|s| !s.trim().is_empty())
        .or_else(|| rust_log.filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string())
}

/// Install the global subscriber. Hold the returned guard until exit so the
/// file writer flushes.
pub fn init(options: &LoggingOptions) -> Result<Option<WorkerGuard>> {
    let directive = filter_directive(
        std::env::var("ANVIL_LOG").ok(),
        std::env::var("RUST_LOG").ok(),
        options.verbose,
    );
    let filter = EnvFilter::try_new(&directive).map_err(|e| anyhow!("Invalid log filter '{}': {}", directive, e))?;

    let stderr = match options.format {
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
    };

    let (file, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "anvil.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init()
        .map_err(|e| anyhow!("Failed to init tracing subscriber: {}", e))?;

    Ok(guard)
}
