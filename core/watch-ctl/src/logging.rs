//! File logging for the CLI.
//!
//! stdout carries the daemon's replies, so diagnostics go to a daily-rolling
//! file under `~/.stagewatch/logs` instead.

use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "stagewatch-ctl.log";

/// Installs the global subscriber. Keep the returned guard alive until exit so
/// buffered lines are flushed. Returns `None` when no log directory is usable.
pub fn init() -> Option<WorkerGuard> {
    let log_dir = dirs::home_dir()?.join(".stagewatch").join("logs");
    if let Err(err) = fs_err::create_dir_all(&log_dir) {
        eprintln!("stagewatch-ctl: logging disabled: {}", err);
        return None;
    }

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let debug_enabled = env::var("STAGEWATCH_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
