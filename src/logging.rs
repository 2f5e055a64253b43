//! Logging initialisation for vmstream.
//!
//! Logs always go to stderr, filtered by `RUST_LOG` (default `info`). When
//! `VMSTREAM_LOG_DIR` is set, a daily-rolling `vmstream.log` is written there
//! as well.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::PathBuf;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_DIR_ENV: &str = "VMSTREAM_LOG_DIR";
pub const LOG_FILE: &str = "vmstream.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init() -> LogGuard {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = match log_dir() {
        Some(dir) => {
            let _ = std::fs::create_dir_all(&dir);
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            tracing_subscriber::registry()
                .with(filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(file_layer)
                .init();

            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();

            None
        }
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

fn log_dir() -> Option<PathBuf> {
    std::env::var_os(LOG_DIR_ENV)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
}
