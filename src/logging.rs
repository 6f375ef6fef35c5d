// =============================================================================
// Logging setup — dual stdout/file sink (C10 ambient process shell)
// =============================================================================
//
// File output rotates daily via `tracing_appender::rolling::daily`, which
// names files `<prefix>.<YYYY-MM-DD>`. `current_log_path` reconstructs
// today's filename so `/ws/logs` can tail the same file the subscriber is
// currently writing to.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "runtime";

/// Initializes the global tracing subscriber with a stdout layer (respecting
/// `RUST_LOG`) and a plain-text daily-rotating file layer under `log_dir`.
/// The returned guard must be held for the lifetime of the process — dropping
/// it stops the background flush thread.
pub fn init(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = tracing_subscriber::fmt::layer();
    let file_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Path to the log file currently being written to, for `/ws/logs` to tail.
pub fn current_log_path(log_dir: &Path) -> PathBuf {
    let today = chrono::Utc::now().format("%Y-%m-%d");
    log_dir.join(format!("{LOG_FILE_PREFIX}.{today}"))
}
