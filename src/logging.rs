use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::CommonConfig;

/// Initialises the tracing subscriber for a binary. With `log_output =
/// "file"` the role gets its own file under `log_path`; the returned guard
/// must be held for the lifetime of the process.
pub fn init_tracing(role: &str, log_path: &str, common: &CommonConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(common.log_level.clone()));

    if common.log_output == "file" {
        if let Err(e) = std::fs::create_dir_all(log_path) {
            eprintln!("Failed to create log directory '{}': {}", log_path, e);
        }
        let appender = tracing_appender::rolling::never(log_path, format!("{}.log", role));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}
