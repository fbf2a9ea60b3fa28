//! Tracing setup for the `botstrap` binary.

use crate::runtime::FilesystemLayout;
use crate::runtime::constants::{env as names, filenames};
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Keeps the file writer flushing until dropped.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Filter from `BOTSTRAP_LOG`, then `RUST_LOG`, else `info`.
pub fn env_filter() -> EnvFilter {
    std::env::var(names::BOTSTRAP_LOG)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber: stderr always, plus a daily rolling file
/// under `<home>/logs` when `layout` is given.
pub fn init_logging(layout: Option<&FilesystemLayout>) -> BotstrapResult<LoggingGuard> {
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = match layout {
        Some(layout) => {
            let logs_dir = layout.logs_dir();
            std::fs::create_dir_all(&logs_dir).map_err(|e| {
                BotstrapError::Storage(format!(
                    "Failed to create log directory {}: {}",
                    logs_dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::daily(&logs_dir, filenames::LOG_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr)
        .with(file_layer)
        .try_init()
        .map_err(|e| BotstrapError::Internal(format!("Failed to initialize logging: {}", e)))?;

    Ok(LoggingGuard { _file: guard })
}
