//! Logging setup: stderr for the operator, plus a plain-text file under the
//! installation's log directory when it can be opened.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEBUG_ENV_VAR: &str = "TELEMETRY_DEBUG_LOG";
const LOG_FILE_NAME: &str = "telemetry-ctl.log";

fn debug_requested() -> bool {
    matches!(
        std::env::var(DEBUG_ENV_VAR).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose || debug_requested() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn file_writer(
    logs_dir: &Path,
) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    if let Err(e) = fs_err::create_dir_all(logs_dir) {
        eprintln!("telemetry-ctl: file logging disabled: {}", e);
        return None;
    }
    match RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_NAME)
        .build(logs_dir)
    {
        Ok(appender) => Some(tracing_appender::non_blocking(appender)),
        Err(e) => {
            eprintln!("telemetry-ctl: file logging disabled: {}", e);
            None
        }
    }
}

/// Installs the global subscriber. The returned guard flushes the file
/// writer on drop and must be held for the life of `main`.
pub fn init(logs_dir: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter(verbose));

    let (file_layer, guard) = match logs_dir.and_then(file_writer) {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(verbose));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}
