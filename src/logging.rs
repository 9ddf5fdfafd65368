//! Subscriber setup
//!
//! Console output is always installed, filtered by the caller. With
//! `[logging] enabled = true`, events from this crate at or above the
//! configured level are also written as JSON lines to a daily-rotated file
//! `<dir>/<level>.<date>.log`.

use crate::config::{LogLevel, LoggingConfig};
use std::io;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Rotated files kept per level
const MAX_LOG_FILES: usize = 10;

/// Opens the rotating log file for the configured level
///
/// Creates the directory if needed. Returns `None` when file logging is off.
pub fn file_appender(config: &LoggingConfig) -> io::Result<Option<RollingFileAppender>> {
    if !config.enabled {
        return Ok(None);
    }

    std::fs::create_dir_all(&config.dir)?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(config.level.as_str())
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(&config.dir)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

/// JSON layer keeping this crate's events at `level` and above
pub fn json_layer<S, W>(writer: W, level: LogLevel) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_writer(writer)
        .with_filter(EnvFilter::new(format!("crawl_conductor={}", level.as_str())))
}

/// Installs the global subscriber
///
/// Keep the returned guard until exit; dropping it flushes the file writer.
pub fn init(console: EnvFilter, config: &LoggingConfig) -> io::Result<Option<WorkerGuard>> {
    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_filter(console);

    let (file_layer, guard) = match file_appender(config)? {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(json_layer(writer, config.level)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
