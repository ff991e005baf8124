//! Tracing subscriber setup for the `mdm` binary and embedders.

use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::MdmError;

/// Keeps the background log writer alive. Buffered lines are flushed when it
/// is dropped.
pub struct LoggingGuard {
    _writer: WorkerGuard,
}

/// Install a global subscriber writing to stderr through a non-blocking
/// writer, so stdout stays free for event output.
///
/// `RUST_LOG` overrides `config.level`. Fails if a global subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<LoggingGuard, MdmError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| MdmError::Logging(e.to_string()))?;
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(writer),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .try_init()
    };
    installed.map_err(|e| MdmError::Logging(e.to_string()))?;

    tracing::debug!(level = %config.level, json = config.json, "logging_initialized");
    Ok(LoggingGuard { _writer: guard })
}
