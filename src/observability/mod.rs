//! Logging and metrics initialization.

mod logging;
mod metrics;

pub use logging::{LogFormat, LoggingConfig};
pub use metrics::{MetricsConfig, install_prometheus};

use crate::{Error, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Full observability configuration.
#[derive(Debug)]
pub struct ObservabilityConfig {
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
    /// Whether to expose metrics via HTTP listener.
    pub metrics_expose: bool,
}

/// Handle for observability runtime components.
#[derive(Debug, Default)]
pub struct ObservabilityHandle {
    metrics: Option<PrometheusHandle>,
}

impl ObservabilityHandle {
    /// Renders the current metrics in Prometheus text format, if enabled.
    #[must_use]
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}

static OBSERVABILITY_INIT: OnceLock<()> = OnceLock::new();

/// Initializes logging and metrics for the process.
///
/// # Errors
///
/// Returns an error if observability has already been initialized, the log
/// file cannot be opened, or the metrics exporter fails to start.
pub fn init(config: ObservabilityConfig) -> Result<ObservabilityHandle> {
    if OBSERVABILITY_INIT.get().is_some() {
        return Err(Error::operation(
            "observability_init",
            "observability already initialized",
        ));
    }

    let metrics = install_prometheus(&config.metrics, config.metrics_expose)?;

    match (&config.logging.file, config.logging.format) {
        (Some(log_file), LogFormat::Json) => {
            let writer = open_log_file(log_file)?;
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_current_span(true)
                        .with_target(true),
                )
                .with(config.logging.filter)
                .try_init()
                .map_err(init_error)?;
        },
        (Some(log_file), LogFormat::Pretty) => {
            let writer = open_log_file(log_file)?;
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
                .with(config.logging.filter)
                .try_init()
                .map_err(init_error)?;
        },
        (None, LogFormat::Json) => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr)
                        .with_current_span(true)
                        .with_target(true),
                )
                .with(config.logging.filter)
                .try_init()
                .map_err(init_error)?;
        },
        (None, LogFormat::Pretty) => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(io::stderr)
                        .with_target(true),
                )
                .with(config.logging.filter)
                .try_init()
                .map_err(init_error)?;
        },
    }

    OBSERVABILITY_INIT
        .set(())
        .map_err(|()| Error::operation("observability_init", "failed to mark observability initialized"))?;

    Ok(ObservabilityHandle { metrics })
}

/// Thread-safe file writer for logging.
#[derive(Clone)]
struct LogFileWriter {
    file: Arc<Mutex<File>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;
        guard.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Opens a log file for appending, creating parent directories.
fn open_log_file(path: &Path) -> Result<LogFileWriter> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::operation("create_log_dir", e))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::operation("open_log_file", format!("{}: {e}", path.display())))?;

    Ok(LogFileWriter {
        file: Arc::new(Mutex::new(file)),
    })
}

#[allow(clippy::needless_pass_by_value)]
fn init_error(e: tracing_subscriber::util::TryInitError) -> Error {
    Error::operation("observability_init", e)
}
