//! Structured logging configuration.

use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(crate::Error::InvalidInput(format!("unknown log format: {other}"))),
        }
    }
}

/// Logging configuration.
#[derive(Debug)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Event filter.
    pub filter: EnvFilter,
    /// Optional file to append to instead of stderr.
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Builds the logging configuration.
    ///
    /// Filter precedence: `CONCIERGE_LOG`, then `RUST_LOG`, then `directive`,
    /// then `debug` when `verbose` is set, otherwise `info`.
    #[must_use]
    pub fn new(format: LogFormat, directive: Option<&str>, file: Option<PathBuf>, verbose: bool) -> Self {
        let fallback = if verbose { "debug" } else { "info" };
        let directive = std::env::var("CONCIERGE_LOG")
            .ok()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .or_else(|| directive.map(str::to_string))
            .unwrap_or_else(|| fallback.to_string());

        let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(fallback));

        Self {
            format,
            filter,
            file,
        }
    }
}
