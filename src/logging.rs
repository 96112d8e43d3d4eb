//! Tracing initialization.
//!
//! Structured, async-aware logging built on `tracing` and
//! `tracing-subscriber`: environment-based filtering, a choice of output
//! formats, and idempotent initialization so tests and embedding
//! applications can call it freely.

use crate::config::Settings;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    /// Pretty-printed with colors, for development.
    Pretty,
    /// Compact single-line output, for production.
    Compact,
    /// JSON, for log aggregation.
    Json,
}

/// Logging options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Minimum level when `RUST_LOG` is not set.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include file and line numbers.
    pub with_file_and_line: bool,
    /// Emit span open/close events.
    pub with_span_events: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            with_file_and_line: false,
            with_span_events: false,
        }
    }
}

impl LogOptions {
    /// Options with a given default level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Include file and line numbers.
    pub fn with_file_and_line(mut self, enabled: bool) -> Self {
        self.with_file_and_line = enabled;
        self
    }
}

/// Initialize tracing from loaded [`Settings`].
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    let level = parse_log_level(&settings.log_level)?;
    init(LogOptions::new(level))
}

/// Initialize tracing with explicit options.
///
/// Idempotent: if a global subscriber is already installed, this returns
/// `Ok(())` so libraries and tests can call it unconditionally.
pub fn init(options: LogOptions) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.level.to_string().to_lowercase()));

    let span_events = if options.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(options.with_file_and_line)
        .with_line_number(options.with_file_and_line);

    let result = match options.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(base.pretty().with_filter(env_filter))
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(base.compact().with_filter(env_filter))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(base.json().with_filter(env_filter))
            .try_init(),
    };

    match result {
        Ok(()) => Ok(()),
        // A subscriber installed by the host application or a previous call
        // is fine.
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(format!("failed to initialize tracing: {e}")),
    }
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "invalid log level '{level}', must be one of: trace, debug, info, warn, error"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Warn"), Ok(Level::WARN)));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_options_builder() {
        let options = LogOptions::new(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_file_and_line(true);
        assert!(matches!(options.level, Level::DEBUG));
        assert!(matches!(options.format, LogFormat::Json));
        assert!(options.with_file_and_line);
    }
}
