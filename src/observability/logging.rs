//! Structured logging for the bridge
//!
//! Configured from the environment:
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: `json`, `pretty` or `compact` (default json)
//! - `LOG_SPANS`: `true` to emit span open/close events (default false)
//! - `RUST_LOG`: full filter override
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG pulsar-bridge --config bridge.toml run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown formats fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// Raw `RUST_LOG` value, replaces the default filter when set
    pub filter_override: Option<String>,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self::from_values(
            env::var("LOG_LEVEL").ok().as_deref(),
            env::var("LOG_FORMAT").ok().as_deref(),
            env::var("LOG_SPANS").ok().as_deref(),
            env::var("RUST_LOG").ok(),
        )
    }

    fn from_values(
        level: Option<&str>,
        format: Option<&str>,
        spans: Option<&str>,
        filter_override: Option<String>,
    ) -> Self {
        Self {
            level: parse_level(level.unwrap_or("INFO")),
            format: LogFormat::parse(format.unwrap_or("json")),
            include_spans: spans.is_some_and(|s| s.eq_ignore_ascii_case("true")),
            filter_override: filter_override.filter(|f| !f.trim().is_empty()),
        }
    }

    /// Filter directives: the chosen level, with the broker client and
    /// runtime held at warn
    pub fn filter_directives(&self) -> String {
        match self.filter_override {
            Some(ref directives) => directives.clone(),
            None => format!("{},pulsar=warn,tokio=warn", self.level),
        }
    }
}

/// Unknown levels fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install the global subscriber; later calls are ignored
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(config.filter_directives())
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));
    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let registry = tracing_subscriber::registry().with(filter);
    let _ = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(span_events))
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
    };
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    init_logging(&LoggingConfig::from_env());
}

/// Span around connection construction and teardown
#[macro_export]
macro_rules! connection_span {
    ($($field:tt)*) => {
        tracing::info_span!("pulsar_connection", $($field)*)
    };
}

/// Span around producer creation and sends
#[macro_export]
macro_rules! publish_span {
    ($($field:tt)*) => {
        tracing::info_span!("pulsar_publish", $($field)*)
    };
}

/// Span around a handler's subscription and receive loop
#[macro_export]
macro_rules! consume_span {
    ($($field:tt)*) => {
        tracing::info_span!("pulsar_consume", $($field)*)
    };
}

/// Span around process start and shutdown
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

pub use {connection_span, consume_span, lifecycle_span, publish_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PrEtTy"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
        assert_eq!(LogFormat::parse(""), LogFormat::Json);
    }

    #[test]
    fn test_parse_level() {
        for (input, expected) in [
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Info", Level::INFO),
            ("debug", Level::DEBUG),
            ("TRACE", Level::TRACE),
            ("verbose", Level::INFO),
        ] {
            assert_eq!(parse_level(input), expected, "input '{input}'");
        }
    }

    #[test]
    fn test_defaults() {
        let config = LoggingConfig::from_values(None, None, None, None);
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.include_spans);
        assert_eq!(config.filter_directives(), "INFO,pulsar=warn,tokio=warn");
    }

    #[test]
    fn test_spans_flag() {
        for (input, expected) in [("true", true), ("TRUE", true), ("yes", false), ("1", false)] {
            let config = LoggingConfig::from_values(None, None, Some(input), None);
            assert_eq!(config.include_spans, expected, "input '{input}'");
        }
    }

    #[test]
    fn test_rust_log_override() {
        let config = LoggingConfig::from_values(
            Some("DEBUG"),
            Some("compact"),
            None,
            Some("pulsar_bridge=trace".to_string()),
        );
        assert_eq!(config.filter_directives(), "pulsar_bridge=trace");

        let blank = LoggingConfig::from_values(Some("DEBUG"), None, None, Some("  ".to_string()));
        assert_eq!(blank.filter_directives(), "DEBUG,pulsar=warn,tokio=warn");
    }
}
