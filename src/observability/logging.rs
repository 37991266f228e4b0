//! Structured logging system using tracing crate
//!
//! Provides contextual, machine-readable logging with span macros for client
//! sessions and the broker bridge.
//!
//! ## Log Format Options
//!
//! The output format is controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON format for production and log aggregation systems
//! - `pretty` - Human-readable format with colors and indentation for development
//! - `compact` - Terminal-friendly format with colors but minimal spacing
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ## Examples
//!
//! ```bash
//! # Production JSON logging
//! LOG_FORMAT=json LOG_LEVEL=INFO ./mqttsn-gateway run
//!
//! # Trace every forwarder transition of one session
//! LOG_FORMAT=compact RUST_LOG=mqttsn_gateway::session=trace ./mqttsn-gateway run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are chatty at debug level
const NOISY_TARGETS: &[&str] = &["rumqttc=warn", "tokio=warn", "mio=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string, defaulting to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name, defaulting to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn build_filter(level: Level) -> EnvFilter {
    // Allow RUST_LOG to override
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    NOISY_TARGETS
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

fn span_events(include_spans: bool) -> fmt::format::FmtSpan {
    if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    let result = match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    init_logging(level, format, include_spans);
}

/// Create a span covering one client session
#[macro_export]
macro_rules! session_span {
    ($($field:tt)*) => {
        tracing::info_span!("client_session", $($field)*)
    };
}

/// Create a span covering the broker bridge
#[macro_export]
macro_rules! broker_span {
    ($($field:tt)*) => {
        tracing::info_span!("broker_bridge", $($field)*)
    };
}

// Re-export macros for convenience
pub use {broker_span, session_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("CoMpAcT"), LogFormat::Compact);
    }

    #[test]
    fn test_log_format_parse_invalid_defaults_to_json() {
        assert_eq!(LogFormat::parse(""), LogFormat::Json);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("error", Level::ERROR),
            ("WARN", Level::WARN),
            ("Info", Level::INFO),
            ("debug", Level::DEBUG),
            ("TRACE", Level::TRACE),
            ("verbose", Level::INFO),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "Failed for input: {input}");
        }
    }

    #[test]
    fn test_noisy_targets_are_valid_directives() {
        for directive in NOISY_TARGETS {
            assert!(
                directive
                    .parse::<tracing_subscriber::filter::Directive>()
                    .is_ok(),
                "Invalid directive: {directive}"
            );
        }
    }

    #[test]
    fn test_span_macros_build_spans() {
        let session = session_span!(client_id = "node-1");
        let broker = broker_span!(url = "mqtt://localhost:1883");
        // No subscriber installed: spans are disabled but constructible
        drop(session);
        drop(broker);
    }
}
