//! Observability for the gateway: structured logging and forwarding metrics

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{broker_span, session_span};
