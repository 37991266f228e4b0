//! Top-level error type for the gateway runtime
//!
//! Each layer has its own error enum; this one wraps them for `main` and the
//! gateway run loop. The forwarder itself never fails.

use crate::config::ConfigError;
use crate::transport::BrokerError;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl GatewayError {
    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let error: GatewayError = ConfigError::InvalidConfig("bad".to_string()).into();
        assert_eq!(
            error.to_string(),
            "Configuration error: Invalid configuration: bad"
        );
    }

    #[test]
    fn test_internal_error_helper() {
        let error = GatewayError::internal_error("session task panicked");
        assert!(matches!(error, GatewayError::InternalError { .. }));
        assert_eq!(error.to_string(), "Internal error: session task panicked");
    }
}
