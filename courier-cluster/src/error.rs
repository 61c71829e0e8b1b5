//! Error types for the inter-service runtime

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::CircuitState;

/// Classified transport failure, the unit the retry policy keys on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorCode {
    ConnectionReset,
    NameNotFound,
    TimedOut,
    ConnectionRefused,
    Other,
}

impl TransportErrorCode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionReset => "connection_reset",
            Self::NameNotFound => "name_not_found",
            Self::TimedOut => "timed_out",
            Self::ConnectionRefused => "connection_refused",
            Self::Other => "transport",
        }
    }
}

impl std::str::FromStr for TransportErrorCode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "connection_reset" => Ok(Self::ConnectionReset),
            "name_not_found" => Ok(Self::NameNotFound),
            "timed_out" => Ok(Self::TimedOut),
            "connection_refused" => Ok(Self::ConnectionRefused),
            "transport" => Ok(Self::Other),
            other => Err(format!("unknown transport error code: {other}")),
        }
    }
}

impl std::fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already registered as {0}")]
    AlreadyRegistered(String),

    #[error("Storage error: {0}")]
    Storage(#[from] courier_core::Error),

    #[error("Transport error ({code}): {message}")]
    Transport {
        code: TransportErrorCode,
        message: String,
    },

    #[error("HTTP {status} from {url}")]
    Status {
        status: u16,
        url: String,
        body: serde_json::Value,
    },

    #[error("Circuit breaker for {target} is {state}")]
    CircuitOpen { target: String, state: CircuitState },

    #[error("No available instance for {0}")]
    NoInstanceAvailable(String),
}

impl Error {
    #[must_use]
    pub fn transport(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::AlreadyRegistered(_) => "already_registered",
            Self::Storage(_) => "storage",
            Self::Transport { code, .. } => code.as_str(),
            Self::Status { .. } => "http_status",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoInstanceAvailable(_) => "no_instance_available",
        }
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                code: TransportErrorCode::TimedOut,
                ..
            }
        )
    }

    /// Failures that say the instance itself is unreachable
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                code: TransportErrorCode::ConnectionRefused
                    | TransportErrorCode::ConnectionReset
                    | TransportErrorCode::NameNotFound,
                ..
            }
        )
    }

    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal error of one caller-facing RPC
///
/// Carries a stable `code`, the `retryable` classification of the final
/// failure, and the ids needed to find the request in downstream logs.
#[derive(Debug, Clone, Serialize, Error)]
#[error("{target} request failed [{code}]: {message}")]
pub struct ServiceError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub status: Option<u16>,
    pub body: Option<serde_json::Value>,
    /// Set only when the breaker rejected the call
    pub breaker_state: Option<CircuitState>,
    pub target: String,
    pub correlation_id: String,
    pub request_id: String,
    pub attempts: u32,
}

impl ServiceError {
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        self.breaker_state.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            Error::transport(TransportErrorCode::ConnectionRefused, "refused").code(),
            "connection_refused"
        );
        assert_eq!(
            Error::CircuitOpen {
                target: "orders".to_string(),
                state: CircuitState::Open
            }
            .code(),
            "circuit_open"
        );
        assert_eq!(Error::NoInstanceAvailable("orders".to_string()).code(), "no_instance_available");
    }

    #[test]
    fn test_transport_codes_parse_from_config_names() {
        for name in courier_core::config::TRANSPORT_ERROR_CODES {
            let code: TransportErrorCode = name.parse().unwrap();
            assert_eq!(code.as_str(), name);
        }
        assert!("eof".parse::<TransportErrorCode>().is_err());
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(Error::transport(TransportErrorCode::NameNotFound, "dns").is_connection_error());
        assert!(!Error::transport(TransportErrorCode::TimedOut, "slow").is_connection_error());
        assert!(Error::transport(TransportErrorCode::TimedOut, "slow").is_timeout());
    }

    #[test]
    fn test_circuit_open_message_carries_state() {
        let err = Error::CircuitOpen {
            target: "orders".to_string(),
            state: CircuitState::HalfOpen,
        };
        assert_eq!(err.to_string(), "Circuit breaker for orders is half-open");
        assert!(err.is_circuit_open());
    }
}
