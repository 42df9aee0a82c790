use std::error::Error;
use std::fmt;

use crate::core::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    // Registry errors
    DuplicateConnection(ConnectionId),
    UnknownConnection(ConnectionId),

    // Dispatch errors
    NoSuchUser(String),
    DeliveryFailure { connection_id: ConnectionId, reason: String },
    DeliveryTimeout(ConnectionId),

    // Transport errors
    ConnectionClosed,
    MessageParseError(String),

    // Configuration errors
    ConfigError(String),
}

impl HubError {
    /// Short machine-readable code, used in error frames sent back to clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateConnection(_) => "duplicate_connection",
            Self::UnknownConnection(_) => "unknown_connection",
            Self::NoSuchUser(_) => "no_such_user",
            Self::DeliveryFailure { .. } => "delivery_failure",
            Self::DeliveryTimeout(_) => "delivery_timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::MessageParseError(_) => "invalid_message",
            Self::ConfigError(_) => "config_error",
        }
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateConnection(id) => write!(f, "Connection already registered: {}", id),
            Self::UnknownConnection(id) => write!(f, "Unknown connection: {}", id),
            Self::NoSuchUser(user) => write!(f, "No live connection bound to user: {}", user),
            Self::DeliveryFailure { connection_id, reason } => {
                write!(f, "Delivery to {} failed: {}", connection_id, reason)
            }
            Self::DeliveryTimeout(id) => write!(f, "Delivery to {} timed out", id),
            Self::ConnectionClosed => write!(f, "Connection closed unexpectedly"),
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for HubError {}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::MessageParseError(err.to_string())
    }
}

// Generic result type for the hub
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_display() {
        let err = HubError::UnknownConnection(ConnectionId::from("c1"));
        assert_eq!(err.code(), "unknown_connection");
        assert_eq!(err.to_string(), "Unknown connection: c1");

        let err = HubError::NoSuchUser("bob".to_string());
        assert!(err.to_string().contains("bob"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: HubError = parse.unwrap_err().into();
        assert_eq!(err.code(), "invalid_message");
    }
}
