//! Error types and handling for the bridge
//!
//! One error enum covers configuration, the radio link, the system bus and
//! persistence. Link errors carry their own severity so the reconnect policy
//! can tell a lost peer from a transient read failure.

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// How a failed radio round should be treated by the reconnect policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Link lost or peer unreachable; reconnect right away
    Hard,
    /// Transient read or decode error; retry on the existing connection
    Soft,
}

/// Main error type for the bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transient radio link errors (read failures, GATT errors)
    #[error("Link error: {message}")]
    Link { message: String },

    /// Radio peer unreachable or connection dropped
    #[error("Link lost: {message}")]
    LinkLost { message: String },

    /// Malformed telemetry block
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// D-Bus communication errors
    #[error("D-Bus error: {message}")]
    DBus { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl BridgeError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new transient link error
    pub fn link<S: Into<String>>(message: S) -> Self {
        Self::Link {
            message: message.into(),
        }
    }

    /// Create a new link-lost error
    pub fn link_lost<S: Into<String>>(message: S) -> Self {
        Self::LinkLost {
            message: message.into(),
        }
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a new D-Bus error
    pub fn dbus<S: Into<String>>(message: S) -> Self {
        Self::DBus {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Severity of this error when it ends a radio round.
    ///
    /// `LinkLost` is always hard. Other link errors are hard when their message
    /// carries one of the BlueZ markers for a dropped connection.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::LinkLost { .. } => FailureKind::Hard,
            Self::Link { message } | Self::DBus { message } if is_disconnect_message(message) => {
                FailureKind::Hard
            }
            _ => FailureKind::Soft,
        }
    }
}

/// Whether an error message indicates the peer dropped or was never connected
pub fn is_disconnect_message(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    [
        "not connected",
        "disconnected",
        "helper not started",
        "does not exist",
        "no such device",
        "host is down",
        "unknownobject",
    ]
    .iter()
    .any(|marker| m.contains(marker))
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for BridgeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<zbus::Error> for BridgeError {
    fn from(err: zbus::Error) -> Self {
        Self::dbus(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BridgeError::config("test config error");
        assert!(matches!(err, BridgeError::Config { .. }));

        let err = BridgeError::link("read failed");
        assert!(matches!(err, BridgeError::Link { .. }));

        let err = BridgeError::validation("field", "test validation error");
        assert!(matches!(err, BridgeError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = BridgeError::config("test error");
        assert_eq!(format!("{}", err), "Configuration error: test error");

        let err = BridgeError::validation("generator.start_w", "must exceed stop_w");
        assert_eq!(
            format!("{}", err),
            "Validation error: generator.start_w - must exceed stop_w"
        );
    }

    #[test]
    fn failure_kind_from_variant_and_message() {
        assert_eq!(
            BridgeError::link_lost("peer gone").failure_kind(),
            FailureKind::Hard
        );
        assert_eq!(
            BridgeError::link("org.bluez.Error.Failed: Not connected").failure_kind(),
            FailureKind::Hard
        );
        assert_eq!(
            BridgeError::link("org.bluez.Error.InProgress").failure_kind(),
            FailureKind::Soft
        );
        assert_eq!(
            BridgeError::decode("odd length").failure_kind(),
            FailureKind::Soft
        );
        assert_eq!(
            BridgeError::timeout("read A03").failure_kind(),
            FailureKind::Soft
        );
    }
}
