//! Error types for calima-core.
//!
//! This module defines all error types that can occur when talking to a
//! Calima fan over Bluetooth Low Energy, from connection management through
//! individual protocol operations.
//!
//! # Retry classification
//!
//! | Error Type | Strategy |
//! |------------|----------|
//! | [`Error::Timeout`] | Retry; the radio link is often congested |
//! | [`Error::Bluetooth`] | Retry, then reconnect |
//! | [`Error::NotConnected`] | Reconnect |
//! | [`Error::TransportUnavailable`] | Rediscover with backoff |
//! | [`Error::ConnectionFailed`] | Retry with backoff (depends on reason) |
//! | [`Error::Protocol`] | Same as the wrapped error |
//! | [`Error::Validation`] | Do not retry, fix the input |
//! | [`Error::AuthenticationFailed`] | Do not retry, fix the PIN |
//! | [`Error::Cancelled`] | Do not retry, shutdown in progress |
//!
//! [`Error::is_retryable`] implements this table and is what the
//! [`ConnectionManager`](crate::ConnectionManager) consults between attempts.

use std::time::Duration;

use thiserror::Error;

use calima_types::ParseError;

/// Errors that can occur when communicating with Calima fans.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller input the device would reject.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// PIN missing, malformed or rejected by the fan.
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed {
        /// Why authentication failed.
        reason: String,
    },

    /// Discovery failed or the device is not advertising.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Connection failed with specific reason.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// A protocol operation failed; `source` holds the transport or decode error.
    #[error("Protocol error during {operation}: {source}")]
    Protocol {
        /// The operation that failed (e.g. `get_status`).
        operation: String,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },

    /// Payload could not be decoded.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Operation attempted while not connected to device.
    #[error("Not connected to device")]
    NotConnected,

    /// Transport-level failure not covered by a more specific variant.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Another connection attempt for this device is already running.
    #[error("Connection attempt already in progress")]
    ConnectInProgress,

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Pairing session step called out of order or with unknown data.
    #[error("Pairing error: {0}")]
    Pairing(String),

    /// The host rejected a capability update or store write.
    #[error("Host error: {0}")]
    Host(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// Device is out of range.
    OutOfRange,
    /// Device rejected the connection.
    Rejected,
    /// Connection attempt timed out.
    Timeout,
    /// The link reported itself dead right after connecting.
    NotLive,
    /// Generic BLE error.
    BleError(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::OutOfRange => write!(f, "device out of range"),
            Self::Rejected => write!(f, "connection rejected by device"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::NotLive => write!(f, "link not live after connect"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl ConnectionFailureReason {
    /// Classify an error btleplug raised while connecting.
    pub fn from_ble(err: &btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => Self::OutOfRange,
            btleplug::Error::TimedOut(_) => Self::Timeout,
            btleplug::Error::PermissionDenied => Self::Rejected,
            btleplug::Error::NotSupported(_) => Self::AdapterUnavailable,
            other => Self::BleError(other.to_string()),
        }
    }
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Wrap an error raised inside a protocol operation.
    pub fn protocol(operation: impl Into<String>, source: Error) -> Self {
        Self::Protocol {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create an authentication failure.
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// Convert a codec range check failure into a validation error.
    pub fn validation(err: ParseError) -> Self {
        match err {
            ParseError::InvalidValue(msg) => Self::Validation(msg),
            other => Self::Validation(other.to_string()),
        }
    }

    /// Whether retrying the operation (possibly after reconnecting) can help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. }
            | Error::Bluetooth(_)
            | Error::NotConnected
            | Error::Transport(_)
            | Error::TransportUnavailable(_) => true,
            Error::ConnectionFailed { reason, .. } => matches!(
                reason,
                ConnectionFailureReason::OutOfRange
                    | ConnectionFailureReason::Timeout
                    | ConnectionFailureReason::NotLive
                    | ConnectionFailureReason::BleError(_)
                    | ConnectionFailureReason::Other(_)
            ),
            Error::Protocol { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias using calima-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
