//! Error types for payload parsing and encoding in calima-types.

use thiserror::Error;

/// Errors that can occur when decoding or encoding Calima payloads.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in calima-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The payload is shorter than the characteristic's fixed layout.
    #[error("Insufficient bytes: payload requires {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Number of bytes the layout requires.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// The payload is longer than the characteristic's fixed layout.
    #[error("Unexpected length: payload requires {expected} bytes, got {actual}")]
    UnexpectedLength {
        /// Number of bytes the layout requires.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// The payload is not valid UTF-8 text.
    #[error("Invalid text payload: {0}")]
    InvalidText(String),

    /// A value is outside the range the device accepts.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using calima-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
