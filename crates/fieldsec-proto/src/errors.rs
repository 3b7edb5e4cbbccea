//! Protocol error types.
//!
//! Every error here means a frame is structurally invalid. Receivers drop
//! such frames; they never reach the authenticator.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Structural frame and payload errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is shorter than the fixed header
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum size required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Magic number does not identify a fieldsec frame
    #[error("invalid magic number")]
    InvalidMagic,

    /// Header version is not supported
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds the datagram payload limit
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Claimed or actual payload size
        size: usize,
        /// Maximum allowed payload size
        max: usize,
    },

    /// Buffer ends before the payload the header announces
    #[error("frame truncated: header claims {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Payload size from the header
        expected: usize,
        /// Payload bytes available
        actual: usize,
    },

    /// Service type is not known to this implementation
    #[error("unknown service type: {0:#06x}")]
    UnknownService(u16),

    /// Payload serialization failed
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// Payload deserialization failed
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),

    /// A decoded field holds a value outside its domain
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },
}
