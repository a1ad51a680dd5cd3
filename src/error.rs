//! Error types for natlink.
//!
//! None of these cross the boolean entry points of the channel, negotiator or
//! acceptor: ordinary network failures are logged and reported as `false`.
//! They surface only where a caller can act on them.

use thiserror::Error;

/// Reasons a received datagram could not be decoded into a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the fixed header.
    #[error("datagram too short for frame header: {0} bytes")]
    Truncated(usize),

    /// Declared payload length exceeds the configured maximum.
    #[error("declared payload length {declared} exceeds maximum {max}")]
    Oversized {
        /// Length announced in the header.
        declared: usize,
        /// Maximum accepted payload.
        max: usize,
    },

    /// Declared payload length runs past the end of the datagram.
    #[error("declared payload length {declared} but only {available} bytes follow the header")]
    LengthMismatch {
        /// Length announced in the header.
        declared: usize,
        /// Bytes actually present after the header.
        available: usize,
    },
}

/// Errors from the session message codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream carried something that is not a valid message envelope.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// The stream does not start with a JSON object.
    #[error("expected a message object, found byte {0:#04x}")]
    UnexpectedByte(u8),

    /// Envelope carried a message code this side does not understand.
    #[error("unknown message code: {0:#x}")]
    UnknownCode(u8),

    /// A single message grew past the configured limit without completing.
    #[error("message exceeds {max} bytes")]
    MessageTooLarge {
        /// Configured limit.
        max: usize,
    },
}

/// Errors returned to callers of [`Session::send`](crate::tcp::Session::send).
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is not in the `Connected` state.
    #[error("session is not connected")]
    NotConnected,

    /// The payload could not be turned into a message.
    #[error("payload is not serializable: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse configuration.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Configuration parsed but holds an unusable value.
    #[error("invalid config: {0}")]
    Invalid(String),
}
