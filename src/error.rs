//! Error types for the replicated store.

use std::io;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// The stream ended before a complete frame arrived.
    #[error("connection closed mid-frame")]
    UnexpectedEof,

    /// A frame carried an unknown message type code.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u16),

    /// The peer replied with an unexpected message type.
    #[error("unexpected reply type: {0:?}")]
    UnexpectedReply(crate::wire::MessageType),

    /// A frame declared an oversized payload.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// The payload was not valid for its message type.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
