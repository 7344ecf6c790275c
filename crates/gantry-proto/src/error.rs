//! Error types for the protocol.

use thiserror::Error;

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Invalid message payload.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Message too large.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Invalid frame header.
    #[error("invalid frame header: {0}")]
    InvalidFrameHeader(String),

    /// Unknown message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u16),

    /// A frame arrived with a different message type than the channel carries.
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType { expected: u16, actual: u16 },

    /// The peer sent a message that is not valid in this direction.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    /// The schema descriptor handed to a worker does not match this build.
    #[error("schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch { expected: String, actual: String },

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Deserialisation error.
    #[error("deserialisation error: {0}")]
    Deserialisation(String),

    /// Reading or writing the bridge socket failed, including a peer that
    /// hung up mid-frame.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
