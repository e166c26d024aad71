//! Protocol error type

use thiserror::Error;

/// Error raised while reading or writing the wire protocols.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket error (includes EOF on a closed connection)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame header carried an unknown frame type
    #[error("unknown frame type {0}")]
    UnknownFrameType(u32),

    /// Frame or body length outside the permitted range
    #[error("invalid length {0}")]
    InvalidLength(usize),

    /// Message frame payload could not be decoded
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// JSON body could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
