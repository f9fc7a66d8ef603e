//! Error types for the transport layer.

use std::io;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An I/O error occurred while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The length prefix announced a frame larger than we are willing to buffer.
    #[error("frame size {size} exceeds maximum allowed {max}")]
    FrameTooLarge {
        /// The announced frame size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// The peer closed the stream part way through a frame.
    #[error("stream closed after {read} of {expected} bytes")]
    Truncated {
        /// Bytes received before the stream closed.
        read: usize,
        /// Bytes the frame should have contained.
        expected: usize,
    },

    /// The frame body was not a valid message.
    #[error("invalid message: {0}")]
    InvalidMessage(#[source] serde_json::Error),

    /// The outgoing message could not be serialized.
    #[error("JSON serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// A well-formed message whose payload does not match its type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message of type '{0}' is missing its payload")]
    MissingPayload(String),

    #[error("message of type '{kind}' has an invalid payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}
