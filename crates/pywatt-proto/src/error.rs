//! Error types for the wire protocol.

use thiserror::Error;

/// Errors raised while encoding, decoding, or framing messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unsupported wire protocol version.
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u16),

    /// Unknown encoding format discriminant.
    #[error("unknown encoding format: {0}")]
    UnknownFormat(u8),

    /// Frame exceeds the maximum permitted size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Stream ended mid-frame.
    #[error("truncated frame")]
    TruncatedFrame,

    /// Frame header or length prefix is malformed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Payload bytes could not be serialised or deserialised.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
