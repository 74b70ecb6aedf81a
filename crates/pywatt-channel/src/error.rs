//! Error types for channel operations.

use pywatt_proto::ProtocolError;
use thiserror::Error;

/// Errors surfaced by channel operations.
///
/// Read/write failures mark the channel `Disconnected` and let the
/// reconnect policy take over; only exhausting the policy makes a channel
/// `PermanentlyClosed`.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Connecting to the remote endpoint failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The peer reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// An operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The stream ended.
    #[error("end of stream")]
    Eof,

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    /// Frame- or codec-level failure.
    #[error(transparent)]
    Protocol(ProtocolError),

    /// The channel has no live connection.
    #[error("channel not connected")]
    NotConnected,

    /// The channel exhausted its reconnect policy and will never recover.
    #[error("channel permanently closed")]
    PermanentlyClosed,
}

impl ChannelError {
    /// Whether the underlying connection is gone and a reconnect may help.
    #[must_use]
    pub fn is_disconnection(&self) -> bool {
        matches!(
            self,
            Self::ConnectionReset | Self::Eof | Self::Io(_) | Self::NotConnected
        )
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Self::ConnectionReset
            }
            ErrorKind::UnexpectedEof => Self::Eof,
            ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(e),
        }
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => io.into(),
            other => Self::Protocol(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn io_kind_classification() {
        let reset: ChannelError = IoError::new(ErrorKind::ConnectionReset, "rst").into();
        assert!(matches!(reset, ChannelError::ConnectionReset));

        let eof: ChannelError = IoError::new(ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(eof, ChannelError::Eof));

        let timeout: ChannelError = IoError::new(ErrorKind::TimedOut, "slow").into();
        assert!(matches!(timeout, ChannelError::Timeout));

        let other: ChannelError = IoError::new(ErrorKind::PermissionDenied, "no").into();
        assert!(matches!(other, ChannelError::Io(_)));
    }

    #[test]
    fn protocol_io_errors_reclassify() {
        let inner = ProtocolError::Io(IoError::new(ErrorKind::BrokenPipe, "pipe"));
        let err: ChannelError = inner.into();
        assert!(matches!(err, ChannelError::ConnectionReset));
        assert!(err.is_disconnection());
    }

    #[test]
    fn frame_errors_stay_protocol() {
        let err: ChannelError = ProtocolError::TruncatedFrame.into();
        assert!(matches!(err, ChannelError::Protocol(_)));
        assert!(!err.is_disconnection());
    }
}
