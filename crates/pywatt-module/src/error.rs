//! Bootstrap errors and process exit codes.

use pywatt_channel::ChannelType;
use thiserror::Error;

/// Process exit codes of the module contract.
pub mod exit_code {
    /// Clean shutdown.
    pub const CLEAN: i32 = 0;
    /// Handshake failed: malformed or missing init blob.
    pub const HANDSHAKE_FAILED: i32 = 64;
    /// A required channel is unavailable.
    pub const CHANNEL_UNAVAILABLE: i32 = 65;
    /// The announcement could not be sent.
    pub const ANNOUNCE_FAILED: i32 = 66;
    /// Unhandled internal error.
    pub const INTERNAL: i32 = 70;
}

/// Errors that abort module bootstrap.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The init blob was missing or malformed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// An initial secret could not be fetched.
    #[error("missing required secret {name}: {reason}")]
    MissingSecret { name: String, reason: String },

    /// A channel marked `required` could not be brought up.
    #[error("required {channel} channel failed: {error}")]
    RequiredChannelFailed {
        channel: ChannelType,
        error: String,
    },

    /// No communication channel could be established.
    #[error("no channels available for communication")]
    NoChannelsAvailable,

    /// No TCP port could be obtained for the HTTP server.
    #[error("port negotiation failed: {0}")]
    PortNegotiation(String),

    /// The announcement could not be written to stdout.
    #[error("announcement failed: {0}")]
    AnnounceFailed(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BootstrapError {
    /// The exit code a module process should terminate with.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::HandshakeFailed(_) => exit_code::HANDSHAKE_FAILED,
            Self::RequiredChannelFailed { .. }
            | Self::NoChannelsAvailable
            | Self::PortNegotiation(_) => exit_code::CHANNEL_UNAVAILABLE,
            Self::AnnounceFailed(_) => exit_code::ANNOUNCE_FAILED,
            Self::MissingSecret { .. } | Self::Internal(_) => exit_code::INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(
            BootstrapError::HandshakeFailed("bad json".to_owned()).exit_code(),
            64
        );
        assert_eq!(
            BootstrapError::RequiredChannelFailed {
                channel: ChannelType::Tcp,
                error: "refused".to_owned()
            }
            .exit_code(),
            65
        );
        assert_eq!(BootstrapError::NoChannelsAvailable.exit_code(), 65);
        assert_eq!(
            BootstrapError::AnnounceFailed("stdout closed".to_owned()).exit_code(),
            66
        );
        assert_eq!(
            BootstrapError::Internal("boom".to_owned()).exit_code(),
            70
        );
    }
}
