//! The channel capability contract and its descriptor types.

use async_trait::async_trait;
use pywatt_proto::EncodedMessage;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Tag identifying a kind of channel, used for explicit selection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    /// Line-delimited JSON on stdin/stdout.
    Stdio,
    /// Framed TCP stream.
    Tcp,
    /// Framed Unix domain socket stream.
    Ipc,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Tcp => write!(f, "tcp"),
            Self::Ipc => write!(f, "ipc"),
        }
    }
}

/// Connection state of a channel.
///
/// `PermanentlyClosed` is terminal: a channel never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No live connection; a reconnect may be attempted.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Ready for traffic.
    Connected,
    /// The last connection attempt failed.
    Failed,
    /// The reconnect policy is exhausted; the channel will never recover.
    PermanentlyClosed,
}

/// What a channel can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCapabilities {
    /// Carries inter-module messages.
    pub module_messaging: bool,
    /// Carries tunnelled HTTP traffic.
    pub http_proxy: bool,
    /// Supports streamed payloads.
    pub streaming: bool,
    /// Largest message the channel accepts, in bytes.
    pub max_message_size: usize,
}

impl ChannelCapabilities {
    /// Capabilities of a standard TCP channel.
    #[must_use]
    pub const fn tcp_standard() -> Self {
        Self {
            module_messaging: true,
            http_proxy: true,
            streaming: true,
            max_message_size: pywatt_proto::MAX_FRAME_SIZE,
        }
    }

    /// Capabilities of a standard Unix-socket channel.
    #[must_use]
    pub const fn ipc_standard() -> Self {
        Self {
            module_messaging: true,
            http_proxy: true,
            streaming: true,
            max_message_size: pywatt_proto::MAX_FRAME_SIZE,
        }
    }

    /// Capabilities of the stdio control plane.
    ///
    /// Stdio carries everything but is line-oriented, so streaming is out
    /// and oversized payloads belong on a socket channel.
    #[must_use]
    pub const fn stdio_standard() -> Self {
        Self {
            module_messaging: true,
            http_proxy: true,
            streaming: false,
            max_message_size: 1024 * 1024,
        }
    }
}

/// Caller preferences for channel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPreferences {
    /// Bring up the TCP channel when the orchestrator offers one.
    pub use_tcp: bool,
    /// Bring up the IPC channel when the orchestrator offers one.
    pub use_ipc: bool,
    /// Prefer IPC for peers co-located with this module.
    pub prefer_ipc_for_local: bool,
    /// Prefer TCP for remote peers.
    pub prefer_tcp_for_remote: bool,
    /// Try the other channel when the selected one is unavailable.
    pub enable_fallback: bool,
}

impl Default for ChannelPreferences {
    fn default() -> Self {
        Self {
            use_tcp: true,
            use_ipc: true,
            prefer_ipc_for_local: true,
            prefer_tcp_for_remote: true,
            enable_fallback: true,
        }
    }
}

impl ChannelPreferences {
    /// TCP only; IPC disabled.
    #[must_use]
    pub fn tcp_only() -> Self {
        Self {
            use_tcp: true,
            use_ipc: false,
            prefer_ipc_for_local: false,
            prefer_tcp_for_remote: true,
            enable_fallback: false,
        }
    }

    /// IPC only; TCP disabled.
    #[must_use]
    pub fn ipc_only() -> Self {
        Self {
            use_tcp: false,
            use_ipc: true,
            prefer_ipc_for_local: true,
            prefer_tcp_for_remote: false,
            enable_fallback: false,
        }
    }

    /// Both channels, IPC first.
    #[must_use]
    pub fn prefer_ipc() -> Self {
        Self {
            prefer_tcp_for_remote: false,
            ..Self::default()
        }
    }

    /// Both channels, TCP first.
    #[must_use]
    pub fn prefer_tcp() -> Self {
        Self {
            prefer_ipc_for_local: false,
            ..Self::default()
        }
    }
}

/// Capability contract every channel implements.
///
/// `send` and `receive` are safe to call from different tasks; the channel
/// serialises writers internally and the reader side is owned by one
/// processing loop at a time.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Establishes the connection, applying the channel's reconnect policy.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Sends one encoded message as a single frame.
    async fn send(&self, message: EncodedMessage) -> Result<(), ChannelError>;

    /// Receives the next frame.
    async fn receive(&self) -> Result<EncodedMessage, ChannelError>;

    /// Returns the current connection state.
    async fn state(&self) -> ChannelState;

    /// Closes the connection without marking the channel permanently closed.
    async fn disconnect(&self) -> Result<(), ChannelError>;

    /// The tag of this channel.
    fn channel_type(&self) -> ChannelType;

    /// What this channel can carry.
    fn capabilities(&self) -> ChannelCapabilities;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_presets() {
        let tcp = ChannelPreferences::tcp_only();
        assert!(tcp.use_tcp && !tcp.use_ipc);

        let ipc = ChannelPreferences::ipc_only();
        assert!(ipc.use_ipc && !ipc.use_tcp);

        let defaults = ChannelPreferences::default();
        assert!(defaults.use_tcp && defaults.use_ipc && defaults.enable_fallback);
    }

    #[test]
    fn channel_type_display() {
        assert_eq!(ChannelType::Stdio.to_string(), "stdio");
        assert_eq!(ChannelType::Tcp.to_string(), "tcp");
        assert_eq!(ChannelType::Ipc.to_string(), "ipc");
    }

    #[test]
    fn socket_capabilities_match_frame_limit() {
        assert_eq!(
            ChannelCapabilities::tcp_standard().max_message_size,
            pywatt_proto::MAX_FRAME_SIZE
        );
        assert!(ChannelCapabilities::stdio_standard().max_message_size < pywatt_proto::MAX_FRAME_SIZE);
    }
}
