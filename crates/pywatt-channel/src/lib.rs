//! Socket channels and request correlation for PyWatt modules.
//!
//! A channel is a bidirectional framed byte stream carrying
//! [`EncodedMessage`](pywatt_proto::EncodedMessage)s between a module and
//! its orchestrator. This crate provides:
//!
//! - The [`MessageChannel`] capability contract with tagged
//!   [`ChannelType`]s for selection
//! - [`TcpChannel`] (plaintext, token-authenticated, or TLS) and
//!   [`IpcChannel`] (Unix domain socket)
//! - [`ReconnectPolicy`] with fixed or jittered exponential backoff
//! - [`RequestCorrelator`], matching responses to in-flight requests by
//!   request id with per-slot deadlines
//!
//! Channel state is owned by the channel; callers interact through the
//! thread-safe `send`/`receive` wrappers only. Once a channel reaches
//! [`ChannelState::PermanentlyClosed`] it never reconnects.

mod correlator;
mod error;
mod metrics;
mod reconnect;
mod stream;
mod tcp;
mod traits;
mod unix;

pub use correlator::{CorrelationError, RequestCorrelator, ResponseSlot};
pub use error::ChannelError;
pub use metrics::{ChannelMetrics, ChannelMetricsSnapshot};
pub use reconnect::ReconnectPolicy;
pub use tcp::{TcpChannel, TcpConfig, TlsSettings};
pub use traits::{
    ChannelCapabilities, ChannelPreferences, ChannelState, ChannelType, MessageChannel,
};
pub use unix::{IpcChannel, IpcConfig};
