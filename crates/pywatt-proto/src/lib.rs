//! Wire protocol types for PyWatt module/orchestrator communication.
//!
//! This crate defines everything that crosses a process boundary in the
//! PyWatt fabric:
//!
//! - The typed envelope ([`Message`], [`MessageMetadata`]) and its encoded
//!   form ([`EncodedMessage`]) in JSON or compact binary (CBOR)
//! - Length-prefixed framing for stream transports ([`codec`])
//! - The control-plane message sets exchanged over stdio and socket
//!   channels ([`ModuleToOrchestrator`], [`OrchestratorToModule`])
//!
//! # Wire Format
//!
//! Stream transports carry frames of the form:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │               Length (4 bytes, big-endian)               │
//! ├──────────────────────────────────────────────────────────┤
//! │  Header: version (2) · format (1) · id (16) · flags (1)  │
//! │          [correlation id (16)] · created-at ms (8)       │
//! ├──────────────────────────────────────────────────────────┤
//! │                      Payload bytes                       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A zero-length frame is illegal; frames above [`MAX_FRAME_SIZE`] are
//! rejected before allocation. JSON payloads must be decodable by every
//! peer regardless of local format preference.

pub mod codec;
mod control;
mod envelope;
mod error;

pub use codec::{read_frame, write_frame, MAX_FRAME_SIZE, WIRE_VERSION};
pub use control::{
    AnnounceBlob, EndpointAnnounce, GetSecretRequest, InitBlob, IpcChannelConfig, IpcHttpRequest,
    IpcHttpResponse, ListenAddress, ModuleToOrchestrator, OrchestratorToModule, PortRequest,
    PortResponse, RotatedNotification, RotationAck, RotationStatus, SecretDelivery, SecurityLevel,
    TcpChannelConfig,
};
pub use envelope::{
    EncodedMessage, EncodingFormat, Message, MessageMetadata, BINARY_PREFERENCE_THRESHOLD,
};
pub use error::ProtocolError;
