//! Module-side runtime SDK for the PyWatt orchestrator.
//!
//! A module is a child process launched by an orchestrator; this crate
//! mediates everything between the two: the stdin/stdout handshake,
//! secrets with rotation-aware caching and log redaction, socket
//! channels, HTTP tunnelled over IPC, typed messaging with peer modules,
//! and TCP port negotiation.
//!
//! # Example
//!
//! ```rust,ignore
//! use pywatt_module::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = BootstrapOptions {
//!         secret_keys: vec!["DATABASE_URL".to_owned()],
//!         endpoints: vec![EndpointAnnounce {
//!             path: "/health".to_owned(),
//!             methods: vec!["GET".to_owned()],
//!             auth: None,
//!         }],
//!         ..BootstrapOptions::default()
//!     };
//!
//!     let (state, join) = match bootstrap_module(options, |init, secrets| {
//!         MyState::new(init, secrets)
//!     })
//!     .await
//!     {
//!         Ok(ready) => ready,
//!         Err(e) => std::process::exit(e.exit_code()),
//!     };
//!
//!     // ... serve state.take_http_requests(), register handlers ...
//!     let _ = join.await;
//! }
//! ```
//!
//! Stdout carries only protocol lines; all logging goes to stderr and is
//! scrubbed through the redaction registry.

mod bootstrap;
mod config;
mod error;
mod http;
mod logging;
mod messaging;
mod port;
mod router;
mod state;
mod stdio;

pub use bootstrap::{bootstrap_module, bootstrap_with_io, BootstrapOptions};
pub use config::ModuleConfig;
pub use error::{exit_code, BootstrapError};
pub use http::{
    spawn_http_service, HttpMetricsSnapshot, HttpTunnel, HttpTunnelError, InboundHttpRequest,
};
pub use logging::init_logging;
pub use messaging::{HandlerRegistry, Messaging, MessagingError, ModuleMessageHandler};
pub use port::{
    NegotiatedPort, PortError, PortNegotiator, PortNegotiatorConfig, FALLBACK_PORT_MAX,
    FALLBACK_PORT_MIN,
};
pub use router::{ChannelHealth, ChannelRouter, ReplyPath, RouterError};
pub use state::AppState;
pub use stdio::{read_init, ControlPlane, ControlPlaneError};

/// The common imports for writing a module.
pub mod prelude {
    pub use crate::{
        bootstrap_module, spawn_http_service, AppState, BootstrapError, BootstrapOptions,
        MessagingError,
    };
    pub use pywatt_channel::{ChannelPreferences, ChannelType};
    pub use pywatt_proto::{
        AnnounceBlob, EndpointAnnounce, InitBlob, IpcHttpRequest, IpcHttpResponse,
    };
    pub use pywatt_secrets::{FetchMode, SecretClient, SecretValue};
}
