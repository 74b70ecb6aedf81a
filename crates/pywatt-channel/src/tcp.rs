//! TCP channel implementation.
//!
//! Carries framed [`EncodedMessage`]s to the orchestrator over TCP, with
//! optional TLS and first-frame token authentication. Reconnection follows
//! the configured [`ReconnectPolicy`]; exhausting it permanently closes
//! the channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pywatt_proto::{EncodedMessage, EncodingFormat, Message};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::metrics::ChannelMetrics;
use crate::reconnect::ReconnectPolicy;
use crate::stream::{BoxedReader, BoxedWriter, FramedConnection};
use crate::traits::{ChannelCapabilities, ChannelState, ChannelType, MessageChannel};

/// TLS client settings for a [`TcpChannel`].
///
/// Mutual authentication is a property of the supplied `ClientConfig`
/// (client certificate resolver plus trust roots); the channel itself only
/// drives the handshake.
#[derive(Clone)]
pub struct TlsSettings {
    /// Complete rustls client configuration.
    pub config: Arc<tokio_rustls::rustls::ClientConfig>,
    /// Server name presented for SNI and certificate validation.
    pub server_name: String,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Configuration for a [`TcpChannel`].
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Orchestrator address.
    pub address: SocketAddr,
    /// Deadline for a single connect attempt.
    pub connect_timeout: Duration,
    /// Reconnect behaviour after a lost connection.
    pub reconnect: ReconnectPolicy,
    /// TLS settings; plaintext when absent.
    pub tls: Option<TlsSettings>,
    /// Token sent as the first frame after connecting, when set.
    pub auth_token: Option<String>,
}

impl TcpConfig {
    /// Creates a plaintext configuration with default timeout and policy.
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            tls: None,
            auth_token: None,
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Enables TLS.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Sets the first-frame auth token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// First frame sent on token-authenticated channels.
#[derive(Serialize)]
struct TokenGreeting<'a> {
    auth_token: &'a str,
}

/// A TCP-based message channel.
pub struct TcpChannel {
    config: TcpConfig,
    conn: FramedConnection,
    metrics: ChannelMetrics,
}

impl TcpChannel {
    /// Creates a disconnected channel with the given configuration.
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            conn: FramedConnection::new(),
            metrics: ChannelMetrics::new(),
        }
    }

    /// Returns the channel configuration.
    #[must_use]
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Returns the channel's traffic metrics.
    #[must_use]
    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }

    async fn connect_once(&self) -> Result<(), ChannelError> {
        let stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.address),
        )
        .await
        .map_err(|_| ChannelError::Timeout)?
        .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let (reader, writer): (BoxedReader, BoxedWriter) = match &self.config.tls {
            Some(tls) => {
                let connector = TlsConnector::from(tls.config.clone());
                let server_name = ServerName::try_from(tls.server_name.clone())
                    .map_err(|e| ChannelError::Tls(format!("invalid server name: {e}")))?;
                let stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ChannelError::Tls(e.to_string()))?;
                let (r, w) = tokio::io::split(stream);
                (Box::new(r), Box::new(w))
            }
            None => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };

        self.conn.install(reader, writer).await;

        if let Some(token) = &self.config.auth_token {
            let greeting = Message::new(TokenGreeting { auth_token: token })
                .encode(EncodingFormat::Json)?;
            self.conn.send_frame(&greeting, &self.metrics).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl MessageChannel for TcpChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        match self.conn.state().await {
            ChannelState::Connected => return Ok(()),
            ChannelState::PermanentlyClosed => return Err(ChannelError::PermanentlyClosed),
            _ => {}
        }

        let mut attempt: u32 = 1;
        loop {
            self.conn.set_state(ChannelState::Connecting).await;
            match self.connect_once().await {
                Ok(()) => {
                    info!(address = %self.config.address, attempt, "TCP channel connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(address = %self.config.address, attempt, error = %e, "TCP connect attempt failed");
                    attempt += 1;
                    match self.config.reconnect.delay_before(attempt) {
                        Some(delay) => {
                            self.conn.set_state(ChannelState::Failed).await;
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            if matches!(self.config.reconnect, ReconnectPolicy::None) {
                                self.conn.set_state(ChannelState::Failed).await;
                            } else {
                                self.conn.close_permanently().await;
                                warn!(address = %self.config.address, "reconnect policy exhausted, TCP channel permanently closed");
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn send(&self, message: EncodedMessage) -> Result<(), ChannelError> {
        self.conn.send_frame(&message, &self.metrics).await
    }

    async fn receive(&self) -> Result<EncodedMessage, ChannelError> {
        self.conn.receive_frame(&self.metrics).await
    }

    async fn state(&self) -> ChannelState {
        self.conn.state().await
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        debug!(address = %self.config.address, "TCP channel disconnecting");
        self.conn.clear().await;
        Ok(())
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Tcp
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities::tcp_standard()
    }
}
