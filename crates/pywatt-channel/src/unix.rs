//! Unix domain socket channel implementation.
//!
//! The IPC twin of [`TcpChannel`](crate::TcpChannel): same framing, same
//! state machine, connecting to the orchestrator's socket path instead of
//! a network address. Local sockets need neither TLS nor token greetings.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use pywatt_proto::EncodedMessage;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::metrics::ChannelMetrics;
use crate::reconnect::ReconnectPolicy;
use crate::stream::{BoxedReader, BoxedWriter, FramedConnection};
use crate::traits::{ChannelCapabilities, ChannelState, ChannelType, MessageChannel};

/// Configuration for an [`IpcChannel`].
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Path to the orchestrator's Unix domain socket.
    pub socket_path: PathBuf,
    /// Deadline for a single connect attempt.
    pub connect_timeout: Duration,
    /// Reconnect behaviour after a lost connection.
    pub reconnect: ReconnectPolicy,
}

impl IpcConfig {
    /// Creates a configuration with default timeout and policy.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
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
}

/// A Unix-domain-socket message channel.
pub struct IpcChannel {
    config: IpcConfig,
    conn: FramedConnection,
    metrics: ChannelMetrics,
}

impl IpcChannel {
    /// Creates a disconnected channel with the given configuration.
    #[must_use]
    pub fn new(config: IpcConfig) -> Self {
        Self {
            config,
            conn: FramedConnection::new(),
            metrics: ChannelMetrics::new(),
        }
    }

    /// Returns the channel configuration.
    #[must_use]
    pub fn config(&self) -> &IpcConfig {
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
            UnixStream::connect(&self.config.socket_path),
        )
        .await
        .map_err(|_| ChannelError::Timeout)?
        .map_err(|e| {
            ChannelError::Connect(format!(
                "{}: {e}",
                self.config.socket_path.display()
            ))
        })?;

        let (r, w) = stream.into_split();
        let (reader, writer): (BoxedReader, BoxedWriter) = (Box::new(r), Box::new(w));
        self.conn.install(reader, writer).await;
        Ok(())
    }
}

#[async_trait]
impl MessageChannel for IpcChannel {
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
                    info!(path = %self.config.socket_path.display(), attempt, "IPC channel connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(path = %self.config.socket_path.display(), attempt, error = %e, "IPC connect attempt failed");
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
                                warn!(path = %self.config.socket_path.display(), "reconnect policy exhausted, IPC channel permanently closed");
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
        debug!(path = %self.config.socket_path.display(), "IPC channel disconnecting");
        self.conn.clear().await;
        Ok(())
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Ipc
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities::ipc_standard()
    }
}
