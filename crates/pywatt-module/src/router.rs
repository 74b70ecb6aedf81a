//! Outbound channel selection.
//!
//! Control messages leave the module on the stdio queue or on a socket
//! channel. [`ChannelRouter`] picks the channel for module-originated
//! traffic per the configured preferences; [`ReplyPath`] pins responses
//! to the channel their request arrived on.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use pywatt_channel::{
    ChannelError, ChannelMetricsSnapshot, ChannelPreferences, ChannelState, ChannelType,
    IpcChannel, MessageChannel, TcpChannel,
};
use pywatt_proto::{EncodedMessage, EncodingFormat, Message, ModuleToOrchestrator};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Messages parked for the earliest reconnection when no socket channel
/// is usable and stdio fallback is disabled.
pub const RECONNECT_QUEUE_CAPACITY: usize = 256;

/// How long a producer may block on the stdio queue before
/// `Backpressure`.
const BACKPRESSURE_WAIT: Duration = Duration::from_millis(100);

/// Errors routing an outbound message.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The explicitly requested channel is not usable.
    #[error("{0} channel unavailable")]
    ChannelUnavailable(ChannelType),

    /// Every channel is permanently closed.
    #[error("no channels available")]
    NoChannelsAvailable,

    /// The reconnect queue is full.
    #[error("reconnect queue full")]
    QueueFull,

    /// The stdio queue stayed full past the backpressure window.
    #[error("backpressure on stdio queue")]
    Backpressure,

    /// The message could not be encoded.
    #[error(transparent)]
    Encode(pywatt_proto::ProtocolError),
}

/// Where a response should be written: the channel its request came in on.
#[derive(Clone)]
pub struct ReplyPath {
    kind: ReplyKind,
    format: EncodingFormat,
}

#[derive(Clone)]
enum ReplyKind {
    Stdio(mpsc::Sender<ModuleToOrchestrator>),
    Socket(Arc<dyn MessageChannel>),
}

impl ReplyPath {
    /// A reply path onto the stdio writer queue.
    #[must_use]
    pub fn stdio(sender: mpsc::Sender<ModuleToOrchestrator>, format: EncodingFormat) -> Self {
        Self {
            kind: ReplyKind::Stdio(sender),
            format,
        }
    }

    /// A reply path onto a socket channel.
    #[must_use]
    pub fn socket(channel: Arc<dyn MessageChannel>, format: EncodingFormat) -> Self {
        Self {
            kind: ReplyKind::Socket(channel),
            format,
        }
    }

    /// The channel type responses travel on.
    #[must_use]
    pub fn channel_type(&self) -> ChannelType {
        match &self.kind {
            ReplyKind::Stdio(_) => ChannelType::Stdio,
            ReplyKind::Socket(channel) => channel.channel_type(),
        }
    }

    /// Sends one control message along this path.
    pub async fn send(&self, message: ModuleToOrchestrator) -> Result<(), RouterError> {
        match &self.kind {
            ReplyKind::Stdio(sender) => {
                match sender.send_timeout(message, BACKPRESSURE_WAIT).await {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(RouterError::Backpressure),
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                        Err(RouterError::NoChannelsAvailable)
                    }
                }
            }
            ReplyKind::Socket(channel) => {
                let encoded = encode_control(&message, self.format)?;
                channel
                    .send(encoded)
                    .await
                    .map_err(|e| socket_error(channel.channel_type(), &e))
            }
        }
    }

    /// Whether sending failed in a way a short retry may fix.
    #[must_use]
    pub fn is_transient(error: &RouterError) -> bool {
        matches!(
            error,
            RouterError::Backpressure | RouterError::ChannelUnavailable(_) | RouterError::QueueFull
        )
    }
}

fn encode_control(
    message: &ModuleToOrchestrator,
    format: EncodingFormat,
) -> Result<EncodedMessage, RouterError> {
    Message::new(message.clone())
        .encode_preferred(format)
        .map_err(RouterError::Encode)
}

fn socket_error(channel: ChannelType, error: &ChannelError) -> RouterError {
    match error {
        ChannelError::PermanentlyClosed => RouterError::NoChannelsAvailable,
        _ => RouterError::ChannelUnavailable(channel),
    }
}

/// Health of one channel, as reported by `AppState::channel_health`.
#[derive(Debug, Clone)]
pub struct ChannelHealth {
    /// Which channel.
    pub channel: ChannelType,
    /// Its connection state.
    pub state: ChannelState,
    /// Its traffic counters.
    pub metrics: Option<ChannelMetricsSnapshot>,
}

/// Picks the outbound channel for module-originated messages.
pub struct ChannelRouter {
    stdio: mpsc::Sender<ModuleToOrchestrator>,
    tcp: Option<Arc<TcpChannel>>,
    ipc: Option<Arc<IpcChannel>>,
    preferences: ChannelPreferences,
    tcp_required: bool,
    format: EncodingFormat,
    parked: Mutex<VecDeque<EncodedMessage>>,
}

impl ChannelRouter {
    /// Creates a router over the available channels.
    #[must_use]
    pub fn new(
        stdio: mpsc::Sender<ModuleToOrchestrator>,
        tcp: Option<Arc<TcpChannel>>,
        ipc: Option<Arc<IpcChannel>>,
        preferences: ChannelPreferences,
        tcp_required: bool,
        format: EncodingFormat,
    ) -> Self {
        Self {
            stdio,
            tcp,
            ipc,
            preferences,
            tcp_required,
            format,
            parked: Mutex::new(VecDeque::new()),
        }
    }

    /// A router with no socket channels: everything rides stdio.
    #[must_use]
    pub fn stdio_only(
        stdio: mpsc::Sender<ModuleToOrchestrator>,
        format: EncodingFormat,
    ) -> Self {
        Self::new(
            stdio,
            None,
            None,
            ChannelPreferences::default(),
            false,
            format,
        )
    }

    /// Channels this router can currently offer.
    #[must_use]
    pub fn available_channels(&self) -> Vec<ChannelType> {
        let mut channels = vec![ChannelType::Stdio];
        if self.tcp.is_some() {
            channels.push(ChannelType::Tcp);
        }
        if self.ipc.is_some() {
            channels.push(ChannelType::Ipc);
        }
        channels
    }

    /// State and counters for every channel.
    pub async fn channel_health(&self) -> Vec<ChannelHealth> {
        let mut health = vec![ChannelHealth {
            channel: ChannelType::Stdio,
            state: if self.stdio.is_closed() {
                ChannelState::PermanentlyClosed
            } else {
                ChannelState::Connected
            },
            metrics: None,
        }];

        if let Some(tcp) = &self.tcp {
            health.push(ChannelHealth {
                channel: ChannelType::Tcp,
                state: tcp.state().await,
                metrics: Some(tcp.metrics().snapshot()),
            });
        }
        if let Some(ipc) = &self.ipc {
            health.push(ChannelHealth {
                channel: ChannelType::Ipc,
                state: ipc.state().await,
                metrics: Some(ipc.metrics().snapshot()),
            });
        }
        health
    }

    /// Sends a control message on an explicitly named channel, or on the
    /// best available one when `explicit` is `None`.
    pub async fn send_control(
        &self,
        message: ModuleToOrchestrator,
        explicit: Option<ChannelType>,
    ) -> Result<(), RouterError> {
        match explicit {
            Some(ChannelType::Stdio) => self.send_stdio(message).await,
            Some(ChannelType::Tcp) => {
                let channel = self
                    .tcp
                    .clone()
                    .ok_or(RouterError::ChannelUnavailable(ChannelType::Tcp))?;
                self.send_socket(channel, &message).await
            }
            Some(ChannelType::Ipc) => {
                let channel = self
                    .ipc
                    .clone()
                    .ok_or(RouterError::ChannelUnavailable(ChannelType::Ipc))?;
                self.send_socket(channel, &message).await
            }
            None => self.send_preferred(message).await,
        }
    }

    async fn send_stdio(&self, message: ModuleToOrchestrator) -> Result<(), RouterError> {
        match self.stdio.send_timeout(message, BACKPRESSURE_WAIT).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(RouterError::Backpressure),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(RouterError::NoChannelsAvailable),
        }
    }

    async fn send_socket(
        &self,
        channel: Arc<dyn MessageChannel>,
        message: &ModuleToOrchestrator,
    ) -> Result<(), RouterError> {
        self.flush_parked(&channel).await;
        let encoded = encode_control(message, self.format)?;
        channel
            .send(encoded)
            .await
            .map_err(|e| socket_error(channel.channel_type(), &e))
    }

    async fn send_preferred(&self, message: ModuleToOrchestrator) -> Result<(), RouterError> {
        let ordered = self.ordered_sockets();

        for channel in &ordered {
            if channel.state().await != ChannelState::Connected {
                continue;
            }
            match self.send_socket(channel.clone(), &message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(channel = %channel.channel_type(), error = %e, "preferred channel failed");
                }
            }
        }

        // No connected socket took the message.
        if ordered.is_empty() || self.preferences.enable_fallback {
            return self.send_stdio(message).await;
        }

        if self.all_sockets_permanently_closed().await && self.stdio.is_closed() {
            return Err(RouterError::NoChannelsAvailable);
        }

        // Park for the earliest reconnection.
        let encoded = encode_control(&message, self.format)?;
        let mut parked = self.parked.lock().await;
        if parked.len() >= RECONNECT_QUEUE_CAPACITY {
            warn!(parked = parked.len(), "reconnect queue full, dropping message");
            return Err(RouterError::QueueFull);
        }
        parked.push_back(encoded);
        debug!(parked = parked.len(), "message parked until a channel reconnects");
        Ok(())
    }

    fn ordered_sockets(&self) -> Vec<Arc<dyn MessageChannel>> {
        let tcp = self
            .tcp
            .clone()
            .map(|c| c as Arc<dyn MessageChannel>);
        let ipc = self
            .ipc
            .clone()
            .map(|c| c as Arc<dyn MessageChannel>);

        let tcp_first = if self.tcp_required {
            true
        } else if self.preferences.prefer_ipc_for_local && !self.preferences.prefer_tcp_for_remote {
            false
        } else if self.preferences.prefer_tcp_for_remote && !self.preferences.prefer_ipc_for_local {
            true
        } else {
            // Both or neither preferred: lowest observed mean latency wins.
            self.tcp_beats_ipc_on_latency()
        };

        let pair = if tcp_first { [tcp, ipc] } else { [ipc, tcp] };
        pair.into_iter().flatten().collect()
    }

    fn tcp_beats_ipc_on_latency(&self) -> bool {
        let tcp_latency = self
            .tcp
            .as_ref()
            .and_then(|c| c.metrics().mean_latency());
        let ipc_latency = self
            .ipc
            .as_ref()
            .and_then(|c| c.metrics().mean_latency());
        match (tcp_latency, ipc_latency) {
            (Some(tcp), Some(ipc)) => tcp <= ipc,
            (Some(_), None) | (None, None) => true,
            (None, Some(_)) => false,
        }
    }

    async fn all_sockets_permanently_closed(&self) -> bool {
        for channel in self.ordered_sockets() {
            if channel.state().await != ChannelState::PermanentlyClosed {
                return false;
            }
        }
        true
    }

    async fn flush_parked(&self, channel: &Arc<dyn MessageChannel>) {
        let mut parked = self.parked.lock().await;
        while let Some(message) = parked.pop_front() {
            if let Err(e) = channel.send(message.clone()).await {
                debug!(error = %e, "flushing parked message failed, keeping it");
                parked.push_front(message);
                break;
            }
        }
    }

    /// Messages currently parked for reconnection.
    pub async fn parked_count(&self) -> usize {
        self.parked.lock().await.len()
    }
}
