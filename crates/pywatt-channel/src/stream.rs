//! Shared connection plumbing for framed socket channels.
//!
//! Both socket channels own their stream halves behind mutexes: one task
//! reads, writers serialise on the write half. State transitions live
//! here so TCP and Unix channels behave identically on failure.

use std::time::Instant;

use pywatt_proto::{codec, EncodedMessage, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::ChannelError;
use crate::metrics::ChannelMetrics;
use crate::traits::ChannelState;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stream halves plus the channel state machine.
pub(crate) struct FramedConnection {
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    state: RwLock<ChannelState>,
}

impl FramedConnection {
    pub(crate) fn new() -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            state: RwLock::new(ChannelState::Disconnected),
        }
    }

    pub(crate) async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    /// Sets the state unless the channel is already permanently closed.
    pub(crate) async fn set_state(&self, next: ChannelState) {
        let mut guard = self.state.write().await;
        if *guard != ChannelState::PermanentlyClosed {
            *guard = next;
        }
    }

    /// Marks the channel permanently closed. Terminal.
    pub(crate) async fn close_permanently(&self) {
        *self.state.write().await = ChannelState::PermanentlyClosed;
        *self.reader.lock().await = None;
        *self.writer.lock().await = None;
    }

    /// Installs freshly connected halves and marks the channel connected.
    pub(crate) async fn install(&self, reader: BoxedReader, writer: BoxedWriter) {
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.set_state(ChannelState::Connected).await;
    }

    /// Drops both halves and marks the channel disconnected.
    pub(crate) async fn clear(&self) {
        *self.reader.lock().await = None;
        *self.writer.lock().await = None;
        self.set_state(ChannelState::Disconnected).await;
    }

    /// Writes one frame under the writer lock.
    pub(crate) async fn send_frame(
        &self,
        message: &EncodedMessage,
        metrics: &ChannelMetrics,
    ) -> Result<(), ChannelError> {
        if self.state().await == ChannelState::PermanentlyClosed {
            return Err(ChannelError::PermanentlyClosed);
        }

        let started = Instant::now();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::NotConnected)?;

        match codec::write_frame(writer, message).await {
            Ok(()) => {
                metrics.record_send(started.elapsed());
                Ok(())
            }
            Err(e) => {
                metrics.record_send_failure();
                *guard = None;
                drop(guard);
                self.set_state(ChannelState::Disconnected).await;
                debug!(error = %e, "send failed, channel disconnected");
                Err(e.into())
            }
        }
    }

    /// Reads one frame under the reader lock.
    ///
    /// An oversized frame closes the connection: the stream position is
    /// unrecoverable once a bad length prefix has been consumed.
    pub(crate) async fn receive_frame(
        &self,
        metrics: &ChannelMetrics,
    ) -> Result<EncodedMessage, ChannelError> {
        if self.state().await == ChannelState::PermanentlyClosed {
            return Err(ChannelError::PermanentlyClosed);
        }

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ChannelError::NotConnected)?;

        match codec::read_frame(reader).await {
            Ok(message) => {
                metrics.record_receive();
                Ok(message)
            }
            Err(e) => {
                let fatal = matches!(
                    e,
                    ProtocolError::FrameTooLarge { .. }
                        | ProtocolError::TruncatedFrame
                        | ProtocolError::Io(_)
                );
                if fatal {
                    *guard = None;
                    drop(guard);
                    self.set_state(ChannelState::Disconnected).await;
                    debug!(error = %e, "receive failed, channel disconnected");
                }
                Err(e.into())
            }
        }
    }
}
