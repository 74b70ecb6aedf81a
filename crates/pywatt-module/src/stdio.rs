//! The stdio control plane.
//!
//! Stdin carries one JSON object per line from the orchestrator; stdout
//! is protocol-only and carries one JSON object per line back. The
//! handshake is special: the first stdin line is a bare [`InitBlob`] and
//! the single announcement is a bare [`AnnounceBlob`]; everything after
//! travels as tagged [`OrchestratorToModule`] / [`ModuleToOrchestrator`]
//! objects.
//!
//! Malformed or unknown inbound lines are logged to stderr and skipped;
//! they never abort the process. All writes go through one serialised
//! writer task, so no other code may touch stdout once the control plane
//! is running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pywatt_proto::{AnnounceBlob, InitBlob, ModuleToOrchestrator, OrchestratorToModule};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::BootstrapError;

/// Capacity of the inbound and outbound control queues.
pub const QUEUE_CAPACITY: usize = 1024;

/// How long a producer may block on a full queue before `Backpressure`.
pub const BACKPRESSURE_WAIT: Duration = Duration::from_millis(100);

/// Errors sending on the control plane.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// The outbound queue stayed full past the backpressure window.
    #[error("control plane backpressure")]
    Backpressure,

    /// The writer task is gone; the process is shutting down.
    #[error("control plane closed")]
    Closed,

    /// A second announcement was attempted.
    #[error("announcement already sent")]
    AlreadyAnnounced,
}

/// Reads the handshake line: exactly one bare JSON [`InitBlob`].
pub async fn read_init<R>(reader: &mut R) -> Result<InitBlob, BootstrapError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .map_err(|e| BootstrapError::HandshakeFailed(format!("reading init blob: {e}")))?;

    if read == 0 {
        return Err(BootstrapError::HandshakeFailed(
            "stdin closed before init blob".to_owned(),
        ));
    }

    serde_json::from_str(line.trim())
        .map_err(|e| BootstrapError::HandshakeFailed(format!("malformed init blob: {e}")))
}

/// Handle to the stdio control plane.
///
/// Cloning shares the outbound queue and the announcement guard.
#[derive(Clone)]
pub struct ControlPlane {
    outbound: mpsc::Sender<ModuleToOrchestrator>,
    announced: Arc<AtomicBool>,
}

impl ControlPlane {
    /// Spawns the reader and writer tasks over the given streams.
    ///
    /// The reader must be the buffered stream the handshake was read
    /// from, so no bytes are stranded in a stale buffer. Returns the
    /// handle, the inbound message queue for the dispatcher, and a join
    /// handle resolving when both tasks stop.
    pub fn start<R, W>(
        reader: R,
        writer: W,
        cancel: CancellationToken,
    ) -> (
        Self,
        mpsc::Receiver<OrchestratorToModule>,
        JoinHandle<()>,
    )
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (in_tx, in_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(QUEUE_CAPACITY);

        let reader_cancel = cancel.clone();
        let reader_task = tokio::spawn(read_loop(reader, in_tx, reader_cancel));
        let writer_task = tokio::spawn(write_loop(writer, out_rx, cancel));

        let join = tokio::spawn(async move {
            let _ = reader_task.await;
            let _ = writer_task.await;
        });

        (
            Self {
                outbound: out_tx,
                announced: Arc::new(AtomicBool::new(false)),
            },
            in_rx,
            join,
        )
    }

    /// The outbound queue, for components that write control messages.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<ModuleToOrchestrator> {
        self.outbound.clone()
    }

    /// Enqueues one outbound control message.
    pub async fn send(&self, message: ModuleToOrchestrator) -> Result<(), ControlPlaneError> {
        match self
            .outbound
            .send_timeout(message, BACKPRESSURE_WAIT)
            .await
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(ControlPlaneError::Backpressure),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(ControlPlaneError::Closed),
        }
    }

    /// Sends the announcement. Succeeds at most once per process lifetime.
    pub async fn announce(&self, announce: AnnounceBlob) -> Result<(), ControlPlaneError> {
        if self.announced.swap(true, Ordering::SeqCst) {
            return Err(ControlPlaneError::AlreadyAnnounced);
        }
        info!(listen = %announce.listen, endpoints = announce.endpoints.len(), "announcing module");
        self.send(ModuleToOrchestrator::Announce(announce)).await
    }
}

async fn read_loop<R>(
    mut reader: R,
    inbound: mpsc::Sender<OrchestratorToModule>,
    cancel: CancellationToken,
) where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_line(&mut line) => read,
        };

        match read {
            Ok(0) => {
                info!("stdin closed by orchestrator");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<OrchestratorToModule>(trimmed) {
                    Ok(message) => {
                        if inbound.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Tolerates future message kinds and additive fields.
                        warn!(error = %e, length = trimmed.len(), "skipping unparseable control line");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        }
    }
    debug!("stdio read loop finished");
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<ModuleToOrchestrator>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        // The announcement is the one unwrapped line of the protocol.
        let serialised = match &message {
            ModuleToOrchestrator::Announce(blob) => serde_json::to_string(blob),
            other => serde_json::to_string(other),
        };

        let mut line = match serialised {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialise control message");
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!(error = %e, "stdout write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            error!(error = %e, "stdout flush failed");
            break;
        }
    }
    debug!("stdio write loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pywatt_proto::{EndpointAnnounce, GetSecretRequest};
    use tokio::io::{duplex, BufReader};

    #[tokio::test]
    async fn read_init_parses_first_line() {
        let line = r#"{"orchestrator_api":"x","module_id":"m1","env":{},"listen":{"tcp":"127.0.0.1:0"},"security_level":"None"}"#;
        let mut reader = BufReader::new(std::io::Cursor::new(format!("{line}\n").into_bytes()));

        let init = read_init(&mut reader).await.unwrap();
        assert_eq!(init.module_id, "m1");
    }

    #[tokio::test]
    async fn read_init_fails_on_malformed_json() {
        let mut reader = BufReader::new(std::io::Cursor::new(b"not json\n".to_vec()));
        let err = read_init(&mut reader).await.unwrap_err();
        assert!(matches!(err, BootstrapError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn read_init_fails_on_eof() {
        let mut reader = BufReader::new(std::io::Cursor::new(Vec::new()));
        let err = read_init(&mut reader).await.unwrap_err();
        assert!(matches!(err, BootstrapError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn writer_emits_tagged_lines() {
        let (stdin_tx, stdin_rx) = duplex(1024);
        let (stdout_tx, stdout_rx) = duplex(1024);
        drop(stdin_tx);

        let cancel = CancellationToken::new();
        let (plane, _inbound, _join) = ControlPlane::start(BufReader::new(stdin_rx), stdout_tx, cancel.clone());

        plane
            .send(ModuleToOrchestrator::GetSecret(GetSecretRequest {
                name: "API_KEY".to_owned(),
            }))
            .await
            .unwrap();

        let mut lines = BufReader::new(stdout_rx).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"GetSecret":{"name":"API_KEY"}}"#);
        cancel.cancel();
    }

    #[tokio::test]
    async fn announce_is_bare_and_single() {
        let (stdin_tx, stdin_rx) = duplex(1024);
        let (stdout_tx, stdout_rx) = duplex(1024);
        drop(stdin_tx);

        let cancel = CancellationToken::new();
        let (plane, _inbound, _join) = ControlPlane::start(BufReader::new(stdin_rx), stdout_tx, cancel.clone());

        let announce = AnnounceBlob {
            listen: "127.0.0.1:4102".to_owned(),
            endpoints: vec![EndpointAnnounce {
                path: "/health".to_owned(),
                methods: vec!["GET".to_owned()],
                auth: None,
            }],
        };
        plane.announce(announce.clone()).await.unwrap();

        // Second announcement is refused before reaching the wire.
        assert!(matches!(
            plane.announce(announce).await,
            Err(ControlPlaneError::AlreadyAnnounced)
        ));

        let mut lines = BufReader::new(stdout_rx).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let parsed: AnnounceBlob = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.listen, "127.0.0.1:4102");
        cancel.cancel();
    }

    #[tokio::test]
    async fn reader_skips_malformed_lines() {
        let (mut stdin_tx, stdin_rx) = duplex(1024);
        let (stdout_tx, _stdout_rx) = duplex(1024);

        let cancel = CancellationToken::new();
        let (_plane, mut inbound, _join) = ControlPlane::start(BufReader::new(stdin_rx), stdout_tx, cancel.clone());

        use tokio::io::AsyncWriteExt;
        stdin_tx.write_all(b"garbage line\n").await.unwrap();
        stdin_tx
            .write_all(b"{\"UnknownKind\":{}}\n")
            .await
            .unwrap();
        stdin_tx.write_all(b"\"Heartbeat\"\n").await.unwrap();

        // Only the valid message comes through.
        let message = inbound.recv().await.unwrap();
        assert_eq!(message, OrchestratorToModule::Heartbeat);
        cancel.cancel();
    }
}
