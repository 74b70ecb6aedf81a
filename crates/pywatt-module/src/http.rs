//! HTTP-over-IPC adapter.
//!
//! The background channel loops feed tunnelled [`IpcHttpRequest`]s into a
//! bounded in-process queue. The user's router glue consumes
//! [`InboundHttpRequest`]s from that queue and answers each one; the
//! adapter pins every response to the channel its request arrived on,
//! enforces request-id echoing, retries transient write failures, and
//! keeps the traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pywatt_proto::{IpcHttpRequest, IpcHttpResponse, ModuleToOrchestrator};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::router::ReplyPath;

/// Capacity of the inbound request queue.
pub const HTTP_QUEUE_CAPACITY: usize = 1024;

/// How long `dispatch` may block on a full queue before dropping.
const BACKPRESSURE_WAIT: Duration = Duration::from_millis(100);

/// Backoff before each response write retry.
const RESPONSE_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(150),
    Duration::from_millis(450),
];

/// Errors answering a tunnelled request.
#[derive(Error, Debug)]
pub enum HttpTunnelError {
    /// The response could not be written after every retry; the request
    /// is recorded as lost.
    #[error("response lost after retries: {0}")]
    ResponseLost(String),
}

/// Adapter counters, exposed through [`HttpTunnel::metrics`].
#[derive(Debug, Default)]
pub struct HttpMetrics {
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    errors: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_samples: AtomicU64,
}

impl HttpMetrics {
    fn record_request(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    fn record_response(&self, elapsed: Duration) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        let micros = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.latency_sum_us.fetch_add(micros, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HttpMetricsSnapshot {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let mean_latency = if samples == 0 {
            None
        } else {
            Some(Duration::from_micros(
                self.latency_sum_us.load(Ordering::Relaxed) / samples,
            ))
        };
        HttpMetricsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            mean_latency,
        }
    }
}

/// Point-in-time copy of the adapter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpMetricsSnapshot {
    /// Requests taken off the wire.
    pub requests_received: u64,
    /// Responses successfully written back.
    pub responses_sent: u64,
    /// Requests dropped or responses lost.
    pub errors: u64,
    /// Rolling mean of request-to-response latency.
    pub mean_latency: Option<Duration>,
}

/// A tunnelled request awaiting its response.
pub struct InboundHttpRequest {
    request: IpcHttpRequest,
    reply: ReplyPath,
    received_at: Instant,
    metrics: Arc<HttpMetrics>,
}

impl InboundHttpRequest {
    /// The tunnelled HTTP request.
    #[must_use]
    pub fn request(&self) -> &IpcHttpRequest {
        &self.request
    }

    /// Writes the response back on the arrival channel.
    ///
    /// The response's `request_id` is forced to echo the request;
    /// transient write failures are retried with 50/150/450 ms backoff,
    /// after which the request counts as lost.
    pub async fn respond(self, mut response: IpcHttpResponse) -> Result<(), HttpTunnelError> {
        response.request_id.clone_from(&self.request.request_id);
        let message = ModuleToOrchestrator::HttpResponse(response);

        let mut delays = RESPONSE_RETRY_DELAYS.iter();
        loop {
            match self.reply.send(message.clone()).await {
                Ok(()) => {
                    self.metrics.record_response(self.received_at.elapsed());
                    debug!(
                        request_id = %self.request.request_id,
                        channel = %self.reply.channel_type(),
                        "HTTP response sent"
                    );
                    return Ok(());
                }
                Err(e) if ReplyPath::is_transient(&e) => match delays.next() {
                    Some(delay) => {
                        debug!(error = %e, "HTTP response write failed, retrying");
                        tokio::time::sleep(*delay).await;
                    }
                    None => {
                        self.metrics.record_error();
                        warn!(
                            request_id = %self.request.request_id,
                            error = %e,
                            "HTTP response lost after retries"
                        );
                        return Err(HttpTunnelError::ResponseLost(e.to_string()));
                    }
                },
                Err(e) => {
                    self.metrics.record_error();
                    warn!(
                        request_id = %self.request.request_id,
                        error = %e,
                        "HTTP response lost"
                    );
                    return Err(HttpTunnelError::ResponseLost(e.to_string()));
                }
            }
        }
    }
}

/// The inbound side of the HTTP tunnel.
#[derive(Clone)]
pub struct HttpTunnel {
    queue: mpsc::Sender<InboundHttpRequest>,
    metrics: Arc<HttpMetrics>,
}

impl HttpTunnel {
    /// Creates the tunnel and the request queue the router glue consumes.
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<InboundHttpRequest>) {
        let (queue, receiver) = mpsc::channel(HTTP_QUEUE_CAPACITY);
        (
            Self {
                queue,
                metrics: Arc::new(HttpMetrics::default()),
            },
            receiver,
        )
    }

    /// Adapter counters.
    #[must_use]
    pub fn metrics(&self) -> HttpMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Hands an inbound request to the consumer queue.
    ///
    /// Called by the channel dispatchers. A queue that stays full past
    /// the backpressure window drops the request and records an error.
    pub(crate) async fn dispatch(&self, request: IpcHttpRequest, reply: ReplyPath) {
        self.metrics.record_request();
        let inbound = InboundHttpRequest {
            request,
            reply,
            received_at: Instant::now(),
            metrics: self.metrics.clone(),
        };

        match self.queue.send_timeout(inbound, BACKPRESSURE_WAIT).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(dropped)) => {
                self.metrics.record_error();
                warn!(
                    request_id = %dropped.request.request_id,
                    "HTTP queue full, request dropped"
                );
            }
            Err(mpsc::error::SendTimeoutError::Closed(dropped)) => {
                self.metrics.record_error();
                warn!(
                    request_id = %dropped.request.request_id,
                    "HTTP consumer gone, request dropped"
                );
            }
        }
    }
}

/// Drives a handler over the request queue, one task per request.
///
/// This is the glue a module uses when it serves tunnelled HTTP without
/// an embedded router framework.
pub fn spawn_http_service<F, Fut>(
    mut requests: mpsc::Receiver<InboundHttpRequest>,
    handler: F,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    F: Fn(IpcHttpRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = IpcHttpResponse> + Send + 'static,
{
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        loop {
            let inbound = tokio::select! {
                _ = cancel.cancelled() => break,
                inbound = requests.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };

            let handler = handler.clone();
            tokio::spawn(async move {
                let response = handler(inbound.request().clone()).await;
                let _ = inbound.respond(response).await;
            });
        }
        debug!("HTTP service loop finished");
    })
}
