//! TCP port negotiation with the orchestrator.
//!
//! The module asks for a port over stdio (`PortRequest` → `PortResponse`)
//! with retries and exponential backoff. A per-process circuit breaker
//! short-circuits a repeatedly-failing orchestrator to a local fallback:
//! a bindable port picked at random from the dynamic range, flagged
//! `unadvertised` so callers know the orchestrator was not told.
//!
//! A pre-allocated port (`PYWATT_PORT` or a concrete port in the init
//! blob) bypasses negotiation entirely; that decision is made by
//! bootstrap before this module is consulted.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use pywatt_channel::RequestCorrelator;
use pywatt_proto::{ModuleToOrchestrator, PortRequest, PortResponse};
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bottom of the dynamic port range used for fallback selection.
pub const FALLBACK_PORT_MIN: u16 = 49152;
/// Top of the dynamic port range.
pub const FALLBACK_PORT_MAX: u16 = 65535;

/// Consecutive failures within the window that open the breaker.
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
/// Window in which failures count as consecutive.
const BREAKER_FAILURE_WINDOW: Duration = Duration::from_secs(60);
/// How long the breaker stays open before allowing a probe.
const BREAKER_OPEN_DURATION: Duration = Duration::from_secs(30);

/// How many random ports the fallback tries to bind before giving up.
const FALLBACK_BIND_ATTEMPTS: u32 = 16;

/// Errors obtaining a port.
#[derive(Error, Debug)]
pub enum PortError {
    /// The breaker is open and fallback is disabled.
    #[error("port negotiation breaker is open")]
    BreakerOpen,

    /// Neither negotiation nor fallback produced a bindable port.
    #[error("no port available: {0}")]
    NoPortAvailable(String),

    /// The orchestrator rejected the request.
    #[error("port request rejected: {0}")]
    Rejected(String),

    /// The control plane to the orchestrator is gone.
    #[error("port negotiation transport error: {0}")]
    Transport(String),
}

/// A port obtained for the module's HTTP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedPort {
    /// The port to bind.
    pub port: u16,
    /// True when the port came from the local fallback range and the
    /// orchestrator does not know about it.
    pub unadvertised: bool,
}

/// Tunables for the negotiation protocol.
#[derive(Debug, Clone)]
pub struct PortNegotiatorConfig {
    /// Overall deadline across all attempts.
    pub overall_timeout: Duration,
    /// Deadline for a single response.
    pub attempt_timeout: Duration,
    /// Maximum protocol attempts per negotiation.
    pub max_attempts: usize,
    /// Backoff before the 2nd, 3rd, … attempts; the last entry repeats.
    pub backoffs: Vec<Duration>,
    /// Whether to fall back to a random bindable port.
    pub use_fallback: bool,
}

impl Default for PortNegotiatorConfig {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(2),
            max_attempts: 3,
            backoffs: vec![
                Duration::from_millis(250),
                Duration::from_secs(1),
                Duration::from_secs(4),
            ],
            use_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    status: BreakerStatus,
    failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Per-process circuit breaker for the negotiation path.
#[derive(Debug)]
struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                status: BreakerStatus::Closed,
                failures: 0,
                window_start: None,
                opened_at: None,
            }),
        }
    }

    /// Whether a protocol attempt may proceed. Transitions Open →
    /// HalfOpen once the open period has elapsed, admitting one probe.
    fn allow_attempt(&self) -> bool {
        let mut inner = lock(&self.inner);
        match inner.status {
            BreakerStatus::Closed | BreakerStatus::HalfOpen => true,
            BreakerStatus::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= BREAKER_OPEN_DURATION {
                    inner.status = BreakerStatus::HalfOpen;
                    info!("port negotiation breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = lock(&self.inner);
        if inner.status != BreakerStatus::Closed {
            info!("port negotiation breaker closed");
        }
        inner.status = BreakerStatus::Closed;
        inner.failures = 0;
        inner.window_start = None;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = lock(&self.inner);
        match inner.status {
            BreakerStatus::HalfOpen => {
                inner.status = BreakerStatus::Open;
                inner.opened_at = Some(Instant::now());
                warn!("port negotiation breaker reopened after failed probe");
            }
            BreakerStatus::Open => {
                inner.opened_at = Some(Instant::now());
            }
            BreakerStatus::Closed => {
                let now = Instant::now();
                let in_window = inner
                    .window_start
                    .is_some_and(|start| now.duration_since(start) < BREAKER_FAILURE_WINDOW);
                if !in_window {
                    inner.window_start = Some(now);
                    inner.failures = 0;
                }
                inner.failures += 1;
                if inner.failures >= BREAKER_FAILURE_THRESHOLD {
                    inner.status = BreakerStatus::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        failures = inner.failures,
                        "port negotiation breaker opened"
                    );
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        lock(&self.inner).status == BreakerStatus::Open
    }
}

fn lock(mutex: &Mutex<BreakerInner>) -> std::sync::MutexGuard<'_, BreakerInner> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Negotiates TCP ports with the orchestrator.
pub struct PortNegotiator {
    outbound: mpsc::Sender<ModuleToOrchestrator>,
    correlator: RequestCorrelator<PortResponse>,
    breaker: CircuitBreaker,
    config: PortNegotiatorConfig,
}

impl PortNegotiator {
    /// Creates a negotiator with the default protocol tunables.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<ModuleToOrchestrator>) -> Self {
        Self::with_config(outbound, PortNegotiatorConfig::default())
    }

    /// Creates a negotiator with custom tunables.
    #[must_use]
    pub fn with_config(
        outbound: mpsc::Sender<ModuleToOrchestrator>,
        config: PortNegotiatorConfig,
    ) -> Self {
        Self {
            outbound,
            correlator: RequestCorrelator::new(),
            breaker: CircuitBreaker::new(),
            config,
        }
    }

    /// Delivers a `PortResponse` arriving from the orchestrator.
    ///
    /// Late responses with no awaiting request are dropped silently.
    pub fn deliver(&self, response: PortResponse) {
        self.correlator.complete(response.request_id, response);
    }

    /// Obtains a usable port, negotiating with the orchestrator or
    /// falling back to a random bindable port when the breaker is open or
    /// every attempt fails.
    pub async fn negotiate(&self, specific_port: Option<u16>) -> Result<NegotiatedPort, PortError> {
        if !self.breaker.allow_attempt() {
            debug!("breaker open, skipping negotiation");
            return self.fallback("circuit breaker open").await;
        }

        match tokio::time::timeout(self.config.overall_timeout, self.run_attempts(specific_port))
            .await
        {
            Ok(Ok(port)) => {
                self.breaker.record_success();
                Ok(NegotiatedPort {
                    port,
                    unadvertised: false,
                })
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                warn!(error = %e, "port negotiation failed");
                self.fallback(&e.to_string()).await
            }
            Err(_) => {
                self.breaker.record_failure();
                warn!(
                    deadline_secs = self.config.overall_timeout.as_secs(),
                    "port negotiation deadline exceeded"
                );
                self.fallback("negotiation deadline exceeded").await
            }
        }
    }

    async fn run_attempts(&self, specific_port: Option<u16>) -> Result<u16, PortError> {
        let mut last_error = PortError::Transport("no attempts made".to_owned());

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let delay = self
                    .config
                    .backoffs
                    .get(attempt - 1)
                    .or(self.config.backoffs.last())
                    .copied()
                    .unwrap_or(Duration::from_secs(1));
                tokio::time::sleep(delay).await;
            }

            match self.request_once(specific_port).await {
                Ok(port) => return Ok(port),
                Err(e) => {
                    debug!(attempt = attempt + 1, error = %e, "port request attempt failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn request_once(&self, specific_port: Option<u16>) -> Result<u16, PortError> {
        let request_id = Uuid::new_v4();
        let slot = self
            .correlator
            .register(request_id)
            .map_err(|e| PortError::Transport(e.to_string()))?;

        let request = ModuleToOrchestrator::PortRequest(PortRequest {
            request_id,
            specific_port,
        });
        self.outbound
            .send(request)
            .await
            .map_err(|_| PortError::Transport("control plane closed".to_owned()))?;

        let response = slot
            .wait(self.config.attempt_timeout)
            .await
            .map_err(|e| PortError::Transport(e.to_string()))?;

        match (response.port, response.error) {
            (Some(port), _) => Ok(port),
            (None, Some(error)) => Err(PortError::Rejected(error)),
            (None, None) => Err(PortError::Rejected(
                "response carried neither port nor error".to_owned(),
            )),
        }
    }

    async fn fallback(&self, reason: &str) -> Result<NegotiatedPort, PortError> {
        if !self.config.use_fallback {
            return if self.breaker.is_open() {
                Err(PortError::BreakerOpen)
            } else {
                Err(PortError::NoPortAvailable(reason.to_owned()))
            };
        }

        for _ in 0..FALLBACK_BIND_ATTEMPTS {
            let port = rand::thread_rng().gen_range(FALLBACK_PORT_MIN..=FALLBACK_PORT_MAX);
            match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    drop(listener);
                    info!(port, reason, "using unadvertised fallback port");
                    return Ok(NegotiatedPort {
                        port,
                        unadvertised: true,
                    });
                }
                Err(_) => continue,
            }
        }

        Err(PortError::NoPortAvailable(format!(
            "no bindable port found in [{FALLBACK_PORT_MIN}, {FALLBACK_PORT_MAX}] after {reason}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> PortNegotiatorConfig {
        PortNegotiatorConfig {
            overall_timeout: Duration::from_millis(200),
            attempt_timeout: Duration::from_millis(30),
            max_attempts: 3,
            backoffs: vec![Duration::from_millis(5), Duration::from_millis(10)],
            use_fallback: true,
        }
    }

    fn negotiator() -> (PortNegotiator, mpsc::Receiver<ModuleToOrchestrator>) {
        let (tx, rx) = mpsc::channel(64);
        (PortNegotiator::with_config(tx, fast_config()), rx)
    }

    #[tokio::test]
    async fn successful_negotiation_returns_advertised_port() {
        let (negotiator, mut outbound) = negotiator();
        let negotiator = std::sync::Arc::new(negotiator);

        let responder = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move {
                match outbound.recv().await.unwrap() {
                    ModuleToOrchestrator::PortRequest(request) => {
                        negotiator.deliver(PortResponse {
                            request_id: request.request_id,
                            port: Some(4102),
                            error: None,
                        });
                    }
                    other => panic!("expected PortRequest, got {other:?}"),
                }
            })
        };

        let negotiated = negotiator.negotiate(None).await.unwrap();
        assert_eq!(negotiated.port, 4102);
        assert!(!negotiated.unadvertised);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn specific_port_travels_in_request() {
        let (negotiator, mut outbound) = negotiator();
        let negotiator = std::sync::Arc::new(negotiator);

        let responder = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move {
                match outbound.recv().await.unwrap() {
                    ModuleToOrchestrator::PortRequest(request) => {
                        assert_eq!(request.specific_port, Some(8443));
                        negotiator.deliver(PortResponse {
                            request_id: request.request_id,
                            port: Some(8443),
                            error: None,
                        });
                    }
                    other => panic!("expected PortRequest, got {other:?}"),
                }
            })
        };

        let negotiated = negotiator.negotiate(Some(8443)).await.unwrap();
        assert_eq!(negotiated.port, 8443);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_requests_fall_back_to_dynamic_range() {
        let (negotiator, _outbound) = negotiator();

        let negotiated = negotiator.negotiate(None).await.unwrap();
        assert!(negotiated.unadvertised);
        assert!(negotiated.port >= FALLBACK_PORT_MIN);
    }

    #[tokio::test]
    async fn breaker_opens_on_fifth_failure_and_no_sooner() {
        let (negotiator, _outbound) = negotiator();

        for call in 1..=4 {
            let _ = negotiator.negotiate(None).await.unwrap();
            assert!(
                !negotiator.breaker.is_open(),
                "breaker must stay closed after {call} failures"
            );
        }

        let _ = negotiator.negotiate(None).await.unwrap();
        assert!(negotiator.breaker.is_open(), "breaker must open on the 5th");
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_to_fallback() {
        let (negotiator, _outbound) = negotiator();

        for _ in 0..5 {
            let _ = negotiator.negotiate(None).await.unwrap();
        }
        assert!(negotiator.breaker.is_open());

        // With the breaker open no protocol attempt is made, so the call
        // resolves well inside the 100 ms bound.
        let started = Instant::now();
        let negotiated = negotiator.negotiate(None).await.unwrap();
        assert!(negotiated.unadvertised);
        assert!((FALLBACK_PORT_MIN..=FALLBACK_PORT_MAX).contains(&negotiated.port));
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "open breaker must answer fast, took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn rejection_surfaces_error_reason() {
        let config = PortNegotiatorConfig {
            use_fallback: false,
            ..fast_config()
        };
        let (tx, mut outbound) = mpsc::channel(64);
        let negotiator = std::sync::Arc::new(PortNegotiator::with_config(tx, config));

        let responder = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move {
                while let Some(message) = outbound.recv().await {
                    if let ModuleToOrchestrator::PortRequest(request) = message {
                        negotiator.deliver(PortResponse {
                            request_id: request.request_id,
                            port: None,
                            error: Some("pool exhausted".to_owned()),
                        });
                    }
                }
            })
        };

        let err = negotiator.negotiate(None).await.unwrap_err();
        assert!(matches!(err, PortError::NoPortAvailable(_)));
        responder.abort();
    }

    #[tokio::test]
    async fn late_port_response_is_dropped() {
        let (negotiator, _outbound) = negotiator();
        // No awaiting request: a stray response must be a no-op.
        negotiator.deliver(PortResponse {
            request_id: Uuid::new_v4(),
            port: Some(1234),
            error: None,
        });
    }
}
