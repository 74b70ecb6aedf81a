//! Module bootstrap and lifecycle.
//!
//! The complete startup flow for a PyWatt module:
//!
//! 1. Install stderr logging wired to the redaction registry
//! 2. Read the init blob from stdin
//! 3. Start the stdio control plane and construct the secret client
//! 4. Bring up socket channels per the init blob and preferences
//! 5. Fetch the caller's initial secrets (in parallel)
//! 6. Build the module's own state
//! 7. Resolve the listen address, binding and negotiating as needed
//! 8. Emit exactly one announcement on stdout
//! 9. Spawn one background processor per live channel
//!
//! Shutdown (an orchestrator `Shutdown`, an OS termination signal, or
//! [`AppState::shutdown`]) cancels one token observed by every
//! background task, resolves pending correlator slots, and drains tasks
//! within a 5-second grace period.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pywatt_channel::{
    ChannelError, ChannelPreferences, ChannelType, IpcChannel, IpcConfig, MessageChannel,
    ReconnectPolicy, TcpChannel, TcpConfig, TlsSettings,
};
use pywatt_proto::{
    AnnounceBlob, EncodingFormat, EndpointAnnounce, InitBlob, ListenAddress, ModuleToOrchestrator,
    OrchestratorToModule, SecurityLevel,
};
use pywatt_secrets::{FetchMode, SecretClient, SecretValue};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ModuleConfig;
use crate::error::BootstrapError;
use crate::http::HttpTunnel;
use crate::logging::init_logging;
use crate::messaging::{HandlerRegistry, Messaging};
use crate::port::PortNegotiator;
use crate::router::{ChannelRouter, ReplyPath};
use crate::state::{AppState, StateParts};
use crate::stdio::{read_init, ControlPlane};

/// Grace period for background tasks after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Reconnect policy for orchestrator socket channels: bounded, so a dead
/// endpoint fails bootstrap promptly and a lost connection is given a
/// handful of attempts before the channel closes for good.
fn channel_reconnect_policy() -> ReconnectPolicy {
    ReconnectPolicy::ExponentialBackoff {
        initial: Duration::from_millis(250),
        max: Duration::from_secs(5),
        multiplier: 2.0,
        jitter: 0.1,
        max_attempts: 5,
    }
}

/// Everything a caller hands to bootstrap besides the state builder.
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    /// Secret names fetched before the module's state is built. All are
    /// required; a missing one aborts bootstrap.
    pub secret_keys: Vec<String>,
    /// Endpoints announced to the orchestrator.
    pub endpoints: Vec<EndpointAnnounce>,
    /// Channel preferences; defaults bring up whatever the orchestrator
    /// offers.
    pub preferences: ChannelPreferences,
    /// TLS settings for the TCP channel. Required when the init blob
    /// demands mutual TLS.
    pub tls: Option<TlsSettings>,
}

/// Bootstraps a module over the process's real stdin/stdout and installs
/// OS signal handling.
///
/// Returns the shared state and a join handle resolving once shutdown
/// has drained the background tasks.
pub async fn bootstrap_module<T, F>(
    options: BootstrapOptions,
    state_builder: F,
) -> Result<(AppState<T>, JoinHandle<()>), BootstrapError>
where
    T: Send + Sync + 'static,
    F: FnOnce(&InitBlob, Vec<SecretValue>) -> T,
{
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let (state, join) = bootstrap_with_io(stdin, stdout, options, state_builder).await?;

    spawn_signal_listener(state.cancellation_token());
    Ok((state, join))
}

/// Bootstraps a module over arbitrary streams.
///
/// This is the full flow minus OS signal handling; embedding harnesses
/// and tests drive it with in-memory pipes.
pub async fn bootstrap_with_io<R, W, T, F>(
    mut reader: R,
    writer: W,
    options: BootstrapOptions,
    state_builder: F,
) -> Result<(AppState<T>, JoinHandle<()>), BootstrapError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    T: Send + Sync + 'static,
    F: FnOnce(&InitBlob, Vec<SecretValue>) -> T,
{
    init_logging();

    let init = read_init(&mut reader).await?;
    info!(module_id = %init.module_id, listen = %init.listen, "handshake complete");

    let mut config = ModuleConfig::from_env().unwrap_or_else(|e| {
        warn!(error = %e, "invalid PYWATT_* environment, using defaults");
        ModuleConfig::default()
    });
    config.apply_init_env(&init.env);
    let format = config.message_format();

    let cancel = CancellationToken::new();
    let (control, control_rx, stdio_join) = ControlPlane::start(reader, writer, cancel.clone());

    let secrets = SecretClient::new(control.sender());
    let negotiator = Arc::new(PortNegotiator::new(control.sender()));
    let (http, http_requests) = HttpTunnel::new();
    let handlers = Arc::new(HandlerRegistry::new());

    // Socket channels, per init blob and preferences.
    let tcp = setup_tcp_channel(&init, &options).await?;
    let ipc = setup_ipc_channel(&init, &options).await?;
    let tcp_required = init.tcp_channel.as_ref().is_some_and(|c| c.required);

    let router = Arc::new(ChannelRouter::new(
        control.sender(),
        tcp.clone(),
        ipc.clone(),
        options.preferences,
        tcp_required,
        format,
    ));
    let messaging = Messaging::new(init.module_id.clone(), router.clone());

    let dispatcher = Arc::new(Dispatcher {
        secrets: secrets.clone(),
        ports: negotiator.clone(),
        http: http.clone(),
        messaging: messaging.clone(),
        handlers: handlers.clone(),
        cancel: cancel.clone(),
        stdio_out: control.sender(),
        format,
    });

    let mut loops = Vec::new();
    loops.push(tokio::spawn(stdio_dispatch_loop(
        control_rx,
        dispatcher.clone(),
    )));
    if let Some(channel) = &tcp {
        let channel = channel.clone() as Arc<dyn MessageChannel>;
        loops.push(tokio::spawn(socket_loop(channel, dispatcher.clone())));
    }
    if let Some(channel) = &ipc {
        let channel = channel.clone() as Arc<dyn MessageChannel>;
        loops.push(tokio::spawn(socket_loop(channel, dispatcher.clone())));
    }

    // Initial secrets, fetched in parallel now that the dispatcher runs.
    let fetches = options.secret_keys.iter().map(|name| {
        let secrets = secrets.clone();
        let name = name.clone();
        async move {
            secrets
                .get(&name, FetchMode::CacheThenRemote)
                .await
                .map_err(|e| BootstrapError::MissingSecret {
                    name: name.clone(),
                    reason: e.to_string(),
                })
        }
    });
    let secret_values = futures::future::try_join_all(fetches).await?;

    let user_state = state_builder(&init, secret_values);

    let (listen, listener) = resolve_listen(&init, &config, &negotiator).await?;

    control
        .announce(AnnounceBlob {
            listen: listen.clone(),
            endpoints: options.endpoints.clone(),
        })
        .await
        .map_err(|e| BootstrapError::AnnounceFailed(e.to_string()))?;

    let state = AppState::new(StateParts {
        module_id: init.module_id.clone(),
        orchestrator_api: init.orchestrator_api.clone(),
        config,
        secrets: secrets.clone(),
        user_state,
        router,
        messaging: messaging.clone(),
        handlers,
        http,
        http_requests,
        listener,
        negotiator,
        cancel: cancel.clone(),
    });

    info!(
        module_id = %init.module_id,
        listen = %listen,
        tcp = tcp.is_some(),
        ipc = ipc.is_some(),
        "module bootstrap complete"
    );

    let join = tokio::spawn(run_until_shutdown(
        cancel,
        loops,
        stdio_join,
        messaging,
        secrets,
    ));

    Ok((state, join))
}

async fn setup_tcp_channel(
    init: &InitBlob,
    options: &BootstrapOptions,
) -> Result<Option<Arc<TcpChannel>>, BootstrapError> {
    let Some(tcp_config) = &init.tcp_channel else {
        return Ok(None);
    };
    if !options.preferences.use_tcp {
        info!("TCP channel offered but disabled by preferences");
        return Ok(None);
    }

    let mut config =
        TcpConfig::new(tcp_config.address).with_reconnect(channel_reconnect_policy());
    match init.security_level {
        SecurityLevel::None => {}
        SecurityLevel::Token => {
            if let Some(token) = &init.auth_token {
                config = config.with_auth_token(token.clone());
            } else {
                warn!("token security level but no auth token in init blob");
            }
        }
        SecurityLevel::Mtls => match &options.tls {
            Some(tls) => config = config.with_tls(tls.clone()),
            None => {
                let error = "mutual TLS required but no TLS settings supplied".to_owned();
                if tcp_config.required {
                    return Err(BootstrapError::RequiredChannelFailed {
                        channel: ChannelType::Tcp,
                        error,
                    });
                }
                warn!("{error}; skipping TCP channel");
                return Ok(None);
            }
        },
    }
    if tcp_config.tls_enabled && config.tls.is_none() {
        if let Some(tls) = &options.tls {
            config = config.with_tls(tls.clone());
        }
    }

    let channel = Arc::new(TcpChannel::new(config));
    match channel.connect().await {
        Ok(()) => Ok(Some(channel)),
        Err(e) => {
            if tcp_config.required {
                Err(BootstrapError::RequiredChannelFailed {
                    channel: ChannelType::Tcp,
                    error: e.to_string(),
                })
            } else {
                warn!(error = %e, "optional TCP channel failed to connect");
                Ok(None)
            }
        }
    }
}

async fn setup_ipc_channel(
    init: &InitBlob,
    options: &BootstrapOptions,
) -> Result<Option<Arc<IpcChannel>>, BootstrapError> {
    let Some(ipc_config) = &init.ipc_channel else {
        return Ok(None);
    };
    if !options.preferences.use_ipc {
        info!("IPC channel offered but disabled by preferences");
        return Ok(None);
    }

    let channel = Arc::new(IpcChannel::new(
        IpcConfig::new(&ipc_config.socket_path).with_reconnect(channel_reconnect_policy()),
    ));
    match channel.connect().await {
        Ok(()) => Ok(Some(channel)),
        Err(e) => {
            if ipc_config.required {
                Err(BootstrapError::RequiredChannelFailed {
                    channel: ChannelType::Ipc,
                    error: e.to_string(),
                })
            } else {
                warn!(error = %e, "optional IPC channel failed to connect");
                Ok(None)
            }
        }
    }
}

/// Resolves the address to announce, binding a TCP listener when the
/// module serves HTTP directly.
///
/// A pre-allocated port (`PYWATT_PORT`, or a concrete port in the listen
/// address) bypasses negotiation; port 0 delegates the choice to the
/// OS. Negotiation runs only when the pre-allocated port cannot be
/// bound.
async fn resolve_listen(
    init: &InitBlob,
    config: &ModuleConfig,
    negotiator: &PortNegotiator,
) -> Result<(String, Option<TcpListener>), BootstrapError> {
    if config.is_ipc_only() {
        debug!("PYWATT_IPC_ONLY set, skipping HTTP binding");
        return Ok((init.listen.to_string(), None));
    }

    let addr = match &init.listen {
        ListenAddress::Unix(path) => return Ok((path.display().to_string(), None)),
        ListenAddress::Tcp(addr) => *addr,
    };

    let port = config.port.unwrap_or_else(|| addr.port());
    let bind_addr = SocketAddr::new(addr.ip(), port);

    match TcpListener::bind(bind_addr).await {
        Ok(listener) => {
            let local = listener
                .local_addr()
                .map_err(|e| BootstrapError::Internal(e.to_string()))?;
            Ok((local.to_string(), Some(listener)))
        }
        Err(e) => {
            warn!(address = %bind_addr, error = %e, "assigned address not bindable, negotiating a port");
            let negotiated = negotiator
                .negotiate(None)
                .await
                .map_err(|e| BootstrapError::PortNegotiation(e.to_string()))?;
            let bind_addr = SocketAddr::new(addr.ip(), negotiated.port);
            let listener = TcpListener::bind(bind_addr)
                .await
                .map_err(|e| BootstrapError::PortNegotiation(e.to_string()))?;
            let local = listener
                .local_addr()
                .map_err(|e| BootstrapError::Internal(e.to_string()))?;
            Ok((local.to_string(), Some(listener)))
        }
    }
}

/// Routes one inbound orchestrator message to the owning subsystem.
struct Dispatcher {
    secrets: SecretClient,
    ports: Arc<PortNegotiator>,
    http: HttpTunnel,
    messaging: Messaging,
    handlers: Arc<HandlerRegistry>,
    cancel: CancellationToken,
    stdio_out: mpsc::Sender<ModuleToOrchestrator>,
    format: EncodingFormat,
}

impl Dispatcher {
    async fn dispatch(&self, message: OrchestratorToModule, reply: &ReplyPath) {
        match message {
            OrchestratorToModule::Secret(delivery) => self.secrets.deliver(delivery).await,
            OrchestratorToModule::Rotated(notification) => {
                self.secrets.handle_rotation(notification).await;
            }
            OrchestratorToModule::Shutdown => {
                info!(channel = %reply.channel_type(), "shutdown requested by orchestrator");
                self.cancel.cancel();
            }
            OrchestratorToModule::PortResponse(response) => self.ports.deliver(response),
            OrchestratorToModule::RoutedModuleMessage {
                source_module_id,
                request_id,
                payload,
            } => {
                self.messaging
                    .dispatch_inbound(&self.handlers, source_module_id, request_id, payload, reply)
                    .await;
            }
            OrchestratorToModule::RoutedModuleResponse {
                request_id,
                result,
                error,
            } => self.messaging.deliver_response(request_id, result, error),
            OrchestratorToModule::HttpRequest(request) => {
                self.http.dispatch(request, reply.clone()).await;
            }
            OrchestratorToModule::Heartbeat => {
                if let Err(e) = reply.send(ModuleToOrchestrator::HeartbeatAck).await {
                    warn!(error = %e, "heartbeat ack failed");
                }
            }
        }
    }
}

async fn stdio_dispatch_loop(
    mut inbound: mpsc::Receiver<OrchestratorToModule>,
    dispatcher: Arc<Dispatcher>,
) {
    let reply = ReplyPath::stdio(dispatcher.stdio_out.clone(), dispatcher.format);
    loop {
        let message = tokio::select! {
            _ = dispatcher.cancel.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => {
                    // Stdin gone means the orchestrator is gone.
                    info!("control plane closed, beginning shutdown");
                    dispatcher.cancel.cancel();
                    break;
                }
            },
        };
        dispatcher.dispatch(message, &reply).await;
    }
    debug!("stdio dispatch loop finished");
}

async fn socket_loop(channel: Arc<dyn MessageChannel>, dispatcher: Arc<Dispatcher>) {
    let channel_type = channel.channel_type();
    let reply = ReplyPath::socket(channel.clone(), dispatcher.format);
    loop {
        let result = tokio::select! {
            _ = dispatcher.cancel.cancelled() => break,
            result = channel.receive() => result,
        };

        match result {
            Ok(frame) => match frame.decode::<OrchestratorToModule>() {
                Ok(message) => dispatcher.dispatch(message, &reply).await,
                Err(e) => {
                    warn!(channel = %channel_type, error = %e, "skipping undecodable frame");
                }
            },
            Err(ChannelError::PermanentlyClosed) => {
                warn!(channel = %channel_type, "channel permanently closed, loop terminating");
                break;
            }
            Err(e) if e.is_disconnection() => {
                debug!(channel = %channel_type, error = %e, "connection lost, reconnecting");
                if channel.connect().await.is_err() {
                    warn!(channel = %channel_type, "reconnect failed, loop terminating");
                    break;
                }
            }
            Err(e) => {
                warn!(channel = %channel_type, error = %e, "receive error, frame skipped");
            }
        }
    }
    debug!(channel = %channel_type, "socket loop finished");
}

async fn run_until_shutdown(
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    stdio_join: JoinHandle<()>,
    messaging: Messaging,
    secrets: SecretClient,
) {
    cancel.cancelled().await;
    info!("shutdown started");

    messaging.cancel_all("module shutting down");
    secrets.clear();

    let drain = async {
        for handle in loops {
            let _ = handle.await;
        }
        let _ = stdio_join.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "graceful shutdown deadline exceeded, abandoning background tasks"
        );
    }

    use std::io::Write;
    let _ = std::io::stderr().flush();
    info!("shutdown complete");
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(e) => {
                warn!(error = %e, "SIGINT handler unavailable");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            _ = sigint.recv() => info!("SIGINT received, shutting down"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    });
}
