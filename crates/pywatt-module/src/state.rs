//! Shared application state handed to modules after bootstrap.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pywatt_channel::ChannelType;
use pywatt_secrets::SecretClient;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ModuleConfig;
use crate::http::{HttpMetricsSnapshot, HttpTunnel, InboundHttpRequest};
use crate::messaging::{HandlerRegistry, Messaging, MessagingError};
use crate::port::PortNegotiator;
use crate::router::{ChannelHealth, ChannelRouter};

pub(crate) struct StateParts<T> {
    pub module_id: String,
    pub orchestrator_api: String,
    pub config: ModuleConfig,
    pub secrets: SecretClient,
    pub user_state: T,
    pub router: Arc<ChannelRouter>,
    pub messaging: Messaging,
    pub handlers: Arc<HandlerRegistry>,
    pub http: HttpTunnel,
    pub http_requests: mpsc::Receiver<InboundHttpRequest>,
    pub listener: Option<TcpListener>,
    pub negotiator: Arc<PortNegotiator>,
    pub cancel: CancellationToken,
}

struct Inner<T> {
    module_id: String,
    orchestrator_api: String,
    config: ModuleConfig,
    secrets: SecretClient,
    user_state: T,
    router: Arc<ChannelRouter>,
    messaging: Messaging,
    handlers: Arc<HandlerRegistry>,
    http: HttpTunnel,
    http_requests: Mutex<Option<mpsc::Receiver<InboundHttpRequest>>>,
    listener: Mutex<Option<TcpListener>>,
    negotiator: Arc<PortNegotiator>,
    cancel: CancellationToken,
}

/// Handle to everything a running module needs: identity, secrets,
/// channels, messaging, the HTTP tunnel, and shutdown.
///
/// Cloning is cheap and shares the underlying state; `T` is the module's
/// own state built by the `state_builder` callback.
pub struct AppState<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> AppState<T> {
    pub(crate) fn new(parts: StateParts<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                module_id: parts.module_id,
                orchestrator_api: parts.orchestrator_api,
                config: parts.config,
                secrets: parts.secrets,
                user_state: parts.user_state,
                router: parts.router,
                messaging: parts.messaging,
                handlers: parts.handlers,
                http: parts.http,
                http_requests: Mutex::new(Some(parts.http_requests)),
                listener: Mutex::new(parts.listener),
                negotiator: parts.negotiator,
                cancel: parts.cancel,
            }),
        }
    }

    /// This module's identity, assigned by the orchestrator.
    #[must_use]
    pub fn module_id(&self) -> &str {
        &self.inner.module_id
    }

    /// The orchestrator API identifier from the handshake.
    #[must_use]
    pub fn orchestrator_api(&self) -> &str {
        &self.inner.orchestrator_api
    }

    /// The resolved runtime configuration.
    #[must_use]
    pub fn config(&self) -> &ModuleConfig {
        &self.inner.config
    }

    /// The secret client.
    #[must_use]
    pub fn secrets(&self) -> &SecretClient {
        &self.inner.secrets
    }

    /// The module's own state.
    #[must_use]
    pub fn user_state(&self) -> &T {
        &self.inner.user_state
    }

    /// Sends a typed request to a peer module and awaits its response.
    pub async fn send_request<Req, Res>(
        &self,
        target_module_id: &str,
        endpoint: &str,
        payload: &Req,
        timeout: Duration,
    ) -> Result<Res, MessagingError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        self.inner
            .messaging
            .send_request(target_module_id, endpoint, payload, timeout)
            .await
    }

    /// Sends a typed message to a peer module without awaiting a
    /// response, optionally pinning the channel.
    pub async fn send_message<Req: Serialize>(
        &self,
        target_module_id: &str,
        endpoint: &str,
        payload: &Req,
        channel: Option<ChannelType>,
    ) -> Result<(), MessagingError> {
        self.inner
            .messaging
            .send_message(target_module_id, endpoint, payload, channel)
            .await
    }

    /// Registers a handler for peer messages from `source_module_id`.
    pub fn register_handler<F, Fut>(&self, source_module_id: impl Into<String>, handler: F)
    where
        F: Fn(String, Uuid, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        self.inner.handlers.register(source_module_id, handler);
    }

    /// Sets the handler for peer messages with no source-specific
    /// handler.
    pub fn set_default_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Uuid, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        self.inner.handlers.set_default(handler);
    }

    /// Removes the handler for `source_module_id`.
    pub fn remove_handler(&self, source_module_id: &str) {
        self.inner.handlers.remove(source_module_id);
    }

    /// Channels currently configured.
    #[must_use]
    pub fn available_channels(&self) -> Vec<ChannelType> {
        self.inner.router.available_channels()
    }

    /// State and traffic counters per channel.
    pub async fn channel_health(&self) -> Vec<ChannelHealth> {
        self.inner.router.channel_health().await
    }

    /// HTTP tunnel counters.
    #[must_use]
    pub fn http_metrics(&self) -> HttpMetricsSnapshot {
        self.inner.http.metrics()
    }

    /// Takes the HTTP request queue. The first caller gets it; the
    /// router glue owns consumption from then on.
    #[must_use]
    pub fn take_http_requests(&self) -> Option<mpsc::Receiver<InboundHttpRequest>> {
        lock(&self.inner.http_requests).take()
    }

    /// Takes the TCP listener bound during bootstrap, when the module
    /// serves HTTP directly.
    #[must_use]
    pub fn take_listener(&self) -> Option<TcpListener> {
        lock(&self.inner.listener).take()
    }

    /// The port negotiator, for modules that bind a TCP port after
    /// bootstrap (e.g. when the orchestrator assigned a Unix listener).
    #[must_use]
    pub fn port_negotiator(&self) -> &PortNegotiator {
        &self.inner.negotiator
    }

    /// Token observed by every background task; cancelled on shutdown.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Begins graceful shutdown, as if the orchestrator sent `Shutdown`.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
