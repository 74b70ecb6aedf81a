//! Inter-module messaging through the orchestrator.
//!
//! Outbound: [`Messaging::send_request`] serialises a typed payload,
//! registers a correlator slot, ships an `InternalRequest` on the best
//! available channel, and awaits the routed response. Inbound:
//! `RoutedModuleMessage`s dispatch to a handler registered for the source
//! module (or the default handler); the handler's result is wrapped in a
//! `RoutedModuleResponse` and sent back on the arrival channel.
//!
//! Handlers for one source run in arrival order; a handler that wants
//! concurrency spawns its own tasks. Delivery is at most once; retries
//! are the orchestrator's business.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use pywatt_channel::{ChannelType, CorrelationError, RequestCorrelator};
use pywatt_proto::ModuleToOrchestrator;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::router::{ChannelRouter, ReplyPath};

/// Error strings from the orchestrator that mean the target module does
/// not exist.
const TARGET_NOT_FOUND_MARKER: &str = "target_not_found";

/// Errors exchanging messages with peer modules.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// The orchestrator does not know the target module.
    #[error("target module not found: {0}")]
    TargetNotFound(String),

    /// No response within the caller's deadline.
    #[error("peer request timed out")]
    Timeout,

    /// The request payload could not be serialised.
    #[error("request serialisation failed: {0}")]
    Serialization(String),

    /// The response payload could not be deserialised.
    #[error("response deserialisation failed: {0}")]
    Deserialization(String),

    /// Every usable channel is gone.
    #[error("transport closed")]
    TransportClosed,

    /// The peer's handler reported an error, carried verbatim.
    #[error("application error: {0}")]
    Application(String),
}

/// A handler for messages from peer modules.
///
/// Receives `(source_module_id, request_id, payload)` and returns the
/// response payload or an error string carried back verbatim.
pub type ModuleMessageHandler = Arc<
    dyn Fn(
            String,
            Uuid,
            serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>
        + Send
        + Sync,
>;

/// Registry of peer-message handlers keyed by source module id.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, ModuleMessageHandler>>,
    default: RwLock<Option<ModuleMessageHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for messages from `source_module_id`,
    /// replacing any previous one.
    pub fn register<F, Fut>(&self, source_module_id: impl Into<String>, handler: F)
    where
        F: Fn(String, Uuid, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        write_lock(&self.handlers).insert(source_module_id.into(), box_handler(handler));
    }

    /// Sets the handler used when no source-specific handler matches.
    pub fn set_default<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Uuid, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        *write_lock(&self.default) = Some(box_handler(handler));
    }

    /// Removes the handler for `source_module_id`.
    pub fn remove(&self, source_module_id: &str) {
        write_lock(&self.handlers).remove(source_module_id);
    }

    fn resolve(&self, source_module_id: &str) -> Option<ModuleMessageHandler> {
        if let Some(handler) = read_lock(&self.handlers).get(source_module_id) {
            return Some(handler.clone());
        }
        read_lock(&self.default).clone()
    }
}

fn box_handler<F, Fut>(handler: F) -> ModuleMessageHandler
where
    F: Fn(String, Uuid, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
{
    Arc::new(move |source, request_id, payload| {
        Box::pin(handler(source, request_id, payload))
            as Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>
    })
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Typed request/response messaging with peer modules.
#[derive(Clone)]
pub struct Messaging {
    module_id: String,
    correlator: RequestCorrelator<Result<serde_json::Value, String>>,
    router: Arc<ChannelRouter>,
}

impl Messaging {
    /// Creates the messaging client for this module.
    #[must_use]
    pub fn new(module_id: impl Into<String>, router: Arc<ChannelRouter>) -> Self {
        Self {
            module_id: module_id.into(),
            correlator: RequestCorrelator::new(),
            router,
        }
    }

    /// Sends a typed request to a peer module and awaits its response.
    pub async fn send_request<T, R>(
        &self,
        target_module_id: &str,
        endpoint: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, MessagingError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let slot = self.register_fresh_slot();
        let request_id = slot.request_id();

        self.send_internal_request(request_id, target_module_id, endpoint, payload, None)
            .await?;

        debug!(
            target = %target_module_id,
            endpoint = %endpoint,
            request_id = %request_id,
            "peer request sent"
        );

        match slot.wait(timeout).await {
            Ok(Ok(value)) => {
                serde_json::from_value(value).map_err(|e| MessagingError::Deserialization(e.to_string()))
            }
            Ok(Err(error)) => {
                if error.contains(TARGET_NOT_FOUND_MARKER) {
                    Err(MessagingError::TargetNotFound(target_module_id.to_owned()))
                } else {
                    Err(MessagingError::Application(error))
                }
            }
            Err(CorrelationError::Timeout) => Err(MessagingError::Timeout),
            Err(_) => Err(MessagingError::TransportClosed),
        }
    }

    /// Sends a typed message to a peer module without awaiting a response.
    pub async fn send_message<T: Serialize>(
        &self,
        target_module_id: &str,
        endpoint: &str,
        payload: &T,
        channel: Option<ChannelType>,
    ) -> Result<(), MessagingError> {
        self.send_internal_request(Uuid::new_v4(), target_module_id, endpoint, payload, channel)
            .await
    }

    /// Resolves the slot awaiting `request_id`. Late responses are
    /// dropped silently.
    pub(crate) fn deliver_response(
        &self,
        request_id: Uuid,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let outcome = match (result, error) {
            (_, Some(error)) => Err(error),
            (Some(value), None) => Ok(value),
            (None, None) => Ok(serde_json::Value::Null),
        };
        self.correlator.complete(request_id, outcome);
    }

    /// Handles an inbound routed message and answers on the arrival
    /// channel. Awaited inline so one source's messages keep their order.
    pub(crate) async fn dispatch_inbound(
        &self,
        registry: &HandlerRegistry,
        source_module_id: String,
        request_id: Uuid,
        payload: serde_json::Value,
        reply: &ReplyPath,
    ) {
        let Some(handler) = registry.resolve(&source_module_id) else {
            info!(
                source = %source_module_id,
                request_id = %request_id,
                "no handler registered for peer messages, discarding"
            );
            return;
        };

        let result = handler(source_module_id.clone(), request_id, payload).await;
        let (result, error) = match result {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };

        let response = ModuleToOrchestrator::RoutedModuleResponse {
            request_id,
            result,
            error,
        };
        if let Err(e) = reply.send(response).await {
            warn!(
                source = %source_module_id,
                request_id = %request_id,
                error = %e,
                "routed response could not be sent"
            );
        }
    }

    /// Requests awaiting responses.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Resolves every pending request with `TransportClosed`; used on
    /// shutdown.
    pub(crate) fn cancel_all(&self, reason: &str) {
        self.correlator.cancel_all(reason);
    }

    fn register_fresh_slot(
        &self,
    ) -> pywatt_channel::ResponseSlot<Result<serde_json::Value, String>> {
        // v4 collisions are not a practical concern, but the correlator
        // insists on fresh ids.
        loop {
            if let Ok(slot) = self.correlator.register(Uuid::new_v4()) {
                return slot;
            }
        }
    }

    async fn send_internal_request<T: Serialize>(
        &self,
        request_id: Uuid,
        target_module_id: &str,
        endpoint: &str,
        payload: &T,
        channel: Option<ChannelType>,
    ) -> Result<(), MessagingError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| MessagingError::Serialization(e.to_string()))?;

        let message = ModuleToOrchestrator::InternalRequest {
            request_id,
            target_module_id: target_module_id.to_owned(),
            endpoint: endpoint.to_owned(),
            payload,
        };

        self.router
            .send_control(message, channel)
            .await
            .map_err(|_| MessagingError::TransportClosed)
    }

    /// This module's identity.
    #[must_use]
    pub fn module_id(&self) -> &str {
        &self.module_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pywatt_proto::EncodingFormat;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[derive(Serialize)]
    struct Ping;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Pong {
        pong: bool,
    }

    fn messaging() -> (Messaging, mpsc::Receiver<ModuleToOrchestrator>) {
        let (tx, rx) = mpsc::channel(16);
        let router = Arc::new(ChannelRouter::stdio_only(tx, EncodingFormat::Json));
        (Messaging::new("m1", router), rx)
    }

    #[tokio::test]
    async fn correlated_request_resolves_with_response() {
        let (messaging, mut outbound) = messaging();

        let requester = {
            let messaging = messaging.clone();
            tokio::spawn(async move {
                messaging
                    .send_request::<_, Pong>("peer", "/ping", &Ping, Duration::from_secs(1))
                    .await
            })
        };

        let request_id = match outbound.recv().await.unwrap() {
            ModuleToOrchestrator::InternalRequest {
                request_id,
                target_module_id,
                endpoint,
                ..
            } => {
                assert_eq!(target_module_id, "peer");
                assert_eq!(endpoint, "/ping");
                request_id
            }
            other => panic!("expected InternalRequest, got {other:?}"),
        };

        messaging.deliver_response(request_id, Some(json!({"pong": true})), None);

        let pong = requester.await.unwrap().unwrap();
        assert_eq!(pong, Pong { pong: true });

        // A late duplicate is dropped silently.
        messaging.deliver_response(request_id, Some(json!({"pong": false})), None);
    }

    #[tokio::test]
    async fn request_times_out_without_response() {
        let (messaging, _outbound) = messaging();
        let result = messaging
            .send_request::<_, Pong>("peer", "/ping", &Ping, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(MessagingError::Timeout)));
        assert_eq!(messaging.pending_count(), 0);
    }

    #[tokio::test]
    async fn application_error_carried_verbatim() {
        let (messaging, mut outbound) = messaging();

        let requester = {
            let messaging = messaging.clone();
            tokio::spawn(async move {
                messaging
                    .send_request::<_, Pong>("peer", "/ping", &Ping, Duration::from_secs(1))
                    .await
            })
        };

        let request_id = match outbound.recv().await.unwrap() {
            ModuleToOrchestrator::InternalRequest { request_id, .. } => request_id,
            other => panic!("expected InternalRequest, got {other:?}"),
        };
        messaging.deliver_response(request_id, None, Some("boom in handler".to_owned()));

        match requester.await.unwrap() {
            Err(MessagingError::Application(error)) => assert_eq!(error, "boom in handler"),
            other => panic!("expected Application error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_target_maps_to_target_not_found() {
        let (messaging, mut outbound) = messaging();

        let requester = {
            let messaging = messaging.clone();
            tokio::spawn(async move {
                messaging
                    .send_request::<_, Pong>("ghost", "/ping", &Ping, Duration::from_secs(1))
                    .await
            })
        };

        let request_id = match outbound.recv().await.unwrap() {
            ModuleToOrchestrator::InternalRequest { request_id, .. } => request_id,
            other => panic!("expected InternalRequest, got {other:?}"),
        };
        messaging.deliver_response(request_id, None, Some("target_not_found: ghost".to_owned()));

        assert!(matches!(
            requester.await.unwrap(),
            Err(MessagingError::TargetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn inbound_message_dispatches_to_source_handler() {
        let (messaging, _outbound) = messaging();
        let registry = HandlerRegistry::new();
        registry.register("peer", |source, _request_id, payload| async move {
            assert_eq!(source, "peer");
            Ok(json!({"echo": payload}))
        });

        let (reply_tx, mut reply_rx) = mpsc::channel(8);
        let reply = ReplyPath::stdio(reply_tx, EncodingFormat::Json);

        let request_id = Uuid::new_v4();
        messaging
            .dispatch_inbound(&registry, "peer".to_owned(), request_id, json!(7), &reply)
            .await;

        match reply_rx.recv().await.unwrap() {
            ModuleToOrchestrator::RoutedModuleResponse {
                request_id: echoed,
                result,
                error,
            } => {
                assert_eq!(echoed, request_id);
                assert_eq!(result, Some(json!({"echo": 7})));
                assert!(error.is_none());
            }
            other => panic!("expected RoutedModuleResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_error_becomes_error_response() {
        let (messaging, _outbound) = messaging();
        let registry = HandlerRegistry::new();
        registry.set_default(|_source, _request_id, _payload| async move {
            Err("unsupported endpoint".to_owned())
        });

        let (reply_tx, mut reply_rx) = mpsc::channel(8);
        let reply = ReplyPath::stdio(reply_tx, EncodingFormat::Json);

        messaging
            .dispatch_inbound(
                &registry,
                "anyone".to_owned(),
                Uuid::new_v4(),
                json!({}),
                &reply,
            )
            .await;

        match reply_rx.recv().await.unwrap() {
            ModuleToOrchestrator::RoutedModuleResponse { result, error, .. } => {
                assert!(result.is_none());
                assert_eq!(error.as_deref(), Some("unsupported endpoint"));
            }
            other => panic!("expected RoutedModuleResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unhandled_source_is_discarded() {
        let (messaging, _outbound) = messaging();
        let registry = HandlerRegistry::new();

        let (reply_tx, mut reply_rx) = mpsc::channel(8);
        let reply = ReplyPath::stdio(reply_tx, EncodingFormat::Json);

        messaging
            .dispatch_inbound(
                &registry,
                "stranger".to_owned(),
                Uuid::new_v4(),
                json!({}),
                &reply,
            )
            .await;

        assert!(reply_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_all_resolves_pending_as_transport_closed() {
        let (messaging, mut outbound) = messaging();

        let requester = {
            let messaging = messaging.clone();
            tokio::spawn(async move {
                messaging
                    .send_request::<_, Pong>("peer", "/ping", &Ping, Duration::from_secs(5))
                    .await
            })
        };

        // Wait for the request to be in flight, then cancel.
        let _ = outbound.recv().await.unwrap();
        messaging.cancel_all("shutdown");

        assert!(matches!(
            requester.await.unwrap(),
            Err(MessagingError::TransportClosed)
        ));
    }
}
