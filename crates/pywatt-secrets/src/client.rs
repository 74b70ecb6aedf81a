//! The secret client: request, cache, and refresh secrets.
//!
//! Requests travel to the orchestrator as `GetSecret` control messages on
//! the outbound queue; deliveries come back through [`SecretClient::deliver`],
//! called by the stdio dispatcher. Concurrent fetches for the same name
//! share one in-flight request. Every delivered value is registered for
//! log redaction before any caller sees it.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pywatt_proto::{
    GetSecretRequest, ModuleToOrchestrator, RotatedNotification, RotationAck, RotationStatus,
    SecretDelivery,
};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::SecretError;
use crate::redact;
use crate::types::SecretValue;

/// Default deadline for a remote secret fetch.
const REMOTE_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the rotation event fan-out.
const ROTATION_EVENT_CAPACITY: usize = 256;

/// How a `get` resolves the secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Return the cached value when present, otherwise ask the
    /// orchestrator.
    CacheThenRemote,
    /// Always ask the orchestrator, replacing the cached value.
    ForceRemote,
    /// Never send a request; absent means `NotFound`.
    CacheOnly,
}

/// A batch of rotated secret names, published to subscribers in the order
/// the orchestrator emitted them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationEvent {
    /// The rotated secret names.
    pub keys: Vec<String>,
    /// Identifier the acknowledgement echoes.
    pub rotation_id: String,
}

struct CacheEntry {
    value: SecretValue,
    #[allow(dead_code)]
    rotation_id: Option<String>,
    #[allow(dead_code)]
    fetched_at: DateTime<Utc>,
}

struct Inner {
    cache: DashMap<String, CacheEntry>,
    in_flight: Mutex<HashMap<String, Vec<oneshot::Sender<SecretValue>>>>,
    outbound: mpsc::Sender<ModuleToOrchestrator>,
    rotations: broadcast::Sender<RotationEvent>,
    remote_timeout: Duration,
}

/// Handle to the module's secret store. Cloning is cheap; all clones share
/// the cache and subscriptions.
#[derive(Clone)]
pub struct SecretClient {
    inner: Arc<Inner>,
}

impl SecretClient {
    /// Creates a client sending requests on `outbound`.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<ModuleToOrchestrator>) -> Self {
        Self::with_timeout(outbound, REMOTE_FETCH_TIMEOUT)
    }

    /// Creates a client with a custom remote-fetch deadline.
    #[must_use]
    pub fn with_timeout(
        outbound: mpsc::Sender<ModuleToOrchestrator>,
        remote_timeout: Duration,
    ) -> Self {
        let (rotations, _) = broadcast::channel(ROTATION_EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                cache: DashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
                outbound,
                rotations,
                remote_timeout,
            }),
        }
    }

    /// Fetches a secret according to `mode`.
    pub async fn get(&self, name: &str, mode: FetchMode) -> Result<SecretValue, SecretError> {
        match mode {
            FetchMode::CacheOnly => self
                .cached(name)
                .ok_or_else(|| SecretError::NotFound(name.to_owned())),
            FetchMode::CacheThenRemote => {
                if let Some(value) = self.cached(name) {
                    return Ok(value);
                }
                self.fetch_remote(name, true).await
            }
            FetchMode::ForceRemote => self.fetch_remote(name, false).await,
        }
    }

    /// Fetches a secret and parses its string form into `T`.
    pub async fn get_typed<T>(&self, name: &str, mode: FetchMode) -> Result<T, SecretError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = self.get(name, mode).await?;
        value.parse(name)
    }

    /// Returns the cached value, if any.
    #[must_use]
    pub fn cached(&self, name: &str) -> Option<SecretValue> {
        self.inner.cache.get(name).map(|entry| entry.value.clone())
    }

    /// Drops the cached entry for `name`, zeroising the stored value.
    pub fn invalidate(&self, name: &str) {
        self.inner.cache.remove(name);
    }

    /// Subscribes to rotation events.
    ///
    /// Events are observed in the order the orchestrator emitted them.
    #[must_use]
    pub fn subscribe_rotations(&self) -> broadcast::Receiver<RotationEvent> {
        self.inner.rotations.subscribe()
    }

    /// Sends a rotation acknowledgement to the orchestrator.
    pub async fn acknowledge_rotation(&self, rotation_id: &str, status: RotationStatus) {
        let ack = ModuleToOrchestrator::RotationAck(RotationAck {
            rotation_id: rotation_id.to_owned(),
            status,
        });
        if self.inner.outbound.send(ack).await.is_err() {
            warn!(rotation_id = %rotation_id, "control plane closed, rotation ack dropped");
        }
    }

    /// Delivers a secret value arriving from the orchestrator.
    ///
    /// Registers the value for redaction before caching it or resolving
    /// any waiting fetch, and unregisters a replaced predecessor.
    pub async fn deliver(&self, delivery: SecretDelivery) {
        let SecretDelivery {
            name,
            value,
            rotation_id,
        } = delivery;

        redact::register(&value);
        let secret = SecretValue::new(value);

        let entry = CacheEntry {
            value: secret.clone(),
            rotation_id,
            fetched_at: Utc::now(),
        };
        if let Some(previous) = self.inner.cache.insert(name.clone(), entry) {
            if previous.value != secret {
                redact::unregister(previous.value.expose());
            }
        }

        let waiters = self.inner.in_flight.lock().await.remove(&name);
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(secret.clone());
            }
        }

        debug!(secret = %name, "secret delivered");
    }

    /// Handles a rotation notification: invalidates the listed keys,
    /// publishes one event to subscribers, and acknowledges immediately.
    pub async fn handle_rotation(&self, notification: RotatedNotification) {
        let RotatedNotification { keys, rotation_id } = notification;

        for key in &keys {
            self.inner.cache.remove(key);
        }

        info!(
            rotation_id = %rotation_id,
            keys = ?keys,
            "secret rotation received, cache invalidated"
        );

        let _ = self.inner.rotations.send(RotationEvent {
            keys,
            rotation_id: rotation_id.clone(),
        });

        self.acknowledge_rotation(&rotation_id, RotationStatus::Ok)
            .await;
    }

    /// Drops every cached value, zeroising them. Called on shutdown.
    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    async fn fetch_remote(
        &self,
        name: &str,
        serve_cached: bool,
    ) -> Result<SecretValue, SecretError> {
        let (rx, leader) = {
            let mut in_flight = self.inner.in_flight.lock().await;
            // A delivery may have landed between the caller's cache miss
            // and this lock.
            if serve_cached {
                if let Some(value) = self.cached(name) {
                    return Ok(value);
                }
            }
            let waiters = in_flight.entry(name.to_owned()).or_default();
            let leader = waiters.is_empty();
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            (rx, leader)
        };

        if leader {
            let request = ModuleToOrchestrator::GetSecret(GetSecretRequest {
                name: name.to_owned(),
            });
            if self.inner.outbound.send(request).await.is_err() {
                self.inner.in_flight.lock().await.remove(name);
                return Err(SecretError::Transport("control plane closed".to_owned()));
            }
        }

        match tokio::time::timeout(self.inner.remote_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(SecretError::Transport("secret client closed".to_owned())),
            Err(_) => {
                self.inner.in_flight.lock().await.remove(name);
                Err(SecretError::Timeout(name.to_owned()))
            }
        }
    }
}

impl std::fmt::Debug for SecretClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretClient")
            .field("cached", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}
