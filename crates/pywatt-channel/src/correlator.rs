//! Request/response correlation for in-flight RPCs.
//!
//! Outbound correlatable messages carry a fresh request id; responses may
//! arrive on any channel and are matched by id alone. Every slot resolves
//! exactly once: with the response, with `Timeout`, or with `Cancelled`
//! when the process shuts down.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

/// Errors resolving a correlated request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// No response arrived within the slot's deadline.
    #[error("request timed out")]
    Timeout,

    /// The slot was resolved by `cancel_all`.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// A slot already exists for this request id. Programmer error: ids
    /// must be fresh per request.
    #[error("duplicate request id")]
    DuplicateId,
}

type Slot<R> = oneshot::Sender<Result<R, CorrelationError>>;

/// Matches responses to awaiting requests by request id.
///
/// Cloning is cheap; all clones share the pending map.
#[derive(Debug)]
pub struct RequestCorrelator<R> {
    pending: Arc<DashMap<Uuid, Slot<R>>>,
}

impl<R> Clone for RequestCorrelator<R> {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
        }
    }
}

impl<R: Send + 'static> Default for RequestCorrelator<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> RequestCorrelator<R> {
    /// Creates an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Registers a slot for `request_id` and returns the half that awaits
    /// the response.
    ///
    /// Registering an id that is already pending is a programmer error:
    /// it panics in debug builds and resolves to
    /// [`CorrelationError::DuplicateId`] in release builds.
    pub fn register(&self, request_id: Uuid) -> Result<ResponseSlot<R>, CorrelationError> {
        use dashmap::mapref::entry::Entry;

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(request_id) {
            Entry::Occupied(_) => {
                debug_assert!(false, "duplicate request id {request_id}");
                Err(CorrelationError::DuplicateId)
            }
            Entry::Vacant(entry) => {
                entry.insert(tx);
                trace!(request_id = %request_id, "registered response slot");
                Ok(ResponseSlot {
                    request_id,
                    rx,
                    pending: self.pending.clone(),
                })
            }
        }
    }

    /// Resolves the slot for `request_id` with a response.
    ///
    /// Returns `true` when a slot was waiting; late or unknown responses
    /// are dropped silently and return `false`.
    pub fn complete(&self, request_id: Uuid, response: R) -> bool {
        match self.pending.remove(&request_id) {
            Some((_, tx)) => {
                // A racing timeout may have dropped the receiver already.
                let delivered = tx.send(Ok(response)).is_ok();
                trace!(request_id = %request_id, delivered, "completed response slot");
                delivered
            }
            None => {
                debug!(request_id = %request_id, "dropping response with no awaiting slot");
                false
            }
        }
    }

    /// Resolves every pending slot with [`CorrelationError::Cancelled`].
    ///
    /// Used on shutdown and when a channel permanently closes.
    pub fn cancel_all(&self, reason: &str) {
        let ids: Vec<Uuid> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(CorrelationError::Cancelled(reason.to_owned())));
            }
        }
    }

    /// Number of requests currently awaiting responses.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// The awaiting half of a registered request.
pub struct ResponseSlot<R> {
    request_id: Uuid,
    rx: oneshot::Receiver<Result<R, CorrelationError>>,
    pending: Arc<DashMap<Uuid, Slot<R>>>,
}

impl<R> ResponseSlot<R> {
    /// The request id this slot awaits.
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Awaits the response, resolving [`CorrelationError::Timeout`] and
    /// removing the slot when the deadline passes.
    pub async fn wait(self, deadline: Duration) -> Result<R, CorrelationError> {
        match tokio::time::timeout(deadline, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CorrelationError::Cancelled(
                "correlator dropped".to_owned(),
            )),
            Err(_) => {
                self.pending.remove(&self.request_id);
                Err(CorrelationError::Timeout)
            }
        }
    }
}
