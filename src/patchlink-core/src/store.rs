use crate::ids::{RequestId, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Buffered notifications per subscription before the producer backs off.
const EVENT_BUFFER: usize = 16;

/// Full set of children under a session subtree as delivered by one store
/// notification. Entries iterate in key order; no delivery order beyond
/// that is guaranteed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    entries: BTreeMap<RequestId, String>,
}

impl RequestSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: RequestId, device_name: impl Into<String>) {
        self.entries.insert(request, device_name.into());
    }

    pub fn get(&self, request: &RequestId) -> Option<&str> {
        self.entries.get(request).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RequestId, &str)> {
        self.entries.iter().map(|(id, name)| (id, name.as_str()))
    }
}

impl FromIterator<(RequestId, String)> for RequestSnapshot {
    fn from_iter<I: IntoIterator<Item = (RequestId, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Diagnostic payload written to the fixed remote probe path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub timestamp: f64,
    pub test: String,
}

impl ProbeRecord {
    pub fn now() -> Self {
        Self {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            test: "connection".into(),
        }
    }
}

/// Common categories of store failures surfaced to the relay.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("network error: {message}")]
    Network { message: String },
    #[error("authentication error: {message}")]
    Authentication { message: String },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error("{message}")]
    Other { message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Notifications delivered on a live subscription.
#[derive(Debug)]
pub enum StoreEvent {
    /// Full child snapshot after a remote change.
    Snapshot(RequestSnapshot),
    /// Subscription-level failure. The handle stays attached but delivers
    /// nothing further until the subscription is re-established.
    Lost(StoreError),
}

/// Live connection to a session subtree.
///
/// At most one is active per relay and the relay owns it exclusively.
/// Dropping the handle aborts the producer task, so cancellation is
/// synchronous from the caller's perspective.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<StoreEvent>,
    producer: JoinHandle<()>,
    finished: bool,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<StoreEvent>, producer: JoinHandle<()>) -> Self {
        Self {
            events,
            producer,
            finished: false,
        }
    }

    /// Bounded event channel sized for store implementations.
    pub fn channel() -> (mpsc::Sender<StoreEvent>, mpsc::Receiver<StoreEvent>) {
        mpsc::channel(EVENT_BUFFER)
    }

    /// Next notification. Yields `None` exactly once when the producer is
    /// gone, then pends forever; callers select against other work.
    pub async fn next_event(&mut self) -> Option<StoreEvent> {
        if self.finished {
            return std::future::pending().await;
        }
        match self.events.recv().await {
            Some(event) => Some(event),
            None => {
                self.finished = true;
                None
            }
        }
    }

    pub fn cancel(self) {
        // Drop aborts the producer.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

/// Path-addressable remote store holding per-session device requests.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Stable store identifier (e.g., "firebase").
    fn id(&self) -> &str;

    /// Open a change subscription on the session's subtree. Every remote
    /// change MUST deliver a full child snapshot.
    async fn subscribe(&self, session: &SessionId) -> StoreResult<Subscription>;

    /// Delete one consumed request entry. Best-effort; callers treat
    /// failure as log-and-abandon.
    async fn delete_request(&self, session: &SessionId, request: &RequestId) -> StoreResult<()>;

    /// Write a diagnostic probe to the fixed probe path.
    async fn write_probe(&self, record: &ProbeRecord) -> StoreResult<()>;
}

/// Contract test expectations for request stores.
pub struct StoreContractSpec<'a, S: RequestStore> {
    pub store: &'a S,
    pub session: SessionId,
    /// Entries the backing fixture delivers on its first snapshot.
    pub expected: Vec<(RequestId, String)>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreContractError {
    #[error("no expected entries supplied to contract")]
    NoEntries,
    #[error("probe write failed: {0}")]
    ProbeFailure(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailure(String),
    #[error("subscription closed before a snapshot arrived")]
    NoSnapshot,
    #[error("subscription reported loss: {0}")]
    SubscriptionLost(String),
    #[error("snapshot missing entry {0}")]
    MissingEntry(String),
    #[error("delete failed for {0}")]
    DeleteFailure(String),
}

/// Run the shared store contract suite against an implementation: probe
/// write, subscribe until a populated snapshot arrives, verify the expected
/// entries, delete each of them.
pub async fn run_store_contract<S: RequestStore>(
    spec: StoreContractSpec<'_, S>,
) -> Result<(), StoreContractError> {
    if spec.expected.is_empty() {
        return Err(StoreContractError::NoEntries);
    }

    spec.store
        .write_probe(&ProbeRecord::now())
        .await
        .map_err(|e| StoreContractError::ProbeFailure(e.to_string()))?;

    let mut subscription = spec
        .store
        .subscribe(&spec.session)
        .await
        .map_err(|e| StoreContractError::SubscribeFailure(e.to_string()))?;

    let snapshot = loop {
        match subscription.next_event().await {
            Some(StoreEvent::Snapshot(snapshot)) if !snapshot.is_empty() => break snapshot,
            Some(StoreEvent::Snapshot(_)) => continue,
            Some(StoreEvent::Lost(error)) => {
                return Err(StoreContractError::SubscriptionLost(error.to_string()))
            }
            None => return Err(StoreContractError::NoSnapshot),
        }
    };

    for (request, device_name) in &spec.expected {
        match snapshot.get(request) {
            Some(found) if found == device_name => {}
            _ => return Err(StoreContractError::MissingEntry(request.to_string())),
        }
    }

    for (request, _) in &spec.expected {
        spec.store
            .delete_request(&spec.session, request)
            .await
            .map_err(|_| StoreContractError::DeleteFailure(request.to_string()))?;
    }

    Ok(())
}
