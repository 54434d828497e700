//! In-memory live broadcast hub.
//!
//! Listeners connect, register interest in topics, and receive every
//! notification published on those topics while they stay connected.
//! Nothing is persisted or replayed: a listener that connects after a
//! publish never sees it.
//!
//! Each listener owns a bounded channel. `publish` uses `try_send`, so a
//! slow or dead listener costs the publisher nothing and never affects the
//! other listeners.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod relay;

pub use relay::RelayClient;

/// Published after a record is created.
pub const RECORD_CREATED: &str = "record-created";
/// Published after a record is updated.
pub const RECORD_UPDATED: &str = "record-updated";
/// Published after a record is deleted.
pub const RECORD_DELETED: &str = "record-deleted";
/// Published directly by the publisher when wired to the hub.
pub const POST_CREATED: &str = "post-created";

/// Subscribing to this topic matches every topic.
pub const ALL_TOPICS: &str = "#";

/// Default per-listener buffer.
pub const DEFAULT_LISTENER_BUFFER: usize = 64;

/// Broadcast endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Address the HTTP/WebSocket surface binds to.
    pub bind: String,
    /// Notifications buffered per listener before new ones are dropped.
    pub listener_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:4002".to_string(),
            listener_buffer: DEFAULT_LISTENER_BUFFER,
        }
    }
}

/// A topic plus JSON payload, as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// What happened to one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Listeners the notification was handed to.
    pub delivered: usize,
    /// Listeners whose buffer was full. They miss this notification.
    pub dropped: usize,
    /// Listeners found closed and deregistered during the call.
    pub disconnected: usize,
}

fn topic_matches(subscribed: &str, topic: &str) -> bool {
    subscribed == ALL_TOPICS || subscribed == topic
}

struct ListenerSlot {
    topics: HashSet<String>,
    sender: mpsc::Sender<Arc<Notification>>,
}

impl ListenerSlot {
    fn wants(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| topic_matches(t, topic))
    }
}

#[derive(Default)]
struct HubInner {
    listeners: HashMap<Uuid, ListenerSlot>,
    closed: bool,
}

fn lock(inner: &Mutex<HubInner>) -> MutexGuard<'_, HubInner> {
    inner.lock().unwrap_or_else(|poisoned| {
        warn!("Broadcast hub mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Process-wide broadcast hub. Cheap to clone; clones share listeners.
///
/// Construct once at startup and hand it to every publisher and
/// connection handler. Call [`BroadcastHub::shutdown`] on drain.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<Mutex<HubInner>>,
    buffer: usize,
}

impl BroadcastHub {
    pub fn new(config: &BroadcastConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner::default())),
            buffer: config.listener_buffer.max(1),
        }
    }

    /// Register a new listener with no topics.
    ///
    /// After shutdown the returned listener is already ended.
    pub fn connect(&self) -> Listener {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.buffer);

        let mut inner = lock(&self.inner);
        if inner.closed {
            debug!(listener = %id, "Hub is shut down, listener starts closed");
        } else {
            inner.listeners.insert(
                id,
                ListenerSlot {
                    topics: HashSet::new(),
                    sender,
                },
            );
            debug!(listener = %id, listeners = inner.listeners.len(), "Listener connected");
        }

        Listener {
            id,
            hub: Arc::downgrade(&self.inner),
            receiver,
        }
    }

    /// Connect and subscribe to one topic.
    pub fn subscribe(&self, topic: &str) -> Listener {
        let listener = self.connect();
        listener.subscribe(topic);
        listener
    }

    /// Deliver `payload` to every listener subscribed to `topic`.
    ///
    /// Never blocks and never fails. Closed listeners are deregistered;
    /// listeners with a full buffer miss this notification.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> PublishReport {
        let notification = Arc::new(Notification {
            topic: topic.to_string(),
            payload,
        });
        let mut report = PublishReport::default();
        let mut gone = Vec::new();

        let mut inner = lock(&self.inner);
        for (id, slot) in inner.listeners.iter().filter(|(_, s)| s.wants(topic)) {
            match slot.sender.try_send(Arc::clone(&notification)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(listener = %id, topic, "Listener buffer full, dropping notification");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            inner.listeners.remove(&id);
            report.disconnected += 1;
            debug!(listener = %id, "Deregistered closed listener during publish");
        }
        drop(inner);

        debug!(
            topic,
            delivered = report.delivered,
            dropped = report.dropped,
            disconnected = report.disconnected,
            "Published notification"
        );
        report
    }

    /// Remove a listener. Idempotent.
    pub fn disconnect(&self, id: Uuid) {
        remove_listener(&self.inner, id);
    }

    /// Number of connected listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Number of connected listeners that would receive `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.inner)
            .listeners
            .values()
            .filter(|s| s.wants(topic))
            .count()
    }

    /// Drop every listener and refuse new ones. Listener streams end.
    pub fn shutdown(&self) {
        let mut inner = lock(&self.inner);
        let count = inner.listeners.len();
        inner.listeners.clear();
        inner.closed = true;
        info!(listeners = count, "Broadcast hub shut down");
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(&BroadcastConfig::default())
    }
}

fn remove_listener(inner: &Mutex<HubInner>, id: Uuid) {
    if lock(inner).listeners.remove(&id).is_some() {
        debug!(listener = %id, "Listener disconnected");
    }
}

/// One live connection's view of the hub.
///
/// Yields notifications for its topics until closed, dropped, or the hub
/// shuts down. Dropping the listener deregisters it.
pub struct Listener {
    id: Uuid,
    hub: Weak<Mutex<HubInner>>,
    receiver: mpsc::Receiver<Arc<Notification>>,
}

impl Listener {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Add a topic. Returns false if the listener is no longer registered.
    pub fn subscribe(&self, topic: &str) -> bool {
        self.with_slot(|slot| {
            slot.topics.insert(topic.to_string());
        })
    }

    /// Remove a topic. Returns false if the listener is no longer registered.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.with_slot(|slot| {
            slot.topics.remove(topic);
        })
    }

    /// Current topic set.
    pub fn topics(&self) -> HashSet<String> {
        let mut topics = HashSet::new();
        self.with_slot(|slot| topics = slot.topics.clone());
        topics
    }

    fn with_slot(&self, f: impl FnOnce(&mut ListenerSlot)) -> bool {
        let Some(hub) = self.hub.upgrade() else {
            return false;
        };
        let mut inner = lock(&hub);
        match inner.listeners.get_mut(&self.id) {
            Some(slot) => {
                f(slot);
                true
            }
            None => false,
        }
    }

    /// Next notification, or `None` once the listener is closed.
    pub async fn recv(&mut self) -> Option<Arc<Notification>> {
        self.receiver.recv().await
    }

    /// Close the connection: deregister now and stop receiving.
    pub fn close(&mut self) {
        self.receiver.close();
        if let Some(hub) = self.hub.upgrade() {
            remove_listener(&hub, self.id);
        }
    }
}

impl Stream for Listener {
    type Item = Arc<Notification>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            remove_listener(&hub, self.id);
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish()
    }
}
