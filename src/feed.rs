//! Shared change feed listeners.
//!
//! Each streamed cache entry has a per-stream transport event on which the
//! server pushes change payloads. The registry keeps exactly one transport
//! listener per stream id, refcounted across subscribers: the listener is
//! registered when the first subscriber appears and removed when the last
//! one goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::lock::mutex_lock;
use crate::protocol::ChangePayload;
use crate::transport::{EventHandler, Transport};

const SOURCE: &str = "feed";

struct ListenerState {
    sender: broadcast::Sender<ChangePayload>,
    subscribers: usize,
}

/// Refcounted table of per-stream change feed listeners.
pub struct ChangeFeedRegistry {
    transport: Arc<dyn Transport>,
    buffer: usize,
    listeners: Mutex<HashMap<Uuid, ListenerState>>,
}

impl ChangeFeedRegistry {
    pub fn new(transport: Arc<dyn Transport>, buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            transport,
            buffer: buffer.max(1),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to the change feed for one stream id. The transport
    /// listener is attached lazily on the first subscriber.
    pub fn subscribe(self: &Arc<Self>, stream_id: Uuid) -> ChangeFeedSubscription {
        let receiver = {
            let mut listeners = mutex_lock(&self.listeners, SOURCE, "subscribe");
            let state = listeners.entry(stream_id).or_insert_with(|| {
                let (sender, _) = broadcast::channel(self.buffer);
                self.attach(stream_id, sender.clone());
                ListenerState {
                    sender,
                    subscribers: 0,
                }
            });
            state.subscribers += 1;
            state.sender.subscribe()
        };
        ChangeFeedSubscription {
            registry: Arc::clone(self),
            stream_id,
            receiver: Some(receiver),
        }
    }

    fn attach(&self, stream_id: Uuid, sender: broadcast::Sender<ChangePayload>) {
        debug!(%stream_id, "attaching change feed listener");
        let handler: EventHandler = Arc::new(move |payload| {
            counter!("rivo_change_event_total").increment(1);
            match serde_json::from_value::<ChangePayload>(payload) {
                Ok(payload) => {
                    let _ = sender.send(payload);
                }
                Err(err) => {
                    warn!(%stream_id, %err, "malformed change payload; dropped");
                }
            }
        });
        self.transport.on(&stream_id.to_string(), handler);
    }

    fn release(&self, stream_id: Uuid) {
        let mut listeners = mutex_lock(&self.listeners, SOURCE, "release");
        let Some(state) = listeners.get_mut(&stream_id) else {
            return;
        };
        state.subscribers = state.subscribers.saturating_sub(1);
        if state.subscribers == 0 {
            listeners.remove(&stream_id);
            debug!(%stream_id, "detaching change feed listener");
            self.transport.off(&stream_id.to_string());
        }
    }

    /// Detach every listener. Called when the owning store is disposed.
    pub fn dispose_all(&self) {
        let mut listeners = mutex_lock(&self.listeners, SOURCE, "dispose_all");
        for stream_id in listeners.keys() {
            self.transport.off(&stream_id.to_string());
        }
        listeners.clear();
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        mutex_lock(&self.listeners, SOURCE, "listener_count").len()
    }
}

/// One subscriber's handle on a shared change feed.
///
/// Dropping the subscription releases its refcount; `unsubscribe` does the
/// same explicitly and is idempotent.
pub struct ChangeFeedSubscription {
    registry: Arc<ChangeFeedRegistry>,
    stream_id: Uuid,
    receiver: Option<broadcast::Receiver<ChangePayload>>,
}

impl ChangeFeedSubscription {
    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    /// Next change payload, or `None` once the feed is closed or the
    /// subscription released. A lagging subscriber skips the payloads it
    /// missed and keeps going.
    pub async fn next(&mut self) -> Option<ChangePayload> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    counter!("rivo_feed_lagged_total").increment(skipped);
                    warn!(stream_id = %self.stream_id, skipped, "change feed subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Release this subscription's hold on the shared listener.
    pub fn unsubscribe(&mut self) {
        if self.receiver.take().is_some() {
            self.registry.release(self.stream_id);
        }
    }
}

impl Drop for ChangeFeedSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
