//! One live cache entry and its driver task.
//!
//! An entry owns the aggregated value for one request key. A broadcast
//! channel is the entry's stable handle: subscribers hold receivers across
//! invalidations while the driver task behind it is torn down and replaced.
//! A generation counter fences the old driver out, so a stale fetch can
//! never publish over a newer one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::coordinator::{EnqueueOptions, RequestCoordinator};
use crate::feed::{ChangeFeedRegistry, ChangeFeedSubscription};
use crate::key::RequestKey;
use crate::lock::{mutex_lock, rw_read, rw_write};
use crate::merge::{MergeUpdate, merge};
use crate::options::StreamOptions;
use crate::protocol::{ChangeEvent, ChangePayload};

const SOURCE: &str = "entry";

/// Shared plumbing every entry drives through.
#[derive(Clone)]
pub(crate) struct EntryContext {
    pub coordinator: Arc<RequestCoordinator>,
    pub feeds: Arc<ChangeFeedRegistry>,
    pub value_buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    Empty,
    Fetching,
    Ready,
    Invalidating,
    Disposed,
}

pub(crate) struct CacheEntry {
    key: RequestKey,
    stream_id: Uuid,
    context: EntryContext,
    options: Mutex<StreamOptions>,
    state: Mutex<EntryState>,
    generation: AtomicU64,
    /// Last value fetched from the network, unmerged. Reused on driver
    /// restart when still present, and the payload of `serialize`.
    raw_value: RwLock<Option<Value>>,
    /// Hydrated first-paint value for entries that must still refetch.
    raw_snapshot: RwLock<Option<Value>>,
    /// Last published aggregate.
    latest: RwLock<Option<Value>>,
    /// `None` once disposed; dropping the sender closes every subscriber.
    sender: Mutex<Option<broadcast::Sender<Value>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CacheEntry {
    pub fn new(key: RequestKey, context: EntryContext) -> Arc<Self> {
        let (sender, _) = broadcast::channel(context.value_buffer.max(1));
        Arc::new(Self {
            key,
            stream_id: Uuid::new_v4(),
            context,
            options: Mutex::new(StreamOptions::default()),
            state: Mutex::new(EntryState::Empty),
            generation: AtomicU64::new(0),
            raw_value: RwLock::new(None),
            raw_snapshot: RwLock::new(None),
            latest: RwLock::new(None),
            sender: Mutex::new(Some(sender)),
            driver: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn options(&self) -> StreamOptions {
        mutex_lock(&self.options, SOURCE, "options").clone()
    }

    pub fn is_streamed(&self) -> bool {
        self.options().is_streamed
    }

    pub fn persists_through_invalidate_all(&self) -> bool {
        self.options().persist_through_invalidate_all
    }

    pub fn should_refetch_after_ssr(&self) -> bool {
        self.options().should_refetch_after_ssr
    }

    pub fn subscriber_count(&self) -> usize {
        mutex_lock(&self.sender, SOURCE, "subscriber_count")
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        match mutex_lock(&self.sender, SOURCE, "subscribe").as_ref() {
            Some(sender) => sender.subscribe(),
            // disposed: hand out an already-closed receiver
            None => broadcast::channel(1).1,
        }
    }

    /// Latest aggregate, falling back to the hydrated first-paint snapshot.
    pub fn snapshot(&self) -> Option<Value> {
        rw_read(&self.latest, SOURCE, "snapshot")
            .clone()
            .or_else(|| rw_read(&self.raw_snapshot, SOURCE, "snapshot").clone())
    }

    /// Raw network value, for the serialize boundary.
    pub fn raw_for_serialize(&self) -> Option<Value> {
        rw_read(&self.raw_value, SOURCE, "serialize")
            .clone()
            .or_else(|| rw_read(&self.raw_snapshot, SOURCE, "serialize").clone())
    }

    /// Seed the raw value without touching the driver. Used for hydration
    /// and for values pushed in via `set_data_cache`.
    pub fn seed_raw(&self, value: Value) {
        *rw_write(&self.raw_value, SOURCE, "seed_raw") = Some(value);
    }

    /// Seed a first-paint snapshot only; the entry still fetches when first
    /// streamed.
    pub fn seed_snapshot(&self, value: Value) {
        *rw_write(&self.raw_snapshot, SOURCE, "seed_snapshot") = Some(value);
    }

    /// Spawn the driver task if this entry has none yet, adopting the
    /// caller's options.
    pub fn activate(self: &Arc<Self>, options: StreamOptions) {
        let mut driver = mutex_lock(&self.driver, SOURCE, "activate");
        if driver.is_some() || *mutex_lock(&self.state, SOURCE, "activate") == EntryState::Disposed
        {
            return;
        }
        *mutex_lock(&self.options, SOURCE, "activate") = options;
        let generation = self.generation.load(Ordering::SeqCst);
        let entry = Arc::clone(self);
        *driver = Some(tokio::spawn(async move {
            drive(entry, generation).await;
        }));
    }

    /// Drop cached values and replace the driver, forcing a refetch. Live
    /// subscribers keep their receivers and see the fresh value when it
    /// arrives.
    pub fn refresh(self: &Arc<Self>) {
        if *mutex_lock(&self.state, SOURCE, "refresh") == EntryState::Disposed {
            return;
        }
        self.set_state(EntryState::Invalidating);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *rw_write(&self.raw_value, SOURCE, "refresh") = None;
        *rw_write(&self.raw_snapshot, SOURCE, "refresh") = None;

        let mut driver = mutex_lock(&self.driver, SOURCE, "refresh");
        if let Some(handle) = driver.take() {
            handle.abort();
            let entry = Arc::clone(self);
            *driver = Some(tokio::spawn(async move {
                drive(entry, generation).await;
            }));
        }
        // never activated: the refetch happens on the next stream()
    }

    /// Terminal. Aborts the driver; subscribers see their receivers close
    /// once the sender is dropped with the entry.
    pub fn dispose(&self) {
        {
            let mut state = mutex_lock(&self.state, SOURCE, "dispose");
            if *state == EntryState::Disposed {
                return;
            }
            debug!(key = self.key.canonical(), "disposing entry");
            *state = EntryState::Disposed;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = mutex_lock(&self.driver, SOURCE, "dispose").take() {
            handle.abort();
        }
        mutex_lock(&self.sender, SOURCE, "dispose").take();
    }

    /// Release the driver slot so a later subscriber spawns a fresh fetch,
    /// unless a newer driver has already taken the slot over.
    fn clear_driver(&self, generation: u64) {
        let mut driver = mutex_lock(&self.driver, SOURCE, "clear_driver");
        if self.generation.load(Ordering::SeqCst) == generation {
            driver.take();
        }
    }

    /// Push a value straight into the entry, bypassing the network. An
    /// active driver is restarted over the injected value (reusing it as
    /// the raw value), so subsequent change events merge onto it rather
    /// than onto the pre-injection aggregate.
    pub fn inject(self: &Arc<Self>, value: Value) {
        if *mutex_lock(&self.state, SOURCE, "inject") == EntryState::Disposed {
            return;
        }
        *rw_write(&self.raw_value, SOURCE, "inject") = Some(value.clone());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut driver = mutex_lock(&self.driver, SOURCE, "inject");
        match driver.take() {
            Some(handle) => {
                handle.abort();
                let entry = Arc::clone(self);
                *driver = Some(tokio::spawn(async move {
                    drive(entry, generation).await;
                }));
            }
            None => {
                drop(driver);
                self.publish(generation, &value);
            }
        }
    }

    fn set_state(&self, next: EntryState) {
        let mut state = mutex_lock(&self.state, SOURCE, "set_state");
        if *state == EntryState::Disposed || *state == next {
            return;
        }
        debug!(key = self.key.canonical(), from = ?*state, to = ?next, "entry state");
        *state = next;
    }

    /// Publish an aggregate unless a newer generation has taken over.
    fn publish(&self, generation: u64, value: &Value) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        *rw_write(&self.latest, SOURCE, "publish") = Some(value.clone());
        if let Some(sender) = mutex_lock(&self.sender, SOURCE, "publish").as_ref() {
            let _ = sender.send(value.clone());
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> EntryState {
        *mutex_lock(&self.state, SOURCE, "state")
    }
}

enum Folded {
    Feed(Option<ChangePayload>),
    Client(Result<ChangeEvent, broadcast::error::RecvError>),
}

async fn next_feed(feed: &mut Option<ChangeFeedSubscription>) -> Option<ChangePayload> {
    match feed {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn next_client(
    client: &mut Option<broadcast::Receiver<ChangeEvent>>,
) -> Result<ChangeEvent, broadcast::error::RecvError> {
    match client {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// The entry's driver: fetch (or reuse) the initial value, then fold feed
/// pushes and local edits into the aggregate until torn down.
async fn drive(entry: Arc<CacheEntry>, generation: u64) {
    let options = entry.options();
    let local_connection_id = entry.context.coordinator.connection_id();

    // subscribe before fetching so no push can fall between response and
    // subscription
    let mut feed = options
        .is_streamed
        .then(|| entry.context.feeds.subscribe(entry.stream_id));
    let mut client = options
        .client_changes
        .as_ref()
        .map(|changes| changes.subscribe());

    let reused = rw_read(&entry.raw_value, SOURCE, "drive").clone();
    let initial = match reused {
        Some(raw) => raw,
        None => {
            entry.set_state(EntryState::Fetching);
            let result = entry
                .context
                .coordinator
                .enqueue(
                    entry.key.path(),
                    entry.key.body().clone(),
                    EnqueueOptions {
                        is_errorable: entry.key.is_errorable(),
                        is_streamed: options.is_streamed,
                        stream_id: Some(entry.stream_id),
                    },
                )
                .await;
            match result {
                Ok(value) => {
                    entry.seed_raw(value.clone());
                    value
                }
                Err(err) => {
                    error!(key = entry.key.canonical(), %err, "stream request failed");
                    entry.set_state(EntryState::Empty);
                    // the next subscriber must be able to retry the fetch
                    entry.clear_driver(generation);
                    return;
                }
            }
        }
    };

    let mut aggregate = merge(
        None,
        &MergeUpdate::Initial(initial),
        &options.merge,
        local_connection_id,
    );
    entry.set_state(EntryState::Ready);
    if let Some(value) = &aggregate {
        if !entry.publish(generation, value) {
            return;
        }
    }

    loop {
        if feed.is_none() && client.is_none() {
            return;
        }
        let folded = tokio::select! {
            payload = next_feed(&mut feed) => Folded::Feed(payload),
            change = next_client(&mut client) => Folded::Client(change),
        };
        let update = match folded {
            Folded::Feed(None) => {
                feed = None;
                continue;
            }
            Folded::Feed(Some(payload)) => {
                // a push carrying a fresh initial replaces the aggregate
                if let Some(value) = payload.initial {
                    entry.seed_raw(value.clone());
                    MergeUpdate::Initial(value)
                } else if let Some(changes) = payload.changes {
                    MergeUpdate::Changes {
                        connection_id: payload.connection_id,
                        changes,
                        is_client: false,
                    }
                } else {
                    continue;
                }
            }
            Folded::Client(Ok(change)) => MergeUpdate::Changes {
                connection_id: Some(local_connection_id),
                changes: vec![change],
                is_client: true,
            },
            Folded::Client(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Folded::Client(Err(broadcast::error::RecvError::Closed)) => {
                client = None;
                continue;
            }
        };
        if let Some(next) = merge(
            aggregate.as_ref(),
            &update,
            &options.merge,
            local_connection_id,
        ) {
            if !entry.publish(generation, &next) {
                return;
            }
            aggregate = Some(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::protocol::{BATCH_EVENT, BatchEnvelope};
    use crate::transport::{MemoryTransport, Transport};

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn context(transport: &Arc<MemoryTransport>) -> EntryContext {
        let transport_dyn = Arc::clone(transport) as Arc<dyn Transport>;
        EntryContext {
            coordinator: RequestCoordinator::new(Arc::clone(&transport_dyn), Uuid::new_v4()),
            feeds: ChangeFeedRegistry::new(transport_dyn, 8),
            value_buffer: 8,
        }
    }

    fn key(path: &str) -> RequestKey {
        RequestKey::new(path, json!({"q": 1}), false)
    }

    /// Answer every pending batch with `result` for each of its requests.
    fn answer_batches(transport: &MemoryTransport, result: &Value) {
        for (event, payload) in transport.take_sent() {
            if event != BATCH_EVENT {
                continue;
            }
            let envelope: BatchEnvelope = serde_json::from_value(payload).expect("parse envelope");
            let mut chunk = serde_json::Map::new();
            for request in &envelope.requests {
                chunk.insert(
                    request.stream_id.to_string(),
                    json!({"result": result.clone()}),
                );
            }
            transport.deliver(&envelope.batch_id.to_string(), Value::Object(chunk));
        }
    }

    fn nodes(values: Vec<Value>) -> Value {
        json!({"data": {"items": {"nodes": values}}})
    }

    #[tokio::test(start_paused = true)]
    async fn activate_fetches_and_publishes() {
        let transport = Arc::new(MemoryTransport::new());
        let entry = CacheEntry::new(key("graphql"), context(&transport));
        let mut rx = entry.subscribe();

        entry.activate(StreamOptions::default());
        settle().await;
        answer_batches(&transport, &nodes(vec![json!({"id": 1})]));
        settle().await;

        assert_eq!(rx.recv().await.expect("value"), nodes(vec![json!({"id": 1})]));
        assert_eq!(entry.state(), EntryState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_entry_folds_feed_changes() {
        let transport = Arc::new(MemoryTransport::new());
        let entry = CacheEntry::new(key("graphql"), context(&transport));
        let mut rx = entry.subscribe();

        entry.activate(StreamOptions {
            is_streamed: true,
            ..Default::default()
        });
        settle().await;
        answer_batches(&transport, &nodes(vec![json!({"id": 1})]));
        settle().await;
        let _ = rx.recv().await.expect("initial");

        transport.deliver(
            &entry.stream_id.to_string(),
            json!({"changes": [{"action": "create", "newVal": {"id": 2}}]}),
        );
        settle().await;
        assert_eq!(
            rx.recv().await.expect("merged"),
            nodes(vec![json!({"id": 1}), json!({"id": 2})])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_entry_skips_the_network() {
        let transport = Arc::new(MemoryTransport::new());
        let entry = CacheEntry::new(key("graphql"), context(&transport));
        entry.seed_raw(nodes(vec![json!({"id": 7})]));
        let mut rx = entry.subscribe();

        entry.activate(StreamOptions::default());
        settle().await;

        assert_eq!(rx.recv().await.expect("value"), nodes(vec![json!({"id": 7})]));
        assert!(
            transport.sent().is_empty(),
            "no batch emitted for a seeded entry"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_drops_values_and_refetches() {
        let transport = Arc::new(MemoryTransport::new());
        let entry = CacheEntry::new(key("graphql"), context(&transport));
        let mut rx = entry.subscribe();

        entry.activate(StreamOptions::default());
        settle().await;
        answer_batches(&transport, &nodes(vec![json!({"id": 1})]));
        settle().await;
        let _ = rx.recv().await.expect("first value");

        entry.refresh();
        settle().await;
        answer_batches(&transport, &nodes(vec![json!({"id": 2})]));
        settle().await;

        assert_eq!(rx.recv().await.expect("refetched"), nodes(vec![json!({"id": 2})]));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_cannot_publish() {
        let transport = Arc::new(MemoryTransport::new());
        let entry = CacheEntry::new(key("graphql"), context(&transport));
        assert!(entry.publish(0, &json!(1)));

        entry.refresh();
        assert!(!entry.publish(0, &json!(2)), "old generation fenced out");
    }

    #[tokio::test(start_paused = true)]
    async fn client_changes_fold_in_as_local_edits() {
        let transport = Arc::new(MemoryTransport::new());
        let entry = CacheEntry::new(key("graphql"), context(&transport));
        let client_changes = crate::options::ClientChanges::new();
        let mut rx = entry.subscribe();

        entry.activate(StreamOptions {
            client_changes: Some(client_changes.clone()),
            ..Default::default()
        });
        settle().await;
        answer_batches(&transport, &nodes(vec![json!({"id": 1})]));
        settle().await;
        let _ = rx.recv().await.expect("initial");

        client_changes.push(ChangeEvent::create(json!({"id": 2, "clientId": "tmp"})));
        settle().await;
        assert_eq!(
            rx.recv().await.expect("merged"),
            nodes(vec![json!({"id": 1}), json!({"id": 2, "clientId": "tmp"})])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_releases_the_feed_listener() {
        let transport = Arc::new(MemoryTransport::new());
        let entry = CacheEntry::new(key("graphql"), context(&transport));

        entry.activate(StreamOptions {
            is_streamed: true,
            ..Default::default()
        });
        settle().await;
        assert!(transport.has_listener(&entry.stream_id.to_string()));

        entry.dispose();
        settle().await;
        assert!(!transport.has_listener(&entry.stream_id.to_string()));
        assert_eq!(entry.state(), EntryState::Disposed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_returns_to_empty() {
        let transport = Arc::new(MemoryTransport::new());
        let entry = CacheEntry::new(key("graphql"), context(&transport));

        entry.activate(StreamOptions::default());
        settle().await;
        for (event, payload) in transport.take_sent() {
            if event == BATCH_EVENT {
                let envelope: BatchEnvelope =
                    serde_json::from_value(payload).expect("parse envelope");
                transport.deliver(
                    &envelope.batch_id.to_string(),
                    json!({"isError": true, "info": "down"}),
                );
            }
        }
        settle().await;

        assert_eq!(entry.state(), EntryState::Empty);
        assert!(entry.snapshot().is_none());

        // the driver slot is free again, so a later subscriber retries
        let mut rx = entry.subscribe();
        entry.activate(StreamOptions::default());
        settle().await;
        answer_batches(&transport, &json!({"v": "recovered"}));
        settle().await;
        assert_eq!(
            rx.recv().await.expect("retried fetch"),
            json!({"v": "recovered"})
        );
        assert_eq!(entry.state(), EntryState::Ready);
    }
}
