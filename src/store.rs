//! The cache store.
//!
//! One store per logical connection. It owns the entry table, the request
//! coordinator, and the shared change feed registry, and exposes the public
//! surface: `stream`, `call`, invalidation, and the serialize/hydrate
//! boundary for server-side rendering.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use futures::stream::BoxStream;
use metrics::counter;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::coordinator::{EnqueueOptions, RequestCoordinator};
use crate::entry::{CacheEntry, EntryContext};
use crate::error::ClientError;
use crate::feed::ChangeFeedRegistry;
use crate::key::RequestKey;
use crate::lock::mutex_lock;
use crate::options::{CallOptions, StreamOptions};
use crate::protocol::{CachedResult, RECONNECT_EVENT};
use crate::telemetry::describe_metrics;
use crate::transport::{EventHandler, Transport};

const SOURCE: &str = "store";

/// Client-side reactive cache over one socket connection.
///
/// Cheap to clone; all clones share the same entry table.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    entries: DashMap<String, Arc<CacheEntry>>,
    coordinator: Arc<RequestCoordinator>,
    feeds: Arc<ChangeFeedRegistry>,
    transport: Arc<dyn Transport>,
    config: StoreConfig,
    allow_invalidation: AtomicBool,
    /// Coalesced sweep window. `Some(true)` means a streams-only sweep is
    /// pending; a broader request widens it to `Some(false)`.
    pending_sweep: Mutex<Option<bool>>,
}

impl CacheStore {
    pub fn new(transport: Arc<dyn Transport>, config: StoreConfig) -> Self {
        Self::with_cache(transport, config, BTreeMap::new())
    }

    /// Build a store hydrated from a serialized cache payload. Entries
    /// flagged `should_refetch_after_ssr` keep their value only as a
    /// first-paint snapshot and fetch fresh when first streamed.
    pub fn with_cache(
        transport: Arc<dyn Transport>,
        config: StoreConfig,
        cache: BTreeMap<String, CachedResult>,
    ) -> Self {
        describe_metrics();
        let connection_id = Uuid::new_v4();
        let coordinator = RequestCoordinator::new(Arc::clone(&transport), connection_id);
        let feeds = ChangeFeedRegistry::new(Arc::clone(&transport), config.feed_buffer_non_zero());
        let inner = Arc::new(StoreInner {
            entries: DashMap::new(),
            coordinator,
            feeds,
            transport: Arc::clone(&transport),
            allow_invalidation: AtomicBool::new(config.allow_invalidation),
            config,
            pending_sweep: Mutex::new(None),
        });

        let mut hydrated = 0usize;
        for (canonical, cached) in cache {
            let key = match RequestKey::from_canonical(&canonical) {
                Ok(key) => key,
                Err(err) => {
                    warn!(key = canonical, %err, "unparseable cached key; skipped");
                    continue;
                }
            };
            let entry = CacheEntry::new(key, inner.entry_context());
            if cached.should_refetch_after_ssr {
                entry.seed_snapshot(cached.value);
            } else {
                entry.seed_raw(cached.value);
            }
            inner.entries.insert(canonical, entry);
            hydrated += 1;
        }
        if hydrated > 0 {
            info!(entry_count = hydrated, "hydrated cache");
        }

        // streams-only sweep on socket reconnect, so live streams resync
        // without disturbing one-shot results
        let weak = Arc::downgrade(&inner);
        let handler: EventHandler = Arc::new(move |_payload| {
            if let Some(inner) = Weak::upgrade(&weak) {
                debug!("reconnect; scheduling streams-only sweep");
                inner.schedule_sweep(true);
            }
        });
        inner.transport.on(RECONNECT_EVENT, handler);

        Self { inner }
    }

    pub fn connection_id(&self) -> Uuid {
        self.inner.coordinator.connection_id()
    }

    /// Stream the value for a request. The first item is the current cached
    /// value when one exists; later items follow fetches, merged pushes, and
    /// invalidation refetches. Consecutive duplicates are suppressed.
    pub fn stream(&self, path: &str, body: Value, options: StreamOptions) -> BoxStream<'static, Value> {
        let key = RequestKey::new(path, body, options.is_errorable);
        if options.ignore_cache {
            // detached entry, never enters the table; torn down when the
            // stream is dropped
            let entry = CacheEntry::new(key, self.inner.entry_context());
            entry.activate(options);
            let guard = DisposeOnDrop(Arc::clone(&entry));
            let mut values = subscriber_stream(entry);
            return Box::pin(async_stream::stream! {
                let _guard = guard;
                while let Some(value) = values.next().await {
                    yield value;
                }
            });
        }

        let canonical = key.canonical().to_string();
        let entry = match self.inner.entries.entry(canonical) {
            Entry::Occupied(occupied) => {
                counter!("rivo_cache_hit_total").increment(1);
                Arc::clone(occupied.get())
            }
            Entry::Vacant(vacant) => {
                counter!("rivo_cache_miss_total").increment(1);
                let entry = CacheEntry::new(key, self.inner.entry_context());
                vacant.insert(Arc::clone(&entry));
                entry
            }
        };
        entry.activate(options);
        subscriber_stream(entry)
    }

    /// One-shot mutation. Always errorable. On success, runs an
    /// invalidate-all sweep (unless opted out) and waits for the configured
    /// settle delay so immediately following streams fetch post-mutation
    /// data.
    pub async fn call(
        &self,
        path: &str,
        body: Value,
        options: CallOptions,
    ) -> Result<Value, ClientError> {
        let result = self
            .inner
            .coordinator
            .enqueue(
                path,
                body,
                EnqueueOptions {
                    is_errorable: true,
                    is_streamed: false,
                    stream_id: None,
                },
            )
            .await?;

        if options.invalidate {
            self.inner.schedule_sweep(false);
            // cross a timer boundary so the sweep and its refetches run
            // before the call settles
            tokio::time::sleep(self.inner.config.call_settle_delay()).await;
        }
        Ok(result)
    }

    /// Refetch every entry matching `path`, or the exact key when a body is
    /// given. A no-op while invalidation is disabled.
    pub fn invalidate(&self, path: &str, body: Option<&Value>, is_errorable: bool) {
        if !self.inner.allow_invalidation.load(Ordering::SeqCst) {
            debug!(path, "invalidation disabled; skipped");
            return;
        }
        let exact = body.map(|body| RequestKey::new(path, body.clone(), is_errorable));
        for entry in self.inner.entries.iter() {
            let key = entry.value().key();
            let matched = match &exact {
                Some(exact) => key == exact,
                None => key.path() == path,
            };
            if matched {
                entry.value().refresh();
            }
        }
    }

    /// Schedule an invalidate-all sweep. Requests within one scheduler turn
    /// coalesce into a single sweep.
    pub fn invalidate_all(&self) {
        self.inner.schedule_sweep(false);
    }

    /// Push a value into the cache without a network round trip, creating
    /// the entry when absent. Live subscribers see it immediately.
    pub fn set_data_cache(&self, path: &str, body: Value, value: Value) {
        let key = RequestKey::new(path, body, false);
        let canonical = key.canonical().to_string();
        match self.inner.entries.entry(canonical) {
            Entry::Occupied(occupied) => occupied.get().inject(value),
            Entry::Vacant(vacant) => {
                let entry = CacheEntry::new(key, self.inner.entry_context());
                entry.seed_raw(value);
                vacant.insert(entry);
            }
        }
    }

    /// Current cached value for a request, if any, without subscribing.
    pub fn cached_value(&self, path: &str, body: Value, is_errorable: bool) -> Option<Value> {
        let key = RequestKey::new(path, body, is_errorable);
        self.inner
            .entries
            .get(key.canonical())
            .and_then(|entry| entry.snapshot())
    }

    /// Serialize every cached raw value for transfer across the rendering
    /// boundary. Feed it back through [`with_cache`](Self::with_cache).
    pub fn serialize(&self) -> BTreeMap<String, CachedResult> {
        let mut out = BTreeMap::new();
        for entry in self.inner.entries.iter() {
            if let Some(value) = entry.value().raw_for_serialize() {
                out.insert(
                    entry.value().key().canonical().to_string(),
                    CachedResult {
                        value,
                        should_refetch_after_ssr: entry.value().should_refetch_after_ssr(),
                    },
                );
            }
        }
        out
    }

    /// Freeze the cache: sweeps and targeted invalidations become no-ops.
    /// Used during a server-side render pass.
    pub fn disable_invalidation(&self) {
        self.inner.allow_invalidation.store(false, Ordering::SeqCst);
    }

    pub fn enable_invalidation(&self) {
        self.inner.allow_invalidation.store(true, Ordering::SeqCst);
    }

    /// Tear the store down: detach every transport listener and dispose
    /// every entry. Subscriber streams end.
    pub fn dispose(&self) {
        self.inner.transport.off(RECONNECT_EVENT);
        self.inner.feeds.dispose_all();
        for entry in self.inner.entries.iter() {
            entry.dispose();
        }
        self.inner.entries.clear();
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.inner.entries.len()
    }
}

impl StoreInner {
    fn entry_context(&self) -> EntryContext {
        EntryContext {
            coordinator: Arc::clone(&self.coordinator),
            feeds: Arc::clone(&self.feeds),
            value_buffer: self.config.value_buffer_non_zero(),
        }
    }

    fn schedule_sweep(self: &Arc<Self>, streams_only: bool) {
        if !self.allow_invalidation.load(Ordering::SeqCst) {
            debug!("invalidation disabled; sweep skipped");
            return;
        }
        let mut pending = mutex_lock(&self.pending_sweep, SOURCE, "schedule_sweep");
        match pending.as_mut() {
            Some(scoped) => {
                // the broader sweep wins the window
                *scoped = *scoped && streams_only;
            }
            None => {
                *pending = Some(streams_only);
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    inner.sweep();
                });
            }
        }
    }

    fn sweep(&self) {
        let streams_only = {
            let mut pending = mutex_lock(&self.pending_sweep, SOURCE, "sweep");
            match pending.take() {
                Some(streams_only) => streams_only,
                None => return,
            }
        };
        counter!("rivo_invalidate_all_total").increment(1);
        debug!(streams_only, "invalidate-all sweep");
        self.entries.retain(|_, entry| {
            // a streams-only sweep evicts non-streamed entries before any
            // other rule applies; live subscribers keep their last value
            if streams_only && !entry.is_streamed() {
                if entry.subscriber_count() == 0 {
                    entry.dispose();
                }
                return false;
            }
            if entry.persists_through_invalidate_all() {
                return true;
            }
            if entry.subscriber_count() == 0 {
                entry.dispose();
                return false;
            }
            entry.refresh();
            true
        });
    }
}

struct DisposeOnDrop(Arc<CacheEntry>);

impl Drop for DisposeOnDrop {
    fn drop(&mut self) {
        self.0.dispose();
    }
}

/// Turn one entry into a subscriber stream: current snapshot first, then
/// every published aggregate, with consecutive duplicates dropped. The
/// stream holds the entry alive while polled.
fn subscriber_stream(entry: Arc<CacheEntry>) -> BoxStream<'static, Value> {
    let mut receiver = entry.subscribe();
    Box::pin(async_stream::stream! {
        let mut last: Option<Value> = None;
        if let Some(snapshot) = entry.snapshot() {
            last = Some(snapshot.clone());
            yield snapshot;
        }
        loop {
            match receiver.recv().await {
                Ok(value) => {
                    if last.as_ref() == Some(&value) {
                        continue;
                    }
                    last = Some(value.clone());
                    yield value;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
