//! Per-stream and per-call options.

use tokio::sync::broadcast;

use crate::merge::MergeOptions;
use crate::protocol::ChangeEvent;

const CLIENT_CHANGE_BUFFER: usize = 16;

/// Options for [`CacheStore::stream`](crate::CacheStore::stream).
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Surface per-request errors to the caller instead of logging them.
    /// Part of the request key: errorable and non-errorable callers never
    /// share an entry.
    pub is_errorable: bool,
    /// Attach a change feed subscription so push updates keep the value
    /// current.
    pub is_streamed: bool,
    /// Bypass the cache table entirely; the request is issued fresh and the
    /// result is not stored.
    pub ignore_cache: bool,
    /// Keep this entry alive through invalidate-all sweeps.
    pub persist_through_invalidate_all: bool,
    /// When serialized across the SSR boundary, the hydrating store keeps
    /// the value only as a first-paint snapshot and still refetches.
    pub should_refetch_after_ssr: bool,
    /// Source of local optimistic edits folded into the combined value.
    pub client_changes: Option<ClientChanges>,
    /// How change events fold into the aggregated value.
    pub merge: MergeOptions,
}

/// Options for [`CacheStore::call`](crate::CacheStore::call).
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Run an invalidate-all sweep once the call succeeds, resynchronizing
    /// derived views with the mutation's effects.
    pub invalidate: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self { invalidate: true }
    }
}

/// Handle through which a caller pushes local optimistic edits into a
/// stream.
///
/// Clone freely; every clone feeds the same stream. Edits are folded through
/// the same merge function as server pushes, tagged as client-originated.
/// There is no replay: edits pushed while the entry has no aggregate yet are
/// discarded like any change arriving before the initial value.
#[derive(Debug, Clone)]
pub struct ClientChanges {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ClientChanges {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CLIENT_CHANGE_BUFFER);
        Self { sender }
    }

    /// Push one local edit. A no-op when no stream is attached.
    pub fn push(&self, change: ChangeEvent) {
        let _ = self.sender.send(change);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for ClientChanges {
    fn default() -> Self {
        Self::new()
    }
}
