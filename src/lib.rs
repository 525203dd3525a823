//! Rivo Client Cache
//!
//! Client-side reactive cache and synchronization layer for a
//! GraphQL-over-socket API:
//!
//! - **Batching**: requests issued within one scheduler turn go out as a
//!   single batch over the transport
//! - **Streaming**: streamed requests stay live, folding server-pushed
//!   change events into the cached value
//! - **Invalidation**: targeted or store-wide, seamless for subscribers
//! - **SSR boundary**: serialize the cache on the server, hydrate it on the
//!   client
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use rivo::{CacheStore, StoreConfig, StreamOptions};
//! use serde_json::json;
//!
//! # async fn demo(transport: Arc<dyn rivo::transport::Transport>) {
//! let store = CacheStore::new(transport, StoreConfig::default());
//! let mut posts = store.stream(
//!     "graphql",
//!     json!({"query": "{ posts { nodes { id } } }"}),
//!     StreamOptions { is_streamed: true, ..Default::default() },
//! );
//! while let Some(value) = posts.next().await {
//!     println!("{value}");
//! }
//! # }
//! ```

mod config;
mod coordinator;
mod entry;
mod error;
mod feed;
mod key;
mod lock;
mod merge;
mod options;
mod protocol;
mod store;
mod telemetry;
pub mod transport;

pub use config::StoreConfig;
pub use coordinator::{EnqueueOptions, RequestCoordinator};
pub use error::ClientError;
pub use feed::{ChangeFeedRegistry, ChangeFeedSubscription};
pub use key::{Request, RequestKey, canonical_json};
pub use merge::{InitialSort, MergeOptions, MergeUpdate, merge};
pub use options::{CallOptions, ClientChanges, StreamOptions};
pub use protocol::{
    BATCH_EVENT, BatchEnvelope, BatchItem, BatchResponse, CachedResult, ChangeAction, ChangeEvent,
    ChangePayload, ItemResponse, RECONNECT_EVENT,
};
pub use store::CacheStore;
pub use telemetry::describe_metrics;
