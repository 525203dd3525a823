//! End-to-end cache behavior against a scripted transport.
//!
//! - Drives the full pipeline: batch emission, response demux, change feed
//!   merging, invalidation sweeps.
//! - The `MemoryTransport` plays the server: tests read the emitted batch
//!   envelopes and answer them by delivering payloads on the batch channel.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rivo::transport::{MemoryTransport, Transport};
use rivo::{
    BATCH_EVENT, BatchEnvelope, CacheStore, CallOptions, MergeOptions, RECONNECT_EVENT,
    StoreConfig, StreamOptions,
};
use serde_json::{Value, json};

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test(start_paused = true)]
async fn streamed_query_receives_initial_then_merged_changes() {
    let (transport, store) = setup();

    let mut posts = store.stream(
        "graphql",
        json!({"query": "posts"}),
        StreamOptions {
            is_streamed: true,
            ..Default::default()
        },
    );
    settle().await;

    let envelopes = pending_envelopes(&transport);
    assert_eq!(envelopes.len(), 1);
    let stream_id = envelopes[0].requests[0].stream_id;
    answer(&transport, &envelopes[0], &nodes(vec![json!({"id": 1})]));
    settle().await;
    assert_eq!(posts.next().await, Some(nodes(vec![json!({"id": 1})])));

    transport.deliver(
        &stream_id.to_string(),
        json!({"changes": [{"action": "create", "newVal": {"id": 2}}]}),
    );
    settle().await;
    assert_eq!(
        posts.next().await,
        Some(nodes(vec![json!({"id": 1}), json!({"id": 2})]))
    );
}

#[tokio::test(start_paused = true)]
async fn prepend_and_limit_apply_to_pushed_creates() {
    let (transport, store) = setup();

    let mut posts = store.stream(
        "graphql",
        json!({"query": "posts"}),
        StreamOptions {
            is_streamed: true,
            merge: MergeOptions {
                should_prepend_new_updates: true,
                limit: Some(2),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    settle().await;

    let envelopes = pending_envelopes(&transport);
    let stream_id = envelopes[0].requests[0].stream_id;
    answer(
        &transport,
        &envelopes[0],
        &nodes(vec![json!({"id": 1}), json!({"id": 2})]),
    );
    settle().await;
    let _ = posts.next().await;

    transport.deliver(
        &stream_id.to_string(),
        json!({"changes": [{"action": "create", "newVal": {"id": 3}}]}),
    );
    settle().await;
    assert_eq!(
        posts.next().await,
        Some(nodes(vec![json!({"id": 3}), json!({"id": 1})])),
        "new node prepended, overflow trimmed from the far end"
    );
}

#[tokio::test(start_paused = true)]
async fn requests_from_one_turn_share_a_batch_envelope() {
    let (transport, store) = setup();

    let _a = store.stream("graphql", json!({"q": "a"}), StreamOptions::default());
    let _b = store.stream("graphql", json!({"q": "b"}), StreamOptions::default());
    settle().await;

    let envelopes = pending_envelopes(&transport);
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].requests.len(), 2);
}

// ============================================================================
// Invalidation
// ============================================================================

/// After invalidate-all, a subscriber keeps its stream: it holds the last
/// value and then sees the refetched one, with no interruption in between.
#[tokio::test(start_paused = true)]
async fn invalidate_all_is_seamless_for_subscribers() {
    let (transport, store) = setup();

    let mut posts = store.stream(
        "graphql",
        json!({"query": "posts"}),
        StreamOptions::default(),
    );
    settle().await;
    let envelopes = pending_envelopes(&transport);
    answer(&transport, &envelopes[0], &json!({"v": "before"}));
    settle().await;
    assert_eq!(posts.next().await, Some(json!({"v": "before"})));

    store.invalidate_all();
    settle().await;

    let envelopes = pending_envelopes(&transport);
    assert_eq!(envelopes.len(), 1, "subscribed entry refetches");
    answer(&transport, &envelopes[0], &json!({"v": "after"}));
    settle().await;
    assert_eq!(
        posts.next().await,
        Some(json!({"v": "after"})),
        "same stream carries the post-invalidation value"
    );
}

#[tokio::test(start_paused = true)]
async fn successful_call_triggers_a_sweep() {
    let (transport, store) = setup();

    let mut posts = store.stream(
        "graphql",
        json!({"query": "posts"}),
        StreamOptions::default(),
    );
    settle().await;
    let envelopes = pending_envelopes(&transport);
    answer(&transport, &envelopes[0], &json!({"v": 1}));
    settle().await;
    let _ = posts.next().await;

    let mutation_store = store.clone();
    let call = tokio::spawn(async move {
        mutation_store
            .call(
                "graphql",
                json!({"mutation": "addPost"}),
                CallOptions::default(),
            )
            .await
    });
    settle().await;
    let envelopes = pending_envelopes(&transport);
    answer(&transport, &envelopes[0], &json!({"created": true}));
    settle().await;
    assert_eq!(
        call.await.expect("join").expect("call"),
        json!({"created": true})
    );

    let envelopes = pending_envelopes(&transport);
    assert_eq!(envelopes.len(), 1, "sweep refetched the subscribed query");
    answer(&transport, &envelopes[0], &json!({"v": 2}));
    settle().await;
    assert_eq!(posts.next().await, Some(json!({"v": 2})));
}

#[tokio::test(start_paused = true)]
async fn reconnect_refetches_streamed_entries_only() {
    let (transport, store) = setup();

    let mut streamed = store.stream(
        "graphql",
        json!({"q": "streamed"}),
        StreamOptions {
            is_streamed: true,
            ..Default::default()
        },
    );
    let mut plain = store.stream("graphql", json!({"q": "plain"}), StreamOptions::default());
    settle().await;
    for envelope in pending_envelopes(&transport) {
        answer(&transport, &envelope, &json!({"v": 1}));
    }
    settle().await;
    let _ = streamed.next().await;
    let _ = plain.next().await;

    transport.deliver(RECONNECT_EVENT, json!(null));
    settle().await;

    let envelopes = pending_envelopes(&transport);
    let refetched: usize = envelopes.iter().map(|e| e.requests.len()).sum();
    assert_eq!(refetched, 1);
    assert!(envelopes[0].requests[0].is_streamed);
}

// ============================================================================
// Helpers
// ============================================================================

fn setup() -> (Arc<MemoryTransport>, CacheStore) {
    let transport = Arc::new(MemoryTransport::new());
    let store = CacheStore::new(
        transport.clone() as Arc<dyn Transport>,
        StoreConfig::default(),
    );
    (transport, store)
}

/// Let spawned flush and sweep tasks run under the paused clock.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Drain emitted batch envelopes, oldest first.
fn pending_envelopes(transport: &MemoryTransport) -> Vec<BatchEnvelope> {
    transport
        .take_sent()
        .into_iter()
        .filter(|(event, _)| event == BATCH_EVENT)
        .map(|(_, payload)| serde_json::from_value(payload).expect("parse envelope"))
        .collect()
}

/// Answer every request in `envelope` with `result`.
fn answer(transport: &MemoryTransport, envelope: &BatchEnvelope, result: &Value) {
    let mut chunk = serde_json::Map::new();
    for request in &envelope.requests {
        chunk.insert(
            request.stream_id.to_string(),
            json!({"result": result.clone()}),
        );
    }
    transport.deliver(&envelope.batch_id.to_string(), Value::Object(chunk));
}

fn nodes(values: Vec<Value>) -> Value {
    json!({"data": {"posts": {"nodes": values}}})
}
