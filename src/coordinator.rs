//! Request batching and response demultiplexing.
//!
//! Requests enqueued within one scheduler turn are flushed as a single batch
//! envelope over the transport. Responses come back on a per-batch event,
//! possibly in several chunks, and are matched to their pending requests by
//! correlation id. Every pending request resolves exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::ClientError;
use crate::lock::mutex_lock;
use crate::protocol::{BATCH_EVENT, BatchEnvelope, BatchItem, BatchResponse};
use crate::transport::{EventHandler, Transport};

const SOURCE: &str = "coordinator";

/// Options for a single enqueued request.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    pub is_errorable: bool,
    pub is_streamed: bool,
    /// Correlation id; generated when absent. Streamed requests pass their
    /// entry's stream id so the server attaches the push channel to it.
    pub stream_id: Option<Uuid>,
}

struct PendingRequest {
    item: BatchItem,
    is_errorable: bool,
    result: oneshot::Sender<Result<Value, ClientError>>,
}

struct Waiter {
    is_errorable: bool,
    result: oneshot::Sender<Result<Value, ClientError>>,
}

/// Batches outgoing requests over one logical connection and matches
/// responses back to callers by correlation id.
pub struct RequestCoordinator {
    transport: Arc<dyn Transport>,
    connection_id: Uuid,
    queue: Mutex<Vec<PendingRequest>>,
    flush_scheduled: AtomicBool,
}

impl RequestCoordinator {
    pub fn new(transport: Arc<dyn Transport>, connection_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            transport,
            connection_id,
            queue: Mutex::new(Vec::new()),
            flush_scheduled: AtomicBool::new(false),
        })
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Enqueue a request into the current batch window and await its
    /// response.
    pub async fn enqueue(
        self: &Arc<Self>,
        path: &str,
        body: Value,
        options: EnqueueOptions,
    ) -> Result<Value, ClientError> {
        let receiver = self.enqueue_raw(path, body, options);
        match receiver.await {
            Ok(result) => result,
            // sender dropped without resolving, e.g. transport failure for a
            // non-errorable request
            Err(_) => Err(ClientError::Abandoned),
        }
    }

    /// Synchronous half of [`enqueue`](Self::enqueue): registers the request
    /// in the batch window and returns the channel resolving it.
    pub(crate) fn enqueue_raw(
        self: &Arc<Self>,
        path: &str,
        body: Value,
        options: EnqueueOptions,
    ) -> oneshot::Receiver<Result<Value, ClientError>> {
        let (sender, receiver) = oneshot::channel();
        let stream_id = options.stream_id.unwrap_or_else(Uuid::new_v4);
        mutex_lock(&self.queue, SOURCE, "enqueue").push(PendingRequest {
            item: BatchItem {
                stream_id,
                path: path.to_string(),
                body,
                is_streamed: options.is_streamed,
            },
            is_errorable: options.is_errorable,
            result: sender,
        });

        if !self.flush_scheduled.swap(true, Ordering::SeqCst) {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                // one turn, so requests issued in the same turn coalesce
                tokio::task::yield_now().await;
                coordinator.flush();
            });
        }

        receiver
    }

    fn flush(self: &Arc<Self>) {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        let queue: Vec<PendingRequest> = {
            let mut guard = mutex_lock(&self.queue, SOURCE, "flush");
            guard.drain(..).collect()
        };
        if queue.is_empty() {
            return;
        }

        let batch_id = Uuid::new_v4();
        counter!("rivo_batch_flush_total").increment(1);
        debug!(%batch_id, request_count = queue.len(), "flushing request batch");

        let requests: Vec<BatchItem> = queue.iter().map(|pending| pending.item.clone()).collect();
        let waiters: Arc<Mutex<HashMap<Uuid, Waiter>>> = Arc::new(Mutex::new(
            queue
                .into_iter()
                .map(|pending| {
                    (
                        pending.item.stream_id,
                        Waiter {
                            is_errorable: pending.is_errorable,
                            result: pending.result,
                        },
                    )
                })
                .collect(),
        ));

        let envelope = BatchEnvelope {
            connection_id: self.connection_id,
            batch_id,
            requests,
        };
        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                error!(%batch_id, %err, "failed to serialize batch envelope; dropping batch");
                return;
            }
        };

        let event = batch_id.to_string();
        let handler: EventHandler = {
            let transport = Arc::clone(&self.transport);
            let waiters = Arc::clone(&waiters);
            let event = event.clone();
            Arc::new(move |payload| {
                handle_batch_message(&transport, &event, &waiters, payload);
            })
        };
        self.transport.on(&event, handler);
        self.transport.emit(BATCH_EVENT, payload);
    }
}

fn handle_batch_message(
    transport: &Arc<dyn Transport>,
    event: &str,
    waiters: &Arc<Mutex<HashMap<Uuid, Waiter>>>,
    payload: Value,
) {
    match BatchResponse::parse(&payload) {
        Err(err) => {
            warn!(batch_event = event, %err, "malformed batch response; dropped");
        }
        Ok(BatchResponse::Failure { info }) => {
            let drained: Vec<Waiter> = {
                let mut guard = mutex_lock(waiters, SOURCE, "failure");
                guard.drain().map(|(_, waiter)| waiter).collect()
            };
            for waiter in drained {
                if waiter.is_errorable {
                    let _ = waiter.result.send(Err(ClientError::Transport {
                        info: info.clone(),
                    }));
                } else {
                    // dropping the sender abandons the pending request
                    error!(info = %info, "transport failure for non-errorable request");
                }
            }
            transport.off(event);
        }
        Ok(BatchResponse::Chunk(chunk)) => {
            for (stream_id, response) in chunk {
                let waiter = mutex_lock(waiters, SOURCE, "chunk").remove(&stream_id);
                let Some(waiter) = waiter else {
                    counter!("rivo_response_unmatched_total").increment(1);
                    warn!(%stream_id, "response for unknown stream id; dropped");
                    continue;
                };
                match response.error {
                    Some(err) if waiter.is_errorable => {
                        let _ = waiter.result.send(Err(ClientError::Request { info: err }));
                    }
                    Some(err) => {
                        error!(error = %err, %stream_id, "ignored error for non-errorable request");
                    }
                    None => {
                        let _ = waiter
                            .result
                            .send(Ok(response.result.unwrap_or(Value::Null)));
                    }
                }
            }
            if mutex_lock(waiters, SOURCE, "chunk.done").is_empty() {
                transport.off(event);
            }
        }
    }
}
