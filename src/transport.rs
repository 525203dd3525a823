//! Transport abstraction.
//!
//! The cache core talks to the outside world through a narrow bidirectional
//! push channel: emit an event with a payload, register a handler for an
//! inbound event, remove it again. The socket implementation itself lives
//! outside this crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::lock::mutex_lock;

const SOURCE: &str = "transport";

/// Handler invoked for each inbound payload on a subscribed event.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Bidirectional push channel consumed by the cache core.
///
/// At most one handler is registered per event name; a later `on` for the
/// same event replaces the earlier handler. Implementations must tolerate
/// `off` being called from within a handler invocation, and must dispatch
/// inbound events on the consumer's async runtime.
pub trait Transport: Send + Sync + 'static {
    fn emit(&self, event: &str, payload: Value);
    fn on(&self, event: &str, handler: EventHandler);
    fn off(&self, event: &str);
}

/// Transport that drops everything.
///
/// Useful in contexts with no live socket, e.g. a server-side render pass
/// that only reads hydrated values.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn emit(&self, _event: &str, _payload: Value) {}
    fn on(&self, _event: &str, _handler: EventHandler) {}
    fn off(&self, _event: &str) {}
}

/// In-process loopback transport.
///
/// Records emitted payloads and lets the caller deliver inbound events to
/// registered handlers. Used by the crate's own tests and convenient for
/// consumers testing against a scripted server.
#[derive(Default)]
pub struct MemoryTransport {
    handlers: Mutex<HashMap<String, EventHandler>>,
    sent: Mutex<Vec<(String, Value)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an inbound event to its registered handler, if any.
    /// Returns whether a handler saw it.
    pub fn deliver(&self, event: &str, payload: Value) -> bool {
        // clone the handler out so it may call `on`/`off` without deadlock
        let handler = mutex_lock(&self.handlers, SOURCE, "deliver")
            .get(event)
            .cloned();
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => false,
        }
    }

    /// Everything emitted so far, oldest first.
    pub fn sent(&self) -> Vec<(String, Value)> {
        mutex_lock(&self.sent, SOURCE, "sent").clone()
    }

    /// Drain everything emitted so far.
    pub fn take_sent(&self) -> Vec<(String, Value)> {
        mutex_lock(&self.sent, SOURCE, "take_sent")
            .drain(..)
            .collect()
    }

    pub fn has_listener(&self, event: &str) -> bool {
        mutex_lock(&self.handlers, SOURCE, "has_listener").contains_key(event)
    }

    pub fn listener_count(&self) -> usize {
        mutex_lock(&self.handlers, SOURCE, "listener_count").len()
    }
}

impl Transport for MemoryTransport {
    fn emit(&self, event: &str, payload: Value) {
        mutex_lock(&self.sent, SOURCE, "emit").push((event.to_string(), payload));
    }

    fn on(&self, event: &str, handler: EventHandler) {
        mutex_lock(&self.handlers, SOURCE, "on").insert(event.to_string(), handler);
    }

    fn off(&self, event: &str) {
        mutex_lock(&self.handlers, SOURCE, "off").remove(event);
    }
}
