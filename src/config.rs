//! Store configuration.

use std::time::Duration;

use serde::Deserialize;

// Default values for store configuration
const DEFAULT_FEED_BUFFER: usize = 64;
const DEFAULT_VALUE_BUFFER: usize = 16;
const DEFAULT_CALL_SETTLE_DELAY_MS: u64 = 1;

/// Configuration for a [`CacheStore`](crate::CacheStore).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Buffered change payloads per shared feed listener before a slow
    /// subscriber starts lagging.
    pub feed_buffer: usize,
    /// Buffered combined values per cache entry.
    pub value_buffer: usize,
    /// Delay inserted after a successful `call` before it settles, so the
    /// post-mutation sweep runs first and a stream issued immediately
    /// afterwards does not race it.
    pub call_settle_delay_ms: u64,
    /// Whether invalidation is permitted. Disabled during a server-side
    /// render pass, where the cache must stay frozen for one render.
    pub allow_invalidation: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            feed_buffer: DEFAULT_FEED_BUFFER,
            value_buffer: DEFAULT_VALUE_BUFFER,
            call_settle_delay_ms: DEFAULT_CALL_SETTLE_DELAY_MS,
            allow_invalidation: true,
        }
    }
}

impl StoreConfig {
    pub fn call_settle_delay(&self) -> Duration {
        Duration::from_millis(self.call_settle_delay_ms)
    }

    /// Feed buffer clamped to at least one slot.
    pub fn feed_buffer_non_zero(&self) -> usize {
        self.feed_buffer.max(1)
    }

    /// Value buffer clamped to at least one slot.
    pub fn value_buffer_non_zero(&self) -> usize {
        self.value_buffer.max(1)
    }
}
