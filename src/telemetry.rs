//! Metric descriptions for the counters this crate emits.

use std::sync::Once;

use metrics::{Unit, describe_counter};

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Describe every metric the cache emits. Idempotent; called once on store
/// construction, safe to call again from the consumer's telemetry setup.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "rivo_cache_hit_total",
            Unit::Count,
            "Total number of stream requests answered from an existing cache entry."
        );
        describe_counter!(
            "rivo_cache_miss_total",
            Unit::Count,
            "Total number of stream requests that created a new cache entry."
        );
        describe_counter!(
            "rivo_batch_flush_total",
            Unit::Count,
            "Total number of outbound request batches flushed."
        );
        describe_counter!(
            "rivo_change_event_total",
            Unit::Count,
            "Total number of change payloads received on feed listeners."
        );
        describe_counter!(
            "rivo_invalidate_all_total",
            Unit::Count,
            "Total number of invalidate-all sweeps executed."
        );
        describe_counter!(
            "rivo_feed_lagged_total",
            Unit::Count,
            "Total number of change payloads skipped by lagging subscribers."
        );
        describe_counter!(
            "rivo_response_unmatched_total",
            Unit::Count,
            "Total number of batch responses dropped for an unknown stream id."
        );
    });
}
