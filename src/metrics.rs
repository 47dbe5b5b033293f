// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

/// Initializes the descriptions for all the metrics in the application.
/// This should be called once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "cache_hits_total",
        Unit::Count,
        "Cache hits, labeled by cache name."
    );
    describe_counter!(
        "cache_miss_total",
        Unit::Count,
        "Cache misses, labeled by cache name."
    );
    describe_gauge!("cache_size_gauge", "Current number of entries, labeled by cache name.");

    describe_counter!(
        "sync_fetches_total",
        Unit::Count,
        "Value fetches issued by the batch synchronizer, labeled by result (ok, failed)."
    );
    describe_counter!(
        "sync_fetches_deduplicated_total",
        Unit::Count,
        "Slots skipped because a fetch for them was already in flight."
    );
    describe_histogram!(
        "sync_batch_size",
        "Number of slots fetched per block batch."
    );
    describe_histogram!(
        "sync_batch_duration_ms",
        "Time from scan start to merge completion for one block batch, in milliseconds."
    );
    describe_counter!(
        "sync_merge_outcomes_total",
        Unit::Count,
        "Per-slot merge outcomes (applied, regressed, retained_previous, unresolved)."
    );
    describe_gauge!("sync_last_block", "Last block number processed, labeled by scope.");

    describe_gauge!("state_store_version", "Version of the current state snapshot.");
    describe_counter!(
        "state_store_rejected_transitions_total",
        Unit::Count,
        "Transitions rejected by the state store, labeled by reason."
    );
    describe_gauge!("listener_active_slots", "Slots with at least one listener.");
    describe_counter!(
        "listener_underflow_total",
        Unit::Count,
        "stop_listening calls on slots that had no listeners."
    );

    describe_histogram!("multicall_batch_size_bucket", "Calls per multicall chunk.");
    describe_counter!(
        "multicall_fallback_total",
        Unit::Count,
        "Multicall aggregate failures that fell back to per-value fetches."
    );

    describe_counter!(
        "persistence_writes_total",
        Unit::Count,
        "Persistence writes, labeled by key and result."
    );
    describe_counter!(
        "persistence_discarded_total",
        Unit::Count,
        "Persisted documents discarded at load, labeled by key and reason."
    );

    describe_counter!(
        "blockstream_blocks_published_total",
        Unit::Count,
        "Blocks published to the block stream."
    );
    describe_gauge!(
        "blockstream_active_subscribers",
        "Active subscribers on the block stream."
    );
}

// --- Helper functions to update metrics ---

pub fn increment_cache_hit(cache_name: &str) {
    counter!("cache_hits_total", 1, "cache" => cache_name.to_string());
}

pub fn increment_cache_miss(cache_name: &str) {
    counter!("cache_miss_total", 1, "cache" => cache_name.to_string());
}

pub fn set_cache_size(cache_name: &str, size: f64) {
    gauge!("cache_size_gauge", size, "cache" => cache_name.to_string());
}

pub fn increment_sync_fetches(result: &'static str, count: u64) {
    counter!("sync_fetches_total", count, "result" => result);
}

pub fn increment_sync_deduplicated(count: u64) {
    counter!("sync_fetches_deduplicated_total", count);
}

pub fn record_sync_batch(size: usize, duration: std::time::Duration) {
    histogram!("sync_batch_size", size as f64);
    histogram!("sync_batch_duration_ms", duration.as_secs_f64() * 1000.0);
}

pub fn increment_merge_outcome(outcome: &'static str, count: u64) {
    counter!("sync_merge_outcomes_total", count, "outcome" => outcome);
}

pub fn set_sync_last_block(scope: u64, block: u64) {
    gauge!("sync_last_block", block as f64, "scope" => scope.to_string());
}

pub fn set_state_store_version(version: u64) {
    gauge!("state_store_version", version as f64);
}

pub fn increment_rejected_transition(reason: &'static str) {
    increment_counter!("state_store_rejected_transitions_total", "reason" => reason);
}

pub fn set_listener_active_slots(count: usize) {
    gauge!("listener_active_slots", count as f64);
}

pub fn increment_listener_underflow() {
    increment_counter!("listener_underflow_total");
}

pub fn record_multicall_batch_size(size: f64) {
    histogram!("multicall_batch_size_bucket", size);
}

pub fn increment_multicall_fallback() {
    increment_counter!("multicall_fallback_total");
}

pub fn increment_persistence_write(key: &str, result: &'static str) {
    increment_counter!("persistence_writes_total", "key" => key.to_string(), "result" => result);
}

pub fn increment_persistence_discarded(key: &str, reason: &'static str) {
    increment_counter!("persistence_discarded_total", "key" => key.to_string(), "reason" => reason);
}

pub fn increment_blockstream_blocks_published() {
    increment_counter!("blockstream_blocks_published_total");
}

pub fn set_blockstream_active_subscribers(count: f64) {
    gauge!("blockstream_active_subscribers", count);
}
