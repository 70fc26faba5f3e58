//! Metrics for the synchronization subsystem
//!
//! Everything is recorded through the `metrics` facade. Without an
//! installed recorder the calls are no-ops; the binary decides whether and
//! how to export them.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

use crate::core_sync::session::OfflineReason;

pub const UPDATES_APPLIED: &str = "sync.updates.applied";
pub const UPDATES_STALE: &str = "sync.updates.stale";
pub const UPDATES_GAP: &str = "sync.updates.gap";
pub const FULL_RESYNCS: &str = "sync.resync.full";
pub const STREAM_MESSAGES: &str = "sync.stream.messages";
pub const STREAM_FAILURES: &str = "sync.stream.failures";
pub const RECONNECT_ATTEMPTS: &str = "sync.stream.reconnects";
pub const OFFLINE_TRANSITIONS: &str = "sync.offline";
pub const THROTTLE_FLUSHES: &str = "sync.throttle.flushes";
pub const THROTTLE_MERGED: &str = "sync.throttle.merged_updates";
pub const DECODE_DROPPED: &str = "sync.decode.dropped";
pub const COMMIT_DURATION: &str = "sync.commit.duration_ms";

/// Register metric descriptions
pub fn init_metrics() {
    describe_counter!(UPDATES_APPLIED, "Incremental updates applied to the store");
    describe_counter!(UPDATES_STALE, "Updates dropped because the store was already ahead");
    describe_counter!(UPDATES_GAP, "Updates that revealed a gap and caused a resync request");
    describe_counter!(FULL_RESYNCS, "Full snapshots applied");
    describe_counter!(STREAM_MESSAGES, "Messages decoded from streaming connections");
    describe_counter!(STREAM_FAILURES, "Streaming connection failures");
    describe_counter!(RECONNECT_ATTEMPTS, "Stream reconnect attempts after backoff");
    describe_counter!(OFFLINE_TRANSITIONS, "Transitions to offline, labelled by reason");
    describe_counter!(THROTTLE_FLUSHES, "Throttle queue flushes");
    describe_counter!(THROTTLE_MERGED, "Updates folded into throttle flushes");
    describe_counter!(DECODE_DROPPED, "Records dropped by the decoder registry");
    describe_histogram!(COMMIT_DURATION, "Duration of one store commit in milliseconds");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record an offline transition
pub fn record_offline(reason: OfflineReason) {
    counter!(OFFLINE_TRANSITIONS, "reason" => reason.as_str()).increment(1);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}
