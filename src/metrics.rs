//! Metrics for the transaction state manager
//!
//! When the `metrics` feature is disabled, all functions become no-ops,
//! allowing the code to compile without the metrics dependency while
//! maintaining the same API surface.

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

/// Record the time taken to load one shard of the transaction state log
#[cfg(feature = "metrics")]
pub fn record_partition_load(partition: i32, duration_ms: u64) {
    histogram!(
        "streamline_transaction_partition_load_time_ms",
        "partition" => partition.to_string()
    )
    .record(duration_ms as f64);
}

/// Record transactional ids removed by an expiration sweep
#[cfg(feature = "metrics")]
pub fn record_expired_transactional_ids(partition: i32, count: u64) {
    counter!(
        "streamline_transaction_expired_ids_total",
        "partition" => partition.to_string()
    )
    .increment(count);
}

/// Record a failed append to the transaction state log
#[cfg(feature = "metrics")]
pub fn record_append_failure(error: &'static str) {
    counter!(
        "streamline_transaction_log_append_failures_total",
        "error" => error
    )
    .increment(1);
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_partition_load(_partition: i32, _duration_ms: u64) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_expired_transactional_ids(_partition: i32, _count: u64) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_append_failure(_error: &'static str) {}
