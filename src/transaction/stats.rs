//! Counters for the transaction state manager

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`TransactionStateStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStateStatsSnapshot {
    pub partitions_loaded: u64,
    pub partition_load_time_ms: u64,
    pub partition_loads_failed: u64,
    pub transactional_ids_expired: u64,
    pub append_failures: u64,
}

/// Statistics for shard loading, expiration and log appends
#[derive(Debug, Default)]
pub struct TransactionStateStats {
    /// Shards installed by the loader
    pub partitions_loaded: AtomicU64,
    /// Total time spent loading installed shards (ms)
    pub partition_load_time_ms: AtomicU64,
    /// Loads aborted by a store read error
    pub partition_loads_failed: AtomicU64,
    /// Transactional ids removed by expiration sweeps
    pub transactional_ids_expired: AtomicU64,
    /// Failed transition or tombstone appends
    pub append_failures: AtomicU64,
}

impl TransactionStateStats {
    pub fn record_partition_load(&self, duration_ms: u64) {
        self.partitions_loaded.fetch_add(1, Ordering::Relaxed);
        self.partition_load_time_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_partition_load_failure(&self) {
        self.partition_loads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: u64) {
        self.transactional_ids_expired
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_append_failure(&self) {
        self.append_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransactionStateStatsSnapshot {
        TransactionStateStatsSnapshot {
            partitions_loaded: self.partitions_loaded.load(Ordering::Relaxed),
            partition_load_time_ms: self.partition_load_time_ms.load(Ordering::Relaxed),
            partition_loads_failed: self.partition_loads_failed.load(Ordering::Relaxed),
            transactional_ids_expired: self.transactional_ids_expired.load(Ordering::Relaxed),
            append_failures: self.append_failures.load(Ordering::Relaxed),
        }
    }
}
