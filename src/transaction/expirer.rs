//! Removal of idle transactional ids
//!
//! A sweep walks every owned shard, picks transactional ids that finished
//! their last transaction (or never started one) and have been idle for at
//! least the configured expiration time, and writes a tombstone for each.
//! Selected ids are marked with a pending `Dead` transition under the shard
//! lock, so no writer can start a transition on them while their tombstones
//! are in flight. Tombstones are packed into batches that stay below the
//! shard's maximum batch size.

use crate::clock::Clock;
use crate::error::StoreError;
use crate::metrics;
use crate::transaction::cache::TransactionMetadataCache;
use crate::transaction::log::{tombstone_record, RecordBatchBuilder};
use crate::transaction::stats::TransactionStateStats;
use crate::transaction::store::TransactionLogStore;
use crate::transaction::state::TxnTransitMetadata;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Result of one expiration sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirationSummary {
    /// Tombstone batches appended (successfully or not)
    pub batches: usize,
    /// Transactional ids removed from the cache
    pub removed: usize,
    /// Transactional ids whose tombstone could not be written
    pub failed: usize,
}

type ExpiredId = (String, TxnTransitMetadata);

/// Periodically removes expired transactional ids
pub struct TransactionalIdExpirer {
    cache: Arc<TransactionMetadataCache>,
    store: Arc<dyn TransactionLogStore>,
    clock: Arc<dyn Clock>,
    stats: Arc<TransactionStateStats>,
    expiration_ms: i64,
}

impl TransactionalIdExpirer {
    pub fn new(
        cache: Arc<TransactionMetadataCache>,
        store: Arc<dyn TransactionLogStore>,
        clock: Arc<dyn Clock>,
        stats: Arc<TransactionStateStats>,
        expiration_ms: i64,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            stats,
            expiration_ms,
        }
    }

    /// Run one sweep over all owned shards
    pub async fn sweep(&self) -> ExpirationSummary {
        let now_ms = self.clock.now_ms();
        let mut summary = ExpirationSummary::default();

        for partition in 0..self.cache.num_partitions() as i32 {
            let Some(max_batch_size) = self.store.max_batch_size(partition) else {
                debug!(
                    partition,
                    "Skipping expiration, max batch size of transaction log is unavailable"
                );
                continue;
            };
            let Some((coordinator_epoch, expired)) = self.mark_expired(partition, now_ms) else {
                continue;
            };
            if expired.is_empty() {
                continue;
            }

            let shard_summary = self
                .expire_shard(partition, coordinator_epoch, max_batch_size, expired, now_ms)
                .await;
            summary.batches += shard_summary.batches;
            summary.removed += shard_summary.removed;
            summary.failed += shard_summary.failed;
        }

        if summary.removed > 0 || summary.failed > 0 {
            info!(
                removed = summary.removed,
                failed = summary.failed,
                batches = summary.batches,
                "Finished expiring transactional ids"
            );
        }
        summary
    }

    /// Select expirable ids of an owned shard and mark them `Dead`
    fn mark_expired(&self, partition: i32, now_ms: i64) -> Option<(i32, Vec<ExpiredId>)> {
        let mut shard = self.cache.lock_shard(partition)?;
        if shard.is_loading() {
            return None;
        }
        let entry = shard.entry.as_mut()?;

        let mut expired = Vec::new();
        for (transactional_id, metadata) in entry.metadata_per_transactional_id.iter_mut() {
            if !metadata.state.is_expiration_allowed()
                || metadata.pending_transition_in_progress()
                || now_ms - metadata.txn_last_update_timestamp_ms < self.expiration_ms
            {
                continue;
            }
            match metadata.prepare_dead() {
                Ok(transit) => expired.push((transactional_id.clone(), transit)),
                Err(e) => warn!(
                    transactional_id = %transactional_id,
                    error = %e,
                    "Cannot mark transactional id for expiration"
                ),
            }
        }
        expired.sort_by(|a, b| a.0.cmp(&b.0));
        Some((entry.coordinator_epoch, expired))
    }

    async fn expire_shard(
        &self,
        partition: i32,
        coordinator_epoch: i32,
        max_batch_size: usize,
        expired: Vec<ExpiredId>,
        now_ms: i64,
    ) -> ExpirationSummary {
        let mut summary = ExpirationSummary::default();
        let mut batches = Vec::new();
        let mut builder = RecordBatchBuilder::new(max_batch_size);
        let mut batch_ids: Vec<ExpiredId> = Vec::new();

        for (transactional_id, transit) in expired {
            let record = match tombstone_record(&transactional_id, now_ms) {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        transactional_id = %transactional_id,
                        error = %e,
                        "Cannot encode tombstone"
                    );
                    self.release(partition, coordinator_epoch, &[(transactional_id, transit)]);
                    summary.failed += 1;
                    continue;
                }
            };
            if !builder.has_room_for(&record) {
                let full = std::mem::replace(&mut builder, RecordBatchBuilder::new(max_batch_size));
                batches.push((full.build(), std::mem::take(&mut batch_ids)));
            }
            builder.push(record);
            batch_ids.push((transactional_id, transit));
        }
        if !builder.is_empty() {
            batches.push((builder.build(), batch_ids));
        }

        for (records, ids) in batches {
            summary.batches += 1;
            let (tx, rx) = oneshot::channel();
            self.store.append(
                partition,
                records,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );
            let result = rx.await.unwrap_or_else(|_| {
                Err(StoreError::StorageFailure(
                    "append completion dropped".to_string(),
                ))
            });

            match result {
                Ok(_) => {
                    let removed = self.remove(partition, coordinator_epoch, &ids);
                    self.stats.record_expired(removed as u64);
                    metrics::record_expired_transactional_ids(partition, removed as u64);
                    summary.removed += removed;
                }
                Err(e) => {
                    warn!(
                        partition,
                        coordinator_epoch,
                        count = ids.len(),
                        error = %e,
                        "Failed to write tombstones for expired transactional ids"
                    );
                    self.stats.record_append_failure();
                    metrics::record_append_failure(e.to_coordinator_error().as_str());
                    self.release(partition, coordinator_epoch, &ids);
                    summary.failed += ids.len();
                }
            }
        }
        summary
    }

    /// Drop ids whose tombstone was written and which are still marked `Dead`
    fn remove(&self, partition: i32, coordinator_epoch: i32, ids: &[ExpiredId]) -> usize {
        let Some(mut shard) = self.cache.lock_shard(partition) else {
            return 0;
        };
        let Some(entry) = shard.entry_at(coordinator_epoch) else {
            return 0;
        };

        let mut removed = 0;
        for (transactional_id, transit) in ids {
            let still_dead = entry
                .metadata_per_transactional_id
                .get(transactional_id)
                .is_some_and(|m| m.pending_state.as_ref() == Some(transit));
            if still_dead {
                entry.metadata_per_transactional_id.remove(transactional_id);
                debug!(partition, transactional_id = %transactional_id, "Removed expired transactional id");
                removed += 1;
            }
        }
        removed
    }

    /// Undo the `Dead` marker so the ids are considered again next sweep
    fn release(&self, partition: i32, coordinator_epoch: i32, ids: &[ExpiredId]) {
        let Some(mut shard) = self.cache.lock_shard(partition) else {
            return;
        };
        let Some(entry) = shard.entry_at(coordinator_epoch) else {
            return;
        };
        for (transactional_id, transit) in ids {
            if let Some(metadata) = entry.metadata_per_transactional_id.get_mut(transactional_id) {
                if metadata.pending_state.as_ref() == Some(transit) {
                    metadata.pending_state = None;
                }
            }
        }
    }
}
