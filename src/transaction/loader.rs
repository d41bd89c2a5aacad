//! Replay of the transaction state log into the cache
//!
//! Loading a shard is a two-step affair. [`TransactionLogLoader::load_shard`]
//! records the loading marker synchronously, so that the shard immediately
//! answers `CoordinatorLoadInProgress` and a detach issued right after can
//! invalidate the load. The replay itself runs on the runtime: records are
//! read from the log start offset up to the end offset observed when the
//! replay started, folded into a scratch map, and installed only if the
//! marker still belongs to this load.

use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::transaction::cache::TransactionMetadataCache;
use crate::transaction::log::{read_key, read_value, LogRecord, TxnRecordKey};
use crate::transaction::stats::TransactionStateStats;
use crate::transaction::store::TransactionLogStore;
use crate::transaction::state::{
    TransactionMetadata, TransactionResult, TransactionState, TxnTransitMetadata,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Invoked for every loaded transaction whose outcome was already decided
///
/// Arguments: transactional id, coordinator epoch, outcome, metadata (with
/// the completion already pending) and the pending completion transition.
/// The receiver is expected to send the transaction markers and then append
/// the completion transition.
pub type MarkerRecoveryCallback = Arc<
    dyn Fn(&str, i32, TransactionResult, &TransactionMetadata, &TxnTransitMetadata)
        + Send
        + Sync,
>;

/// How a load ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The replayed state was installed
    Installed {
        num_transactions: usize,
        duration_ms: u64,
    },
    /// The shard already knows a higher coordinator epoch
    Stale,
    /// A detach or newer load invalidated this load
    Discarded,
    /// The log could not be read; the shard is left unowned
    Failed(StoreError),
}

struct PendingRecovery {
    transactional_id: String,
    result: TransactionResult,
    metadata: TransactionMetadata,
    transit: TxnTransitMetadata,
}

/// Loads shards of the transaction state log
pub struct TransactionLogLoader {
    cache: Arc<TransactionMetadataCache>,
    store: Arc<dyn TransactionLogStore>,
    clock: Arc<dyn Clock>,
    stats: Arc<TransactionStateStats>,
    load_buffer_size: usize,
    runtime: Handle,
}

impl TransactionLogLoader {
    pub fn new(
        cache: Arc<TransactionMetadataCache>,
        store: Arc<dyn TransactionLogStore>,
        clock: Arc<dyn Clock>,
        stats: Arc<TransactionStateStats>,
        load_buffer_size: usize,
        runtime: Handle,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            stats,
            load_buffer_size,
            runtime,
        }
    }

    /// Start loading `partition` at `coordinator_epoch`
    ///
    /// The loading marker is in place when this returns.
    pub fn load_shard(
        &self,
        partition: i32,
        coordinator_epoch: i32,
        on_recovery: MarkerRecoveryCallback,
    ) -> JoinHandle<LoadOutcome> {
        if partition < 0 || partition as u32 >= self.cache.num_partitions() {
            warn!(
                partition,
                coordinator_epoch, "Cannot load unknown transaction log partition"
            );
            return self.runtime.spawn(async move {
                LoadOutcome::Failed(StoreError::UnknownTopicOrPartition(partition))
            });
        }

        if !self.cache.mark_loading(partition, coordinator_epoch) {
            warn!(
                partition,
                coordinator_epoch, "Ignoring load of transaction log partition at stale epoch"
            );
            return self.runtime.spawn(async { LoadOutcome::Stale });
        }

        info!(
            partition,
            coordinator_epoch, "Loading transaction metadata from transaction log"
        );

        let job = LoadJob {
            cache: Arc::clone(&self.cache),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            stats: Arc::clone(&self.stats),
            load_buffer_size: self.load_buffer_size,
            partition,
            coordinator_epoch,
        };
        self.runtime.spawn(job.run(on_recovery))
    }
}

struct LoadJob {
    cache: Arc<TransactionMetadataCache>,
    store: Arc<dyn TransactionLogStore>,
    clock: Arc<dyn Clock>,
    stats: Arc<TransactionStateStats>,
    load_buffer_size: usize,
    partition: i32,
    coordinator_epoch: i32,
}

impl LoadJob {
    async fn run(self, on_recovery: MarkerRecoveryCallback) -> LoadOutcome {
        let partition = self.partition;
        let coordinator_epoch = self.coordinator_epoch;
        let started = Instant::now();

        let scratch = match self.replay().await {
            Ok(Some(scratch)) => scratch,
            Ok(None) => {
                info!(
                    partition,
                    coordinator_epoch, "Transaction log load was invalidated during replay"
                );
                return LoadOutcome::Discarded;
            }
            Err(e) => {
                error!(
                    partition,
                    coordinator_epoch,
                    error = %e,
                    "Failed to load transaction metadata"
                );
                self.abandon();
                self.stats.record_partition_load_failure();
                return LoadOutcome::Failed(e);
            }
        };

        let Some((num_transactions, recoveries)) = self.install(scratch) else {
            info!(
                partition,
                coordinator_epoch, "Discarding loaded transaction metadata for invalidated load"
            );
            return LoadOutcome::Discarded;
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.stats.record_partition_load(duration_ms);
        metrics::record_partition_load(partition, duration_ms);
        info!(
            partition,
            coordinator_epoch,
            num_transactions,
            duration_ms,
            "Finished loading transaction metadata"
        );

        for recovery in recoveries {
            debug!(
                transactional_id = %recovery.transactional_id,
                result = ?recovery.result,
                "Completing transaction decided before coordinator failover"
            );
            on_recovery(
                &recovery.transactional_id,
                coordinator_epoch,
                recovery.result,
                &recovery.metadata,
                &recovery.transit,
            );
        }

        LoadOutcome::Installed {
            num_transactions,
            duration_ms,
        }
    }

    /// Fold the log into a scratch map; `None` if the load was invalidated
    async fn replay(&self) -> StoreResult<Option<HashMap<String, TransactionMetadata>>> {
        let partition = self.partition;
        let (Some(start_offset), Some(end_offset)) = (
            self.store.log_start_offset(partition),
            self.store.log_end_offset(partition),
        ) else {
            return Err(StoreError::UnknownTopicOrPartition(partition));
        };

        let mut scratch = HashMap::new();
        let mut offset = start_offset;
        while offset < end_offset {
            if !self.cache.is_loading_at(partition, self.coordinator_epoch) {
                return Ok(None);
            }

            let fetched = self
                .store
                .read(partition, offset, self.load_buffer_size)
                .await?;
            let Some(next_offset) = fetched.next_offset() else {
                break;
            };

            for fetched_record in fetched.records {
                if fetched_record.offset >= end_offset {
                    break;
                }
                apply_record(
                    &mut scratch,
                    partition,
                    fetched_record.offset,
                    &fetched_record.record,
                );
            }
            offset = next_offset;
        }

        debug!(
            partition,
            start_offset,
            end_offset,
            num_transactions = scratch.len(),
            "Replayed transaction log"
        );
        Ok(Some(scratch))
    }

    /// Install the scratch map and prepare completions of decided transactions
    fn install(
        &self,
        scratch: HashMap<String, TransactionMetadata>,
    ) -> Option<(usize, Vec<PendingRecovery>)> {
        let mut shard = self.cache.lock_shard(self.partition)?;
        if !shard.install(self.coordinator_epoch, scratch) {
            return None;
        }

        let now_ms = self.clock.now_ms();
        let entry = shard.entry_at(self.coordinator_epoch)?;
        let mut recoveries = Vec::new();
        for (transactional_id, metadata) in entry.metadata_per_transactional_id.iter_mut() {
            let result = match metadata.state {
                TransactionState::PrepareCommit => TransactionResult::Commit,
                TransactionState::PrepareAbort => TransactionResult::Abort,
                _ => continue,
            };
            match metadata.prepare_complete(now_ms) {
                Ok(transit) => recoveries.push(PendingRecovery {
                    transactional_id: transactional_id.clone(),
                    result,
                    metadata: metadata.clone(),
                    transit,
                }),
                Err(e) => warn!(
                    transactional_id = %transactional_id,
                    error = %e,
                    "Cannot prepare completion of loaded transaction"
                ),
            }
        }
        Some((entry.metadata_per_transactional_id.len(), recoveries))
    }

    /// Drop the marker and any older state if this load is still current
    fn abandon(&self) {
        if let Some(mut shard) = self.cache.lock_shard(self.partition) {
            if shard.loading_epoch == Some(self.coordinator_epoch) {
                shard.loading_epoch = None;
                shard.entry = None;
            }
        }
    }
}

fn apply_record(
    scratch: &mut HashMap<String, TransactionMetadata>,
    partition: i32,
    offset: i64,
    record: &LogRecord,
) {
    let transactional_id = match read_key(&record.key) {
        Ok(TxnRecordKey::Transaction(id)) => id,
        Ok(TxnRecordKey::Unknown(version)) => {
            warn!(
                partition,
                offset, version, "Skipping transaction log record with unknown key version"
            );
            return;
        }
        Err(e) => {
            warn!(partition, offset, error = %e, "Skipping undecodable transaction log key");
            return;
        }
    };

    match read_value(&transactional_id, record.value.as_deref()) {
        Ok(Some(metadata)) => {
            scratch.insert(transactional_id, metadata);
        }
        Ok(None) => {
            scratch.remove(&transactional_id);
        }
        Err(e) => warn!(
            partition,
            offset,
            transactional_id = %transactional_id,
            error = %e,
            "Skipping undecodable transaction log value"
        ),
    }
}
