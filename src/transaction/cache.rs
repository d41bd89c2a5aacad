//! Sharded in-memory cache of transaction metadata
//!
//! The cache holds one [`Shard`] per partition of the transaction state log.
//! Each shard has its own lock, its ownership epoch and an optional loading
//! marker, so ownership changes, loads, appends and expiration on different
//! shards never contend with each other.
//!
//! # Ownership
//!
//! A shard answers requests only when it has been installed by the loader
//! (or a test) at some coordinator epoch and no load is outstanding:
//!
//! ```text
//! unowned ──load_shard(E)──> loading(E) ──install──> owned(E)
//!    ^                          │                      │
//!    └───────detach_shard───────┴──────────────────────┘
//! ```
//!
//! A higher epoch always supersedes a lower one; marking or detaching with
//! an epoch below the shard's current epoch is ignored as stale.

use crate::error::{CoordinatorError, Result, TxnStateError};
use crate::transaction::partitioner::partition_for;
use crate::transaction::state::TransactionMetadata;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Metadata paired with the coordinator epoch its shard was loaded at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorEpochAndTxnMetadata {
    pub coordinator_epoch: i32,
    pub metadata: TransactionMetadata,
}

/// Loaded contents of one shard
#[derive(Debug, Default)]
pub struct TxnMetadataCacheEntry {
    pub coordinator_epoch: i32,
    pub metadata_per_transactional_id: HashMap<String, TransactionMetadata>,
    /// Ids with a log append submitted and not yet completed
    pub(crate) appends_in_flight: HashSet<String>,
}

/// State of one partition of the transaction state log
#[derive(Debug, Default)]
pub struct Shard {
    /// Epoch of the outstanding load, if any
    pub(crate) loading_epoch: Option<i32>,
    pub(crate) entry: Option<TxnMetadataCacheEntry>,
}

impl Shard {
    /// Highest epoch this shard knows about, loading or loaded
    pub(crate) fn current_epoch(&self) -> Option<i32> {
        let loaded = self.entry.as_ref().map(|e| e.coordinator_epoch);
        match (self.loading_epoch, loaded) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn is_loading(&self) -> bool {
        self.loading_epoch.is_some()
    }

    /// Loaded entry, failing the way request handlers expect
    pub(crate) fn serving_entry(
        &mut self,
    ) -> std::result::Result<&mut TxnMetadataCacheEntry, CoordinatorError> {
        if self.is_loading() {
            return Err(CoordinatorError::CoordinatorLoadInProgress);
        }
        self.entry.as_mut().ok_or(CoordinatorError::NotCoordinator)
    }

    /// Loaded entry if it is owned at exactly `epoch`
    pub(crate) fn entry_at(&mut self, epoch: i32) -> Option<&mut TxnMetadataCacheEntry> {
        self.entry
            .as_mut()
            .filter(|entry| entry.coordinator_epoch == epoch)
    }

    /// Replace the loaded entry if the loading marker is exactly `epoch`
    pub(crate) fn install(
        &mut self,
        epoch: i32,
        entries: HashMap<String, TransactionMetadata>,
    ) -> bool {
        if self.loading_epoch != Some(epoch) {
            return false;
        }
        self.loading_epoch = None;
        self.entry = Some(TxnMetadataCacheEntry {
            coordinator_epoch: epoch,
            metadata_per_transactional_id: entries,
            appends_in_flight: HashSet::new(),
        });
        true
    }
}

/// Transaction metadata cache, sharded by transaction state log partition
pub struct TransactionMetadataCache {
    num_partitions: u32,
    shards: Vec<Mutex<Shard>>,
}

impl TransactionMetadataCache {
    /// Create a cache for `num_partitions` shards, all unowned
    pub fn new(num_partitions: u32) -> Result<Self> {
        if num_partitions == 0 {
            return Err(TxnStateError::Config(
                "transaction state log must have at least one partition".to_string(),
            ));
        }
        Ok(Self {
            num_partitions,
            shards: (0..num_partitions)
                .map(|_| Mutex::new(Shard::default()))
                .collect(),
        })
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    /// Shard index owning `transactional_id`
    pub fn partition_for(&self, transactional_id: &str) -> i32 {
        partition_for(transactional_id, self.num_partitions)
    }

    /// Lock the shard for `partition`; `None` if the partition does not exist
    pub(crate) fn lock_shard(&self, partition: i32) -> Option<MutexGuard<'_, Shard>> {
        usize::try_from(partition)
            .ok()
            .and_then(|idx| self.shards.get(idx))
            .map(|shard| shard.lock())
    }

    fn lock_shard_for(&self, transactional_id: &str) -> MutexGuard<'_, Shard> {
        let idx = self.partition_for(transactional_id) as usize;
        self.shards[idx].lock()
    }

    /// Iterate `(partition, shard)` pairs
    pub(crate) fn shards(&self) -> impl Iterator<Item = (i32, &Mutex<Shard>)> {
        self.shards
            .iter()
            .enumerate()
            .map(|(idx, shard)| (idx as i32, shard))
    }

    /// Look up the metadata for a transactional id
    pub fn get_state(
        &self,
        transactional_id: &str,
    ) -> std::result::Result<Option<CoordinatorEpochAndTxnMetadata>, CoordinatorError> {
        let mut shard = self.lock_shard_for(transactional_id);
        let entry = shard.serving_entry()?;
        Ok(entry
            .metadata_per_transactional_id
            .get(transactional_id)
            .map(|metadata| CoordinatorEpochAndTxnMetadata {
                coordinator_epoch: entry.coordinator_epoch,
                metadata: metadata.clone(),
            }))
    }

    /// Insert `metadata` unless its transactional id is already present
    ///
    /// Returns whatever is cached afterwards, i.e. the existing entry when
    /// one was present.
    pub fn put_if_absent(
        &self,
        metadata: TransactionMetadata,
    ) -> std::result::Result<CoordinatorEpochAndTxnMetadata, CoordinatorError> {
        let mut shard = self.lock_shard_for(&metadata.transactional_id);
        let entry = shard.serving_entry()?;
        let coordinator_epoch = entry.coordinator_epoch;
        let cached = entry
            .metadata_per_transactional_id
            .entry(metadata.transactional_id.clone())
            .or_insert(metadata);
        Ok(CoordinatorEpochAndTxnMetadata {
            coordinator_epoch,
            metadata: cached.clone(),
        })
    }

    /// Run `f` against the live metadata under the shard lock
    ///
    /// Fails with `NotCoordinator` unless the shard is owned at exactly
    /// `coordinator_epoch` and holds the transactional id.
    pub fn update<R>(
        &self,
        transactional_id: &str,
        coordinator_epoch: i32,
        f: impl FnOnce(&mut TransactionMetadata) -> Result<R>,
    ) -> Result<R> {
        let mut shard = self.lock_shard_for(transactional_id);
        let entry = shard.serving_entry()?;
        if entry.coordinator_epoch != coordinator_epoch {
            return Err(CoordinatorError::NotCoordinator.into());
        }
        let metadata = entry
            .metadata_per_transactional_id
            .get_mut(transactional_id)
            .ok_or(CoordinatorError::NotCoordinator)?;
        f(metadata)
    }

    /// Record that a load of `partition` at `epoch` is outstanding
    ///
    /// Returns false if the shard already knows a higher epoch.
    pub fn mark_loading(&self, partition: i32, epoch: i32) -> bool {
        let Some(mut shard) = self.lock_shard(partition) else {
            return false;
        };
        if let Some(current) = shard.current_epoch() {
            if epoch < current {
                return false;
            }
        }
        shard.loading_epoch = Some(epoch);
        true
    }

    /// Check if the load of `partition` at `epoch` is still the relevant one
    pub fn is_loading_at(&self, partition: i32, epoch: i32) -> bool {
        self.lock_shard(partition)
            .map(|shard| shard.loading_epoch == Some(epoch))
            .unwrap_or(false)
    }

    /// Clear the loading marker if it still belongs to `epoch`
    pub fn clear_loading(&self, partition: i32, epoch: i32) {
        if let Some(mut shard) = self.lock_shard(partition) {
            if shard.loading_epoch == Some(epoch) {
                shard.loading_epoch = None;
            }
        }
    }

    /// Atomically replace the shard contents if the load at `epoch` is
    /// still outstanding
    pub fn install_shard(
        &self,
        partition: i32,
        epoch: i32,
        entries: HashMap<String, TransactionMetadata>,
    ) -> bool {
        self.lock_shard(partition)
            .map(|mut shard| shard.install(epoch, entries))
            .unwrap_or(false)
    }

    /// Discard the shard and any outstanding load
    ///
    /// With `epoch` lower than the shard's current epoch this is a stale
    /// command and nothing changes. Returns true if anything was removed.
    pub fn detach_shard(&self, partition: i32, epoch: Option<i32>) -> bool {
        let Some(mut shard) = self.lock_shard(partition) else {
            warn!(partition, "Ignoring detach of unknown transaction log partition");
            return false;
        };

        if let (Some(epoch), Some(current)) = (epoch, shard.current_epoch()) {
            if epoch < current {
                warn!(
                    partition,
                    coordinator_epoch = epoch,
                    current_epoch = current,
                    "Ignoring stale detach of transaction log partition"
                );
                return false;
            }
        }

        let was_loading = shard.loading_epoch.take().is_some();
        let removed = shard.entry.take();
        match &removed {
            Some(entry) => info!(
                partition,
                coordinator_epoch = entry.coordinator_epoch,
                num_transactions = entry.metadata_per_transactional_id.len(),
                was_loading,
                "Unloaded transaction metadata"
            ),
            None => info!(
                partition,
                was_loading, "No cached transaction metadata to unload"
            ),
        }
        was_loading || removed.is_some()
    }

    /// Check if this coordinator currently serves `transactional_id`
    pub fn is_coordinator_for(&self, transactional_id: &str) -> bool {
        let shard = self.lock_shard_for(transactional_id);
        !shard.is_loading() && shard.entry.is_some()
    }

    /// Check if the shard of `transactional_id` is being loaded
    pub fn is_loading(&self, transactional_id: &str) -> bool {
        self.lock_shard_for(transactional_id).is_loading()
    }

    /// Owned partitions with their coordinator epochs
    pub fn owned_partitions(&self) -> Vec<(i32, i32)> {
        self.shards()
            .filter_map(|(partition, shard)| {
                shard
                    .lock()
                    .entry
                    .as_ref()
                    .map(|entry| (partition, entry.coordinator_epoch))
            })
            .collect()
    }

    /// Number of cached transactional ids across all shards
    pub fn transaction_count(&self) -> usize {
        self.shards()
            .map(|(_, shard)| {
                shard
                    .lock()
                    .entry
                    .as_ref()
                    .map_or(0, |entry| entry.metadata_per_transactional_id.len())
            })
            .sum()
    }
}
