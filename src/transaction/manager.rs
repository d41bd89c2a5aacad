//! Transaction state manager
//!
//! Entry point used by the transaction coordinator. It owns the sharded
//! metadata cache and wires it to the log store through the loader, the
//! writer and the expirer:
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!   requests ───> │   TransactionStateManager    │ <─── ownership changes
//!                 │  get_state / put_if_absent   │      load_shard / detach_shard
//!                 │  append_transition           │
//!                 └──────┬───────────────┬───────┘
//!                        │               │
//!              ┌─────────▼──┐   ┌────────▼────────┐
//!              │   cache    │   │ loader / writer │ ───> TransactionLogStore
//!              │ (shards)   │<──│    / expirer    │
//!              └────────────┘   └─────────────────┘
//! ```
//!
//! All state lives in the cache; the manager adds configuration, the
//! periodic expiration task and read-only listings.

use crate::clock::Clock;
use crate::config::defaults::TRANSACTION_STATE_TOPIC;
use crate::config::TransactionStateConfig;
use crate::error::{CoordinatorError, Result, TxnStateError};
use crate::transaction::cache::{CoordinatorEpochAndTxnMetadata, TransactionMetadataCache};
use crate::transaction::expirer::{ExpirationSummary, TransactionalIdExpirer};
use crate::transaction::loader::{LoadOutcome, MarkerRecoveryCallback, TransactionLogLoader};
use crate::transaction::partitioner::PartitionCountSource;
use crate::transaction::stats::{TransactionStateStats, TransactionStateStatsSnapshot};
use crate::transaction::store::TransactionLogStore;
use crate::transaction::state::{
    ProducerEpoch, ProducerId, TransactionMetadata, TransactionState, TxnTransitMetadata,
};
use crate::transaction::writer::{RetryPredicate, TransactionLogWriter, TransitionCallback};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

/// An ongoing transaction that exceeded its timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionalIdAndProducerIdEpoch {
    pub transactional_id: String,
    pub producer_id: ProducerId,
    pub producer_epoch: ProducerEpoch,
}

/// Receives each non-empty batch of timed-out transactions found by the
/// periodic scan, typically to abort them
pub type TimedOutHandler = Arc<dyn Fn(Vec<TransactionalIdAndProducerIdEpoch>) + Send + Sync>;

/// Filter for [`TransactionStateManager::list_transactions`]
///
/// Empty sets match everything.
#[derive(Debug, Clone, Default)]
pub struct TransactionListingFilter {
    pub producer_ids: HashSet<ProducerId>,
    pub states: HashSet<TransactionState>,
    /// Only transactions running for at least this long
    pub min_duration_ms: Option<i64>,
}

/// Summary of one cached transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionListing {
    pub transactional_id: String,
    pub producer_id: ProducerId,
    pub state: TransactionState,
}

/// Manages the cached and persisted state of all transactional ids
pub struct TransactionStateManager {
    config: TransactionStateConfig,
    cache: Arc<TransactionMetadataCache>,
    clock: Arc<dyn Clock>,
    stats: Arc<TransactionStateStats>,
    loader: TransactionLogLoader,
    writer: TransactionLogWriter,
    expirer: TransactionalIdExpirer,
    runtime: Handle,
    /// Shutdown flag for the background tasks
    shutdown: AtomicBool,
    /// Wakes the expiration task for an immediate sweep or shutdown
    expiration_notify: Notify,
    /// Wakes the timed-out scan task for an immediate scan or shutdown
    timeout_notify: Notify,
}

impl TransactionStateManager {
    /// Create a manager on the current tokio runtime
    pub fn new(
        config: TransactionStateConfig,
        store: Arc<dyn TransactionLogStore>,
        clock: Arc<dyn Clock>,
        partition_count: &dyn PartitionCountSource,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            TxnStateError::Config(format!(
                "transaction state manager requires a tokio runtime: {}",
                e
            ))
        })?;
        Self::with_runtime(config, store, clock, partition_count, runtime)
    }

    /// Create a manager whose background work runs on `runtime`
    pub fn with_runtime(
        config: TransactionStateConfig,
        store: Arc<dyn TransactionLogStore>,
        clock: Arc<dyn Clock>,
        partition_count: &dyn PartitionCountSource,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;

        let num_partitions = partition_count
            .number_of_partitions(TRANSACTION_STATE_TOPIC)
            .unwrap_or(config.num_partitions);
        let cache = Arc::new(TransactionMetadataCache::new(num_partitions)?);
        let stats = Arc::new(TransactionStateStats::default());

        let loader = TransactionLogLoader::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&stats),
            config.load_buffer_size,
            runtime.clone(),
        );
        let writer = TransactionLogWriter::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&stats),
            runtime.clone(),
        );
        let expirer = TransactionalIdExpirer::new(
            Arc::clone(&cache),
            store,
            Arc::clone(&clock),
            Arc::clone(&stats),
            config.transactional_id_expiration_ms,
        );

        info!(
            num_partitions,
            expiration_ms = config.transactional_id_expiration_ms,
            "Transaction state manager created"
        );

        Ok(Self {
            config,
            cache,
            clock,
            stats,
            loader,
            writer,
            expirer,
            runtime,
            shutdown: AtomicBool::new(false),
            expiration_notify: Notify::new(),
            timeout_notify: Notify::new(),
        })
    }

    pub fn config(&self) -> &TransactionStateConfig {
        &self.config
    }

    /// Number of shards, i.e. partitions of the transaction state log
    pub fn num_partitions(&self) -> u32 {
        self.cache.num_partitions()
    }

    /// Shard owning `transactional_id`
    pub fn partition_for(&self, transactional_id: &str) -> i32 {
        self.cache.partition_for(transactional_id)
    }

    /// Cached metadata for `transactional_id`, `Ok(None)` if unknown
    pub fn get_state(
        &self,
        transactional_id: &str,
    ) -> std::result::Result<Option<CoordinatorEpochAndTxnMetadata>, CoordinatorError> {
        self.cache.get_state(transactional_id)
    }

    /// Cache `metadata` unless its transactional id is known already
    pub fn put_if_absent(
        &self,
        metadata: TransactionMetadata,
    ) -> std::result::Result<CoordinatorEpochAndTxnMetadata, CoordinatorError> {
        self.cache.put_if_absent(metadata)
    }

    /// Prepare a transition on the live metadata under the shard lock
    ///
    /// ```ignore
    /// let transit = manager.update(id, epoch, |m| m.prepare_add_partitions(parts, now))?;
    /// manager.append_transition(id, epoch, transit, callback)?;
    /// ```
    pub fn update<R>(
        &self,
        transactional_id: &str,
        coordinator_epoch: i32,
        f: impl FnOnce(&mut TransactionMetadata) -> Result<R>,
    ) -> Result<R> {
        self.cache.update(transactional_id, coordinator_epoch, f)
    }

    /// Persist a prepared transition; see [`TransactionLogWriter`]
    pub fn append_transition(
        &self,
        transactional_id: &str,
        coordinator_epoch: i32,
        transit: TxnTransitMetadata,
        callback: TransitionCallback,
    ) -> Result<()> {
        self.writer
            .append_transition(transactional_id, coordinator_epoch, transit, callback)
    }

    /// Persist a prepared transition, keeping it pending on retriable
    /// failures when `retry_on_error` says so
    pub fn append_transition_with_retry(
        &self,
        transactional_id: &str,
        coordinator_epoch: i32,
        transit: TxnTransitMetadata,
        callback: TransitionCallback,
        retry_on_error: RetryPredicate,
    ) -> Result<()> {
        self.writer.append_transition_with_retry(
            transactional_id,
            coordinator_epoch,
            transit,
            callback,
            retry_on_error,
        )
    }

    /// Become coordinator for `partition` at `coordinator_epoch`
    pub fn load_shard(
        &self,
        partition: i32,
        coordinator_epoch: i32,
        on_recovery: MarkerRecoveryCallback,
    ) -> JoinHandle<LoadOutcome> {
        self.loader
            .load_shard(partition, coordinator_epoch, on_recovery)
    }

    /// Give up ownership of `partition`
    ///
    /// Passing the epoch of the ownership change makes late commands from
    /// an older change harmless.
    pub fn detach_shard(&self, partition: i32, coordinator_epoch: Option<i32>) -> bool {
        info!(
            partition,
            coordinator_epoch = ?coordinator_epoch,
            "Resigning as transaction coordinator for partition"
        );
        self.cache.detach_shard(partition, coordinator_epoch)
    }

    /// Remove expired transactional ids from the log and the cache
    pub async fn sweep(&self) -> ExpirationSummary {
        self.expirer.sweep().await
    }

    /// Ongoing transactions whose timeout has elapsed, by partition then id
    pub fn list_timed_out_ongoing(&self) -> Vec<TransactionalIdAndProducerIdEpoch> {
        let now_ms = self.clock.now_ms();
        let mut timed_out = Vec::new();

        for (_, shard) in self.cache.shards() {
            let shard = shard.lock();
            if shard.is_loading() {
                continue;
            }
            let Some(entry) = shard.entry.as_ref() else {
                continue;
            };

            let mut in_shard: Vec<_> = entry
                .metadata_per_transactional_id
                .values()
                .filter(|m| m.is_ongoing_timed_out(now_ms))
                .map(|m| TransactionalIdAndProducerIdEpoch {
                    transactional_id: m.transactional_id.clone(),
                    producer_id: m.producer_id,
                    producer_epoch: m.producer_epoch,
                })
                .collect();
            in_shard.sort_by(|a, b| a.transactional_id.cmp(&b.transactional_id));
            timed_out.extend(in_shard);
        }
        timed_out
    }

    /// List cached transactions matching `filter`, sorted by id
    pub fn list_transactions(
        &self,
        filter: &TransactionListingFilter,
    ) -> std::result::Result<Vec<TransactionListing>, CoordinatorError> {
        let now_ms = self.clock.now_ms();
        let mut listings = Vec::new();

        for (_, shard) in self.cache.shards() {
            let shard = shard.lock();
            if shard.is_loading() {
                return Err(CoordinatorError::CoordinatorLoadInProgress);
            }
            let Some(entry) = shard.entry.as_ref() else {
                continue;
            };

            listings.extend(
                entry
                    .metadata_per_transactional_id
                    .values()
                    .filter(|m| {
                        filter.producer_ids.is_empty() || filter.producer_ids.contains(&m.producer_id)
                    })
                    .filter(|m| filter.states.is_empty() || filter.states.contains(&m.state))
                    .filter(|m| match filter.min_duration_ms {
                        Some(min) => {
                            m.txn_start_timestamp_ms >= 0
                                && now_ms - m.txn_start_timestamp_ms >= min
                        }
                        None => true,
                    })
                    .map(|m| TransactionListing {
                        transactional_id: m.transactional_id.clone(),
                        producer_id: m.producer_id,
                        state: m.state,
                    }),
            );
        }

        listings.sort_by(|a, b| a.transactional_id.cmp(&b.transactional_id));
        Ok(listings)
    }

    /// Check a client-requested transaction timeout against the configured maximum
    pub fn validate_transaction_timeout(&self, txn_timeout_ms: i64) -> bool {
        self.config.validate_transaction_timeout(txn_timeout_ms)
    }

    pub fn is_coordinator_for(&self, transactional_id: &str) -> bool {
        self.cache.is_coordinator_for(transactional_id)
    }

    pub fn is_loading(&self, transactional_id: &str) -> bool {
        self.cache.is_loading(transactional_id)
    }

    /// Owned partitions with their coordinator epochs
    pub fn owned_partitions(&self) -> Vec<(i32, i32)> {
        self.cache.owned_partitions()
    }

    pub fn transaction_count(&self) -> usize {
        self.cache.transaction_count()
    }

    pub fn stats(&self) -> TransactionStateStatsSnapshot {
        self.stats.snapshot()
    }

    /// Start the periodic expiration sweep
    pub fn start_expiration_task(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval_ms = manager.config.remove_expired_transactional_ids_interval_ms;

        self.runtime.spawn(async move {
            let mut sweep_interval = interval(Duration::from_millis(interval_ms));
            sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick completes immediately
            sweep_interval.tick().await;

            info!(interval_ms, "Transactional id expiration task started");

            loop {
                tokio::select! {
                    _ = sweep_interval.tick() => {}
                    _ = manager.expiration_notify.notified() => {}
                }
                if manager.is_shutdown() {
                    break;
                }
                manager.sweep().await;
            }

            info!("Transactional id expiration task stopped");
        })
    }

    /// Run an expiration sweep now instead of waiting for the interval
    pub fn trigger_expiration(&self) {
        self.expiration_notify.notify_one();
    }

    /// Start the periodic scan for timed-out ongoing transactions
    ///
    /// Runs every `abort_timed_out_transactions_interval_ms`. The handler is
    /// called with no shard lock held.
    pub fn start_timed_out_scan_task(self: &Arc<Self>, on_timed_out: TimedOutHandler) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval_ms = manager.config.abort_timed_out_transactions_interval_ms;

        self.runtime.spawn(async move {
            let mut scan_interval = interval(Duration::from_millis(interval_ms));
            scan_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            scan_interval.tick().await;

            info!(interval_ms, "Transaction timeout scan task started");

            loop {
                tokio::select! {
                    _ = scan_interval.tick() => {}
                    _ = manager.timeout_notify.notified() => {}
                }
                if manager.is_shutdown() {
                    break;
                }

                let timed_out = manager.list_timed_out_ongoing();
                if !timed_out.is_empty() {
                    info!(count = timed_out.len(), "Found timed-out transactions");
                    on_timed_out(timed_out);
                }
            }

            info!("Transaction timeout scan task stopped");
        })
    }

    /// Run a timed-out scan now instead of waiting for the interval
    pub fn trigger_timed_out_scan(&self) {
        self.timeout_notify.notify_one();
    }

    /// Signal shutdown to the background tasks
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.expiration_notify.notify_one();
        self.timeout_notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
