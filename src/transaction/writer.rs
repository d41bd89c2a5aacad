//! Durable append of prepared transitions
//!
//! A caller prepares a transition on the cached metadata (which records it
//! as `pending_state`), then hands the snapshot to
//! [`TransactionLogWriter::append_transition`]. The record is submitted to
//! the log store while the shard lock is held, so a detach or reload cannot
//! slip in between validation and submission. The store's completion is
//! forwarded through a oneshot channel to a task that re-locks the shard and
//! either commits the transition or disposes of the pending state.

use crate::clock::Clock;
use crate::error::{CoordinatorError, Result, StoreError, StoreResult, TxnStateError};
use crate::metrics;
use crate::transaction::cache::{Shard, TransactionMetadataCache, TxnMetadataCacheEntry};
use crate::transaction::log::transition_record;
use crate::transaction::stats::TransactionStateStats;
use crate::transaction::store::TransactionLogStore;
use crate::transaction::state::TxnTransitMetadata;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Receives the outcome of an append, exactly once
pub type TransitionCallback =
    Box<dyn FnOnce(std::result::Result<(), CoordinatorError>) + Send + 'static>;

/// Decides whether a retriable append failure keeps the pending transition
pub type RetryPredicate = Box<dyn FnOnce(CoordinatorError) -> bool + Send + 'static>;

/// Writes transitions to the transaction state log
pub struct TransactionLogWriter {
    cache: Arc<TransactionMetadataCache>,
    store: Arc<dyn TransactionLogStore>,
    clock: Arc<dyn Clock>,
    stats: Arc<TransactionStateStats>,
    runtime: Handle,
}

impl TransactionLogWriter {
    pub fn new(
        cache: Arc<TransactionMetadataCache>,
        store: Arc<dyn TransactionLogStore>,
        clock: Arc<dyn Clock>,
        stats: Arc<TransactionStateStats>,
        runtime: Handle,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            stats,
            runtime,
        }
    }

    /// Append `transit`, clearing the pending state on any failure
    pub fn append_transition(
        &self,
        transactional_id: &str,
        coordinator_epoch: i32,
        transit: TxnTransitMetadata,
        callback: TransitionCallback,
    ) -> Result<()> {
        self.append_transition_with_retry(
            transactional_id,
            coordinator_epoch,
            transit,
            callback,
            Box::new(|_| false),
        )
    }

    /// Append `transit` to the log of the shard owning `transactional_id`
    ///
    /// Returns `Err` only when the caller broke the transition protocol
    /// (the cached pending state is not `transit`) or the snapshot cannot be
    /// encoded; the callback is then dropped without being invoked. An
    /// encoding failure also drops the pending state. In every other case the
    /// callback is invoked exactly once, after the append completed or was
    /// rejected. A second append of the same transition while the first is
    /// still in flight is rejected with `ConcurrentTransactions`.
    pub fn append_transition_with_retry(
        &self,
        transactional_id: &str,
        coordinator_epoch: i32,
        transit: TxnTransitMetadata,
        callback: TransitionCallback,
        retry_on_error: RetryPredicate,
    ) -> Result<()> {
        let partition = self.cache.partition_for(transactional_id);
        let now_ms = self.clock.now_ms();

        let completion = {
            let Some(mut shard) = self.cache.lock_shard(partition) else {
                return Err(TxnStateError::illegal_state(format!(
                    "Transaction log partition {} does not exist",
                    partition
                )));
            };
            match validate_pending(&mut shard, transactional_id, coordinator_epoch, &transit)? {
                Err(e) => Err(e),
                Ok(entry) => {
                    let record = match transition_record(transactional_id, &transit, now_ms) {
                        Ok(record) => record,
                        Err(e) => {
                            // nothing was submitted, so the transition can never complete
                            if let Some(metadata) =
                                entry.metadata_per_transactional_id.get_mut(transactional_id)
                            {
                                metadata.pending_state = None;
                            }
                            error!(
                                transactional_id,
                                partition,
                                error = %e,
                                "Failed to encode transition, dropped pending state"
                            );
                            return Err(e);
                        }
                    };

                    entry
                        .appends_in_flight
                        .insert(transactional_id.to_string());
                    let (tx, rx) = oneshot::channel();
                    self.store.append(
                        partition,
                        vec![record],
                        Box::new(move |result| {
                            let _ = tx.send(result);
                        }),
                    );
                    Ok(rx)
                }
            }
        };

        let rx = match completion {
            Ok(rx) => rx,
            Err(e) => {
                debug!(
                    transactional_id,
                    partition,
                    coordinator_epoch,
                    error = %e,
                    "Rejected transition before append"
                );
                callback(Err(e));
                return Ok(());
            }
        };

        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        let transactional_id = transactional_id.to_string();
        self.runtime.spawn(async move {
            let result = rx.await.unwrap_or_else(|_| {
                Err(StoreError::StorageFailure(
                    "append completion dropped".to_string(),
                ))
            });

            if let Err(e) = &result {
                stats.record_append_failure();
                metrics::record_append_failure(e.to_coordinator_error().as_str());
            }

            // evaluated before re-locking the shard
            let keep_pending = match &result {
                Err(e) if e.to_coordinator_error() == CoordinatorError::CoordinatorNotAvailable => {
                    retry_on_error(CoordinatorError::CoordinatorNotAvailable)
                }
                _ => false,
            };

            let outcome = complete_append(
                &cache,
                partition,
                &transactional_id,
                coordinator_epoch,
                &transit,
                result,
                keep_pending,
            );
            callback(outcome);
        });
        Ok(())
    }
}

/// Check the cached metadata is waiting on exactly `transit` with no
/// append already submitted for it
///
/// The outer `Result` carries protocol violations, the inner one the
/// errors reported to the callback.
fn validate_pending<'a>(
    shard: &'a mut Shard,
    transactional_id: &str,
    coordinator_epoch: i32,
    transit: &TxnTransitMetadata,
) -> Result<std::result::Result<&'a mut TxnMetadataCacheEntry, CoordinatorError>> {
    let entry = match shard.serving_entry() {
        Ok(entry) => entry,
        Err(e) => return Ok(Err(e)),
    };
    if entry.coordinator_epoch != coordinator_epoch {
        return Ok(Err(CoordinatorError::NotCoordinator));
    }
    let Some(metadata) = entry.metadata_per_transactional_id.get(transactional_id) else {
        return Ok(Err(CoordinatorError::NotCoordinator));
    };

    if metadata.pending_state.as_ref() != Some(transit) {
        return Err(TxnStateError::illegal_state(format!(
            "Appending transition to {} for {} but pending state is {:?}",
            transit.txn_state,
            transactional_id,
            metadata.pending_state.as_ref().map(|p| p.txn_state)
        )));
    }
    if transit.producer_epoch < metadata.producer_epoch {
        return Err(TxnStateError::illegal_state(format!(
            "Appending transition for {} with producer epoch {} older than current epoch {}",
            transactional_id, transit.producer_epoch, metadata.producer_epoch
        )));
    }
    if entry.appends_in_flight.contains(transactional_id) {
        return Ok(Err(CoordinatorError::ConcurrentTransactions));
    }
    Ok(Ok(entry))
}

/// Apply the append outcome to the cache and decide what the caller sees
fn complete_append(
    cache: &TransactionMetadataCache,
    partition: i32,
    transactional_id: &str,
    coordinator_epoch: i32,
    transit: &TxnTransitMetadata,
    result: StoreResult<i64>,
    keep_pending: bool,
) -> std::result::Result<(), CoordinatorError> {
    let Some(mut shard) = cache.lock_shard(partition) else {
        return Err(CoordinatorError::NotCoordinator);
    };
    if let Some(entry) = shard.entry_at(coordinator_epoch) {
        entry.appends_in_flight.remove(transactional_id);
    }

    match result {
        Ok(offset) => {
            if shard.is_loading() {
                return Err(CoordinatorError::CoordinatorLoadInProgress);
            }
            let Some(metadata) = shard
                .entry_at(coordinator_epoch)
                .and_then(|entry| entry.metadata_per_transactional_id.get_mut(transactional_id))
            else {
                debug!(
                    transactional_id,
                    partition, coordinator_epoch, "Shard ownership changed during append"
                );
                return Err(CoordinatorError::NotCoordinator);
            };

            if metadata.pending_state.as_ref() != Some(transit) {
                debug!(
                    transactional_id,
                    offset, "Transition was superseded while appending, nothing to commit"
                );
                return Ok(());
            }

            if let Err(e) = metadata.complete_transition_to(transit) {
                error!(
                    transactional_id,
                    error = %e,
                    "Failed to commit appended transition"
                );
                metadata.pending_state = None;
                return Err(CoordinatorError::UnknownServerError);
            }
            debug!(
                transactional_id,
                partition,
                offset,
                state = %transit.txn_state,
                "Committed transition"
            );
            Ok(())
        }
        Err(store_error) => {
            let loading = shard.is_loading();
            let Some(metadata) = shard
                .entry_at(coordinator_epoch)
                .and_then(|entry| entry.metadata_per_transactional_id.get_mut(transactional_id))
            else {
                warn!(
                    transactional_id,
                    partition,
                    coordinator_epoch,
                    error = %store_error,
                    "Append failed after shard ownership changed"
                );
                return Err(if loading {
                    CoordinatorError::CoordinatorLoadInProgress
                } else {
                    CoordinatorError::NotCoordinator
                });
            };

            let coordinator_error = if loading {
                CoordinatorError::CoordinatorLoadInProgress
            } else {
                store_error.to_coordinator_error()
            };
            let retained = keep_pending
                && coordinator_error == CoordinatorError::CoordinatorNotAvailable;
            if !retained && metadata.pending_state.as_ref() == Some(transit) {
                metadata.pending_state = None;
            }

            warn!(
                transactional_id,
                partition,
                coordinator_epoch,
                error = %store_error,
                coordinator_error = %coordinator_error,
                pending_retained = retained,
                "Failed to append transition to transaction log"
            );
            Err(coordinator_error)
        }
    }
}
