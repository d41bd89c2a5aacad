//! Transaction state manager integration tests
//!
//! Covers the manager as the coordinator sees it:
//!
//! - Shard ownership: re-loads at increasing epochs, detach racing a load
//! - Writer → loader round-trip across a coordinator failover
//! - Replay of a synthetic log spread over two shards
//! - Append failure handling and pending state disposition
//! - Expiration eligibility and size-bounded tombstone batches

mod common;

use std::sync::Arc;

use common::*;
use parking_lot::Mutex;
use streamline_txn_state::config::TransactionStateConfig;
use streamline_txn_state::transaction::log::{
    batch_size_in_bytes, tombstone_record, transition_record, RECORD_BATCH_OVERHEAD,
};
use streamline_txn_state::transaction::{
    LoadOutcome, MarkerRecoveryCallback, TransactionMetadata, TransactionPartition,
    TransactionResult, TransactionState, TxnTransitMetadata,
};
use streamline_txn_state::{CoordinatorError, StoreError, TxnStateError};

// ============================================================================
// Helpers
// ============================================================================

fn transit(
    producer_id: i64,
    state: TransactionState,
    partitions: &[(&str, i32)],
    updated_ms: i64,
) -> TxnTransitMetadata {
    TxnTransitMetadata {
        producer_id,
        producer_epoch: 0,
        last_producer_epoch: -1,
        txn_timeout_ms: 60_000,
        txn_state: state,
        topic_partitions: partitions
            .iter()
            .map(|(topic, p)| TransactionPartition::new(*topic, *p))
            .collect(),
        txn_start_timestamp_ms: if partitions.is_empty() { -1 } else { 100 },
        txn_last_update_timestamp_ms: updated_ms,
    }
}

fn in_state(id: &str, state: TransactionState, last_update_ms: i64) -> TransactionMetadata {
    let mut metadata = TransactionMetadata::new(id, 1, 0, 60_000, last_update_ms);
    metadata.state = state;
    if !state.is_expiration_allowed() {
        metadata.txn_start_timestamp_ms = last_update_ms;
        metadata
            .topic_partitions
            .insert(TransactionPartition::new("orders", 0));
    }
    metadata
}

/// Prepare a transition through `f`, append it and wait for the outcome
async fn transition(
    t: &TestManager,
    id: &str,
    epoch: i32,
    f: impl FnOnce(&mut TransactionMetadata) -> streamline_txn_state::Result<TxnTransitMetadata>,
) -> Result<(), CoordinatorError> {
    let transit = t.manager.update(id, epoch, f).unwrap();
    let (callback, rx) = completion();
    t.manager
        .append_transition(id, epoch, transit, callback)
        .unwrap();
    rx.await.unwrap()
}

// ============================================================================
// Shard ownership
// ============================================================================

#[tokio::test]
async fn test_reload_at_higher_epoch_without_detach() {
    let t = TestManager::new(2);
    let id = id_in_partition("txn", 1, 2);

    let outcome = t.manager.load_shard(1, 4, no_recovery()).await.unwrap();
    assert!(matches!(outcome, LoadOutcome::Installed { .. }));
    t.manager
        .put_if_absent(TransactionMetadata::new(&id, 7, 0, 60_000, 0))
        .unwrap();
    assert_eq!(transition(&t, &id, 4, |m| m.prepare_increment_producer_epoch(60_000, 10)).await, Ok(()));

    let outcome = t.manager.load_shard(1, 5, no_recovery()).await.unwrap();
    assert!(matches!(
        outcome,
        LoadOutcome::Installed {
            num_transactions: 1,
            ..
        }
    ));
    assert_eq!(t.manager.owned_partitions(), vec![(1, 5)]);

    let state = t.manager.get_state(&id).unwrap().unwrap();
    assert_eq!(state.coordinator_epoch, 5);
    assert_eq!(state.metadata.producer_epoch, 1);
}

#[tokio::test]
async fn test_reload_at_higher_epoch_after_detach() {
    let t = TestManager::new(2);
    t.manager.load_shard(0, 1, no_recovery()).await.unwrap();
    assert!(t.manager.detach_shard(0, Some(1)));
    assert!(t.manager.owned_partitions().is_empty());

    let outcome = t.manager.load_shard(0, 2, no_recovery()).await.unwrap();
    assert!(matches!(outcome, LoadOutcome::Installed { .. }));
    assert_eq!(t.manager.owned_partitions(), vec![(0, 2)]);
}

#[tokio::test]
async fn test_detach_before_replay_discards_load() {
    let t = TestManager::new(2);
    let id = id_in_partition("txn", 0, 2);
    t.store.append_records(
        0,
        vec![transition_record(&id, &transit(1, TransactionState::Empty, &[], 0), 0).unwrap()],
    );

    let handle = t.manager.load_shard(0, 3, no_recovery());
    assert_eq!(
        t.manager.get_state(&id),
        Err(CoordinatorError::CoordinatorLoadInProgress)
    );

    assert!(t.manager.detach_shard(0, Some(3)));
    assert_eq!(
        t.manager.get_state(&id),
        Err(CoordinatorError::NotCoordinator)
    );

    assert_eq!(handle.await.unwrap(), LoadOutcome::Discarded);
    assert_eq!(
        t.manager.get_state(&id),
        Err(CoordinatorError::NotCoordinator)
    );
}

#[tokio::test]
async fn test_detach_during_replay_discards_load() {
    let config = TransactionStateConfig {
        // one record per read, so the loader re-checks its marker often
        load_buffer_size: 1,
        ..Default::default()
    };
    let t = TestManager::with_config(1, config);
    let records = (0..20)
        .map(|i| {
            transition_record(
                &format!("txn-{}", i),
                &transit(i, TransactionState::Empty, &[], 0),
                0,
            )
            .unwrap()
        })
        .collect();
    t.store.append_records(0, records);

    let handle = t.manager.load_shard(0, 1, no_recovery());
    tokio::task::yield_now().await;
    t.manager.detach_shard(0, None);

    assert_eq!(handle.await.unwrap(), LoadOutcome::Discarded);
    assert_eq!(
        t.manager.get_state("txn-0"),
        Err(CoordinatorError::NotCoordinator)
    );
    assert_eq!(t.manager.transaction_count(), 0);
}

#[tokio::test]
async fn test_stale_detach_keeps_newer_ownership() {
    let t = TestManager::new(1);
    t.load_all(6).await;
    t.manager
        .put_if_absent(TransactionMetadata::new("txn", 1, 0, 60_000, 0))
        .unwrap();

    assert!(!t.manager.detach_shard(0, Some(5)));
    assert!(t.manager.is_coordinator_for("txn"));
    assert!(t.manager.get_state("txn").unwrap().is_some());
}

#[tokio::test]
async fn test_ids_on_unowned_shard_are_not_served() {
    let t = TestManager::new(2);
    t.manager.load_shard(0, 1, no_recovery()).await.unwrap();

    let owned = id_in_partition("txn", 0, 2);
    let foreign = id_in_partition("txn", 1, 2);
    assert!(t.manager.is_coordinator_for(&owned));
    assert!(!t.manager.is_coordinator_for(&foreign));
    assert_eq!(
        t.manager
            .put_if_absent(TransactionMetadata::new(&foreign, 1, 0, 60_000, 0))
            .unwrap_err(),
        CoordinatorError::NotCoordinator
    );
}

// ============================================================================
// Writer and loader round-trip
// ============================================================================

#[tokio::test]
async fn test_writer_history_replays_to_live_metadata() {
    let t = TestManager::new(2);
    t.load_all(0).await;
    let id = "orders-app";

    t.manager
        .put_if_absent(TransactionMetadata::new(id, 4000, 0, 60_000, 1_000))
        .unwrap();
    assert_eq!(
        transition(&t, id, 0, |m| m.prepare_increment_producer_epoch(30_000, 1_000)).await,
        Ok(())
    );
    assert_eq!(
        transition(&t, id, 0, |m| m.prepare_add_partitions(
            [
                TransactionPartition::new("orders", 0),
                TransactionPartition::new("payments", 2),
            ],
            1_500,
        ))
        .await,
        Ok(())
    );
    assert_eq!(
        transition(&t, id, 0, |m| m
            .prepare_add_partitions([TransactionPartition::new("orders", 1)], 1_700))
        .await,
        Ok(())
    );
    assert_eq!(
        transition(&t, id, 0, |m| m
            .prepare_abort_or_commit(TransactionState::PrepareCommit, 2_000))
        .await,
        Ok(())
    );

    let live = t.manager.get_state(id).unwrap().unwrap().metadata;
    assert_eq!(live.state, TransactionState::PrepareCommit);
    assert_eq!(live.topic_partitions.len(), 3);
    assert!(live.pending_state.is_none());

    // a new coordinator takes over the same log
    let failover = TestManager::on_store(2, TransactionStateConfig::default(), t.store.clone());
    let recovered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&recovered);
    let on_recovery: MarkerRecoveryCallback = Arc::new(move |id, epoch, result, _, transit| {
        sink.lock().push((id.to_string(), epoch, result, transit.clone()));
    });
    let partition = failover.manager.partition_for(id);
    failover
        .manager
        .load_shard(partition, 1, on_recovery)
        .await
        .unwrap();

    let reloaded = failover.manager.get_state(id).unwrap().unwrap();
    assert_eq!(reloaded.coordinator_epoch, 1);
    assert_eq!(reloaded.metadata.transactional_id, live.transactional_id);
    assert_eq!(
        reloaded.metadata.prepare_no_transit(),
        live.prepare_no_transit()
    );

    let recovered = recovered.lock();
    assert_eq!(recovered.len(), 1);
    let (recovered_id, epoch, result, completion) = &recovered[0];
    assert_eq!(recovered_id, id);
    assert_eq!(*epoch, 1);
    assert_eq!(*result, TransactionResult::Commit);
    assert_eq!(completion.txn_state, TransactionState::CompleteCommit);
    assert_eq!(reloaded.metadata.pending_state.as_ref(), Some(completion));
}

#[tokio::test]
async fn test_recovered_completion_can_be_appended() {
    let t = TestManager::new(1);
    t.store.append_records(
        0,
        vec![transition_record(
            "txn",
            &transit(1, TransactionState::PrepareAbort, &[("orders", 0)], 500),
            500,
        )
        .unwrap()],
    );

    let pending = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&pending);
    let on_recovery: MarkerRecoveryCallback = Arc::new(move |_, _, result, _, transit| {
        assert_eq!(result, TransactionResult::Abort);
        *sink.lock() = Some(transit.clone());
    });
    t.manager.load_shard(0, 2, on_recovery).await.unwrap();

    let completion_transit = pending.lock().take().unwrap();
    let (callback, rx) = completion();
    t.manager
        .append_transition("txn", 2, completion_transit, callback)
        .unwrap();
    assert_eq!(rx.await.unwrap(), Ok(()));

    let metadata = t.manager.get_state("txn").unwrap().unwrap().metadata;
    assert_eq!(metadata.state, TransactionState::CompleteAbort);
    assert!(metadata.topic_partitions.is_empty());
}

#[tokio::test]
async fn test_six_record_log_over_two_shards() {
    let t = TestManager::new(2);
    let first = id_in_partition("producer", 0, 2);
    let second = id_in_partition("producer", 1, 2);

    let first_history = [
        transit(10, TransactionState::Empty, &[], 100),
        transit(10, TransactionState::Ongoing, &[("orders", 0)], 200),
        transit(10, TransactionState::PrepareCommit, &[("orders", 0)], 300),
    ];
    let second_history = [
        transit(20, TransactionState::Empty, &[], 100),
        transit(20, TransactionState::Ongoing, &[("payments", 1)], 200),
        transit(20, TransactionState::Empty, &[], 400),
    ];
    for (id, partition, history) in [(&first, 0, &first_history), (&second, 1, &second_history)] {
        let records = history
            .iter()
            .map(|h| transition_record(id, h, h.txn_last_update_timestamp_ms).unwrap())
            .collect();
        t.store.append_records(partition, records);
    }

    t.load_all(0).await;

    let cached = t.manager.get_state(&first).unwrap().unwrap().metadata;
    assert_eq!(cached.prepare_no_transit(), first_history[2]);
    assert_eq!(
        cached.pending_state.map(|p| p.txn_state),
        Some(TransactionState::CompleteCommit)
    );

    let cached = t.manager.get_state(&second).unwrap().unwrap().metadata;
    assert_eq!(
        cached,
        TransactionMetadata::from_transit(second.as_str(), &second_history[2])
    );
    assert_eq!(t.manager.transaction_count(), 2);
}

#[tokio::test]
async fn test_tombstoned_ids_are_not_reloaded() {
    let t = TestManager::new(1);
    t.store.append_records(
        0,
        vec![
            transition_record("gone", &transit(1, TransactionState::Empty, &[], 0), 0).unwrap(),
            transition_record("kept", &transit(2, TransactionState::Empty, &[], 0), 0).unwrap(),
            tombstone_record("gone", 10).unwrap(),
        ],
    );
    t.load_all(0).await;
    assert_eq!(t.manager.get_state("gone"), Ok(None));
    assert!(t.manager.get_state("kept").unwrap().is_some());
}

#[tokio::test]
async fn test_load_read_failure_leaves_shard_unowned() {
    let t = TestManager::new(1);
    t.store.append_records(
        0,
        vec![transition_record("txn", &transit(1, TransactionState::Empty, &[], 0), 0).unwrap()],
    );
    t.store
        .set_read_error(0, Some(StoreError::NotLeaderOrFollower(0)));

    let outcome = t.manager.load_shard(0, 1, no_recovery()).await.unwrap();
    assert!(matches!(outcome, LoadOutcome::Failed(_)));
    assert_eq!(
        t.manager.get_state("txn"),
        Err(CoordinatorError::NotCoordinator)
    );
    assert_eq!(t.manager.stats().partition_loads_failed, 1);

    t.store.set_read_error(0, None);
    let outcome = t.manager.load_shard(0, 1, no_recovery()).await.unwrap();
    assert!(matches!(outcome, LoadOutcome::Installed { .. }));
}

// ============================================================================
// Append failures
// ============================================================================

#[tokio::test]
async fn test_append_failure_table() {
    let cases = [
        (
            StoreError::NotEnoughReplicas,
            CoordinatorError::CoordinatorNotAvailable,
        ),
        (
            StoreError::NotEnoughReplicasAfterAppend,
            CoordinatorError::CoordinatorNotAvailable,
        ),
        (
            StoreError::RequestTimedOut,
            CoordinatorError::CoordinatorNotAvailable,
        ),
        (
            StoreError::UnknownTopicOrPartition(0),
            CoordinatorError::CoordinatorNotAvailable,
        ),
        (
            StoreError::NotLeaderOrFollower(0),
            CoordinatorError::NotCoordinator,
        ),
        (
            StoreError::StorageFailure("io".into()),
            CoordinatorError::NotCoordinator,
        ),
        (
            StoreError::MessageTooLarge(10, 1),
            CoordinatorError::UnknownServerError,
        ),
        (
            StoreError::RecordListTooLarge(10, 1),
            CoordinatorError::UnknownServerError,
        ),
    ];

    for (store_error, expected) in cases {
        let t = TestManager::new(1);
        t.load_all(0).await;
        t.manager
            .put_if_absent(TransactionMetadata::new("txn", 1, 0, 60_000, 0))
            .unwrap();
        t.store.inject_append_error(0, store_error.clone());

        let result = transition(&t, "txn", 0, |m| {
            m.prepare_add_partitions([TransactionPartition::new("orders", 0)], 10)
        })
        .await;
        assert_eq!(result, Err(expected), "for {:?}", store_error);

        let metadata = t.manager.get_state("txn").unwrap().unwrap().metadata;
        assert!(metadata.pending_state.is_none(), "for {:?}", store_error);
        assert_eq!(metadata.state, TransactionState::Empty);
        assert_eq!(t.manager.stats().append_failures, 1);
    }
}

#[tokio::test]
async fn test_retry_predicate_keeps_pending_transition() {
    let t = TestManager::new(1);
    t.load_all(0).await;
    t.manager
        .put_if_absent(TransactionMetadata::new("txn", 1, 0, 60_000, 0))
        .unwrap();
    let pending = t
        .manager
        .update("txn", 0, |m| {
            m.prepare_add_partitions([TransactionPartition::new("orders", 0)], 10)
        })
        .unwrap();

    t.store.inject_append_error(0, StoreError::RequestTimedOut);
    let (callback, rx) = completion();
    t.manager
        .append_transition_with_retry(
            "txn",
            0,
            pending.clone(),
            callback,
            Box::new(|e| e == CoordinatorError::CoordinatorNotAvailable),
        )
        .unwrap();
    assert_eq!(
        rx.await.unwrap(),
        Err(CoordinatorError::CoordinatorNotAvailable)
    );

    // no second transition can start while the first is retained
    let err = t
        .manager
        .update("txn", 0, |m| m.prepare_abort_or_commit(TransactionState::PrepareAbort, 20))
        .unwrap_err();
    assert_eq!(
        err.coordinator_error(),
        Some(CoordinatorError::ConcurrentTransactions)
    );

    // the retry commits the retained transition
    let (callback, rx) = completion();
    t.manager
        .append_transition("txn", 0, pending, callback)
        .unwrap();
    assert_eq!(rx.await.unwrap(), Ok(()));
    assert_eq!(
        t.manager.get_state("txn").unwrap().unwrap().metadata.state,
        TransactionState::Ongoing
    );
}

#[tokio::test]
async fn test_concurrent_retries_submit_one_append() {
    let t = TestManager::new(1);
    t.load_all(0).await;
    t.manager
        .put_if_absent(TransactionMetadata::new("txn", 1, 0, 60_000, 0))
        .unwrap();
    let pending = t
        .manager
        .update("txn", 0, |m| {
            m.prepare_add_partitions([TransactionPartition::new("orders", 0)], 10)
        })
        .unwrap();

    t.store.inject_append_error(0, StoreError::NotEnoughReplicas);
    let (callback, rx) = completion();
    t.manager
        .append_transition_with_retry("txn", 0, pending.clone(), callback, Box::new(|_| true))
        .unwrap();
    assert_eq!(
        rx.await.unwrap(),
        Err(CoordinatorError::CoordinatorNotAvailable)
    );

    // two retries of the retained transition race each other
    t.store.hold_appends();
    let (first, first_rx) = completion();
    t.manager
        .append_transition_with_retry("txn", 0, pending.clone(), first, Box::new(|_| true))
        .unwrap();
    let (second, second_rx) = completion();
    t.manager
        .append_transition_with_retry("txn", 0, pending.clone(), second, Box::new(|_| true))
        .unwrap();

    assert_eq!(
        second_rx.await.unwrap(),
        Err(CoordinatorError::ConcurrentTransactions)
    );
    assert_eq!(t.store.release_held_appends(), 1);
    assert_eq!(first_rx.await.unwrap(), Ok(()));
    assert_eq!(t.store.records(0).len(), 1);

    let metadata = t.manager.get_state("txn").unwrap().unwrap().metadata;
    assert_eq!(metadata.state, TransactionState::Ongoing);
    assert!(metadata.pending_state.is_none());
}

#[tokio::test]
async fn test_failure_after_ownership_change_leaves_new_state_alone() {
    let t = TestManager::new(1);
    t.load_all(0).await;
    t.manager
        .put_if_absent(TransactionMetadata::new("txn", 1, 0, 60_000, 0))
        .unwrap();
    let pending = t
        .manager
        .update("txn", 0, |m| m.prepare_increment_producer_epoch(60_000, 10))
        .unwrap();

    t.store.hold_appends();
    t.store.inject_append_error(0, StoreError::RequestTimedOut);
    let (callback, rx) = completion();
    t.manager
        .append_transition("txn", 0, pending, callback)
        .unwrap();

    // ownership moved on while the append was in flight
    t.manager.load_shard(0, 1, no_recovery()).await.unwrap();
    t.store.release_held_appends();

    assert_eq!(rx.await.unwrap(), Err(CoordinatorError::NotCoordinator));
    assert_eq!(t.manager.owned_partitions(), vec![(0, 1)]);
    assert_eq!(t.manager.get_state("txn"), Ok(None));
}

#[tokio::test]
async fn test_append_validation_rejects_foreign_transition() {
    let t = TestManager::new(1);
    t.load_all(0).await;
    t.manager
        .put_if_absent(TransactionMetadata::new("txn", 1, 0, 60_000, 0))
        .unwrap();

    let (callback, _rx) = completion();
    let err = t
        .manager
        .append_transition(
            "txn",
            0,
            transit(1, TransactionState::Ongoing, &[("orders", 0)], 10),
            callback,
        )
        .unwrap_err();
    assert!(matches!(err, TxnStateError::IllegalState(_)));

    let (callback, rx) = completion();
    t.manager
        .append_transition(
            "unknown",
            0,
            transit(1, TransactionState::Empty, &[], 10),
            callback,
        )
        .unwrap();
    assert_eq!(rx.await.unwrap(), Err(CoordinatorError::NotCoordinator));
}

// ============================================================================
// Expiration
// ============================================================================

#[tokio::test]
async fn test_expiration_eligibility() {
    let config = TransactionStateConfig {
        transactional_id_expiration_ms: 10_000,
        ..Default::default()
    };
    let t = TestManager::with_config(2, config);
    t.load_all(0).await;

    let cases = [
        ("empty-old", TransactionState::Empty, 0, true),
        ("commit-old", TransactionState::CompleteCommit, 0, true),
        ("abort-old", TransactionState::CompleteAbort, 0, true),
        ("empty-young", TransactionState::Empty, 5_000, false),
        ("ongoing-old", TransactionState::Ongoing, 0, false),
        ("prepare-commit-old", TransactionState::PrepareCommit, 0, false),
        ("prepare-abort-old", TransactionState::PrepareAbort, 0, false),
    ];
    for (id, state, last_update_ms, _) in cases {
        t.manager
            .put_if_absent(in_state(id, state, last_update_ms))
            .unwrap();
    }
    // eligible by age and state, but a transition is in flight
    t.manager
        .put_if_absent(in_state("busy-old", TransactionState::Empty, 0))
        .unwrap();
    t.manager
        .update("busy-old", 0, |m| m.prepare_increment_producer_epoch(60_000, 0))
        .unwrap();

    t.clock.set(10_000);
    let summary = t.manager.sweep().await;
    assert_eq!(summary.removed, 3);
    assert_eq!(summary.failed, 0);

    for (id, _, _, expired) in cases {
        assert_eq!(
            t.manager.get_state(id).unwrap().is_none(),
            expired,
            "unexpected expiration outcome for {}",
            id
        );
    }
    assert!(t.manager.get_state("busy-old").unwrap().is_some());
    assert_eq!(t.manager.stats().transactional_ids_expired, 3);
}

#[tokio::test]
async fn test_expiration_splits_batches_and_survives_failure() {
    let config = TransactionStateConfig {
        transactional_id_expiration_ms: 1_000,
        ..Default::default()
    };
    let t = TestManager::with_config(1, config);
    t.load_all(0).await;

    let ids: Vec<String> = (0..10).map(|i| format!("expired-{:02}", i)).collect();
    for id in &ids {
        t.manager
            .put_if_absent(in_state(id, TransactionState::Empty, 0))
            .unwrap();
    }

    // every id has the same length, so every tombstone has the same size
    let tombstone_size = tombstone_record(&ids[0], 0).unwrap().size_in_bytes();
    let max_batch_size = RECORD_BATCH_OVERHEAD + 3 * tombstone_size + 1;
    t.store.set_max_batch_size(0, Some(max_batch_size));
    t.store
        .script_appends(0, [None, Some(StoreError::NotEnoughReplicas)]);

    t.clock.set(5_000);
    let summary = t.manager.sweep().await;
    assert_eq!(summary.batches, 4);
    assert_eq!(summary.removed, 7);
    assert_eq!(summary.failed, 3);

    let batches = t.store.appended_batches(0);
    assert_eq!(
        batches.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![3, 3, 1]
    );
    for batch in &batches {
        assert!(batch_size_in_bytes(batch) < max_batch_size);
        assert!(batch.iter().all(|r| r.is_tombstone()));
    }

    // ids of the failed batch stay cached and become eligible again
    let survivors: Vec<_> = ids
        .iter()
        .filter(|id| t.manager.get_state(id).unwrap().is_some())
        .cloned()
        .collect();
    assert_eq!(survivors, vec!["expired-03", "expired-04", "expired-05"]);
    for id in &survivors {
        let metadata = t.manager.get_state(id).unwrap().unwrap().metadata;
        assert!(metadata.pending_state.is_none());
    }

    let summary = t.manager.sweep().await;
    assert_eq!(summary.removed, 3);
    assert_eq!(t.manager.transaction_count(), 0);
}

#[tokio::test]
async fn test_expired_ids_stay_gone_after_reload() {
    let config = TransactionStateConfig {
        transactional_id_expiration_ms: 1_000,
        ..Default::default()
    };
    let t = TestManager::with_config(1, config);
    t.load_all(0).await;
    t.manager
        .put_if_absent(TransactionMetadata::new("txn", 1, 0, 60_000, 0))
        .unwrap();
    assert_eq!(
        transition(&t, "txn", 0, |m| m.prepare_increment_producer_epoch(60_000, 0)).await,
        Ok(())
    );

    t.clock.set(2_000);
    assert_eq!(t.manager.sweep().await.removed, 1);

    t.manager.load_shard(0, 1, no_recovery()).await.unwrap();
    assert_eq!(t.manager.get_state("txn"), Ok(None));
}
