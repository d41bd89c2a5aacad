//! Shared fixtures for transaction state integration tests
//!
//! # Usage
//!
//! In your test file, add:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::Arc;

use streamline_txn_state::clock::ManualClock;
use streamline_txn_state::config::TransactionStateConfig;
use streamline_txn_state::transaction::{
    partition_for, FixedPartitionCount, InMemoryLogStore, MarkerRecoveryCallback,
    TransactionStateManager, TransitionCallback,
};
use streamline_txn_state::CoordinatorError;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

/// Initialize test logging
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("streamline_txn_state=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Manager wired to an in-memory store and a manual clock
pub struct TestManager {
    pub manager: Arc<TransactionStateManager>,
    pub store: Arc<InMemoryLogStore>,
    pub clock: Arc<ManualClock>,
}

impl TestManager {
    pub fn new(num_partitions: u32) -> Self {
        Self::with_config(num_partitions, TransactionStateConfig::default())
    }

    pub fn with_config(num_partitions: u32, config: TransactionStateConfig) -> Self {
        Self::on_store(num_partitions, config, Arc::new(InMemoryLogStore::new()))
    }

    /// Second manager sharing the log of an existing one, as after a failover
    pub fn on_store(
        num_partitions: u32,
        config: TransactionStateConfig,
        store: Arc<InMemoryLogStore>,
    ) -> Self {
        init_logging();
        let clock = Arc::new(ManualClock::new(1_000));
        let manager = TransactionStateManager::new(
            config,
            store.clone(),
            clock.clone(),
            &FixedPartitionCount(num_partitions),
        )
        .unwrap();
        Self {
            manager: Arc::new(manager),
            store,
            clock,
        }
    }

    /// Load every shard at `epoch` and wait for the loads to finish
    pub async fn load_all(&self, epoch: i32) {
        for partition in 0..self.manager.num_partitions() as i32 {
            self.manager
                .load_shard(partition, epoch, no_recovery())
                .await
                .unwrap();
        }
    }
}

pub fn no_recovery() -> MarkerRecoveryCallback {
    Arc::new(|_, _, _, _, _| {})
}

/// Callback forwarding the append outcome to a receiver
pub fn completion() -> (
    TransitionCallback,
    oneshot::Receiver<Result<(), CoordinatorError>>,
) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        rx,
    )
}

/// First id of the form `{prefix}-{n}` owned by `partition`
pub fn id_in_partition(prefix: &str, partition: i32, num_partitions: u32) -> String {
    (0..)
        .map(|n| format!("{}-{}", prefix, n))
        .find(|id| partition_for(id, num_partitions) == partition)
        .unwrap()
}
