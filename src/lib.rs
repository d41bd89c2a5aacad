#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Streamline transaction state
//!
//! State storage for the Streamline transaction coordinator. For every
//! transactional id it tracks the lifecycle of the current multi-partition
//! transaction, persists each transition to the internal
//! `__transaction_state` log and rebuilds that state when the broker becomes
//! coordinator for a partition of the log.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamline_txn_state::clock::SystemClock;
//! use streamline_txn_state::config::TransactionStateConfig;
//! use streamline_txn_state::transaction::{
//!     FixedPartitionCount, InMemoryLogStore, TransactionMetadata, TransactionPartition,
//!     TransactionStateManager,
//! };
//!
//! #[tokio::main]
//! async fn main() -> streamline_txn_state::Result<()> {
//!     let manager = TransactionStateManager::new(
//!         TransactionStateConfig::default(),
//!         Arc::new(InMemoryLogStore::new()),
//!         Arc::new(SystemClock),
//!         &FixedPartitionCount(50),
//!     )?;
//!
//!     // Become coordinator for the partition owning "orders-app"
//!     let partition = manager.partition_for("orders-app");
//!     manager.load_shard(partition, 0, Arc::new(|_, _, _, _, _| {})).await.ok();
//!
//!     manager.put_if_absent(TransactionMetadata::new("orders-app", 1000, 0, 60_000, 0))?;
//!     let transit = manager.update("orders-app", 0, |m| {
//!         m.prepare_add_partitions([TransactionPartition::new("orders", 0)], 0)
//!     })?;
//!     manager.append_transition("orders-app", 0, transit, Box::new(|result| {
//!         println!("append finished: {:?}", result);
//!     }))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`transaction`]: cache, loader, writer, expirer and the manager façade
//! - [`config`]: configuration and TOML loading
//! - [`clock`]: wall-clock abstraction
//! - [`error`]: error types and Result alias

// Deny .unwrap() in production code, tests are exempt
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod clock;
pub mod config;
pub mod error;
pub mod transaction;

// Metrics module - always available (provides no-ops when feature disabled)
pub(crate) mod metrics;

pub use error::{CoordinatorError, Result, StoreError, TxnStateError};
