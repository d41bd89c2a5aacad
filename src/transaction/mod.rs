//! Transaction state management for Kafka-compatible exactly-once semantics
//!
//! This module stores the state behind the transaction coordinator:
//!
//! - Transaction metadata and its state machine (Empty, Ongoing,
//!   PrepareCommit/PrepareAbort, CompleteCommit/CompleteAbort, Dead)
//! - A cache sharded by partition of the transaction state log, with
//!   ownership epochs fencing stale coordinators
//! - Loading a shard by replaying its log, recovering transactions whose
//!   outcome was decided before a failover
//! - Appending transitions and committing them once durable
//! - Expiring idle transactional ids with tombstones
//!
//! # Stability
//!
//! This module is **Beta**. The API is functional but may have changes in
//! minor versions.

pub mod cache;
pub mod expirer;
pub mod loader;
pub mod log;
mod manager;
pub mod partitioner;
mod state;
pub mod stats;
pub mod store;
pub mod writer;

pub use cache::{CoordinatorEpochAndTxnMetadata, TransactionMetadataCache};
pub use expirer::ExpirationSummary;
pub use loader::{LoadOutcome, MarkerRecoveryCallback};
pub use manager::{
    TimedOutHandler, TransactionListing, TransactionListingFilter, TransactionStateManager,
    TransactionalIdAndProducerIdEpoch,
};
pub use partitioner::{partition_for, FixedPartitionCount, PartitionCountSource};
pub use state::{
    ProducerEpoch, ProducerId, TransactionMetadata, TransactionPartition, TransactionResult,
    TransactionState, TxnTransitMetadata, NO_PRODUCER_EPOCH, NO_PRODUCER_ID,
};
pub use stats::TransactionStateStatsSnapshot;
pub use store::{InMemoryLogStore, TransactionLogStore};
pub use writer::{RetryPredicate, TransitionCallback};
