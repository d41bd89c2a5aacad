//! Transaction state structures
//!
//! Defines the state machine, the per-transactional-id metadata record and
//! the immutable transition snapshot that is written to the transaction log.
//!
//! A transition is always two-phase: a `prepare_*` method validates the move
//! and records it as the metadata's pending state, the snapshot is appended
//! to the log, and once the append succeeds the pending transition is
//! committed with [`TransactionMetadata::complete_transition_to`].

use crate::error::{CoordinatorError, Result, TxnStateError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Producer instance identity
pub type ProducerId = i64;

/// Fencing counter for producer incarnations
pub type ProducerEpoch = i16;

/// Sentinel for "no producer id"
pub const NO_PRODUCER_ID: ProducerId = -1;

/// Sentinel for "no producer epoch"
pub const NO_PRODUCER_EPOCH: ProducerEpoch = -1;

/// Transaction state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Producer registered, no transaction in progress
    Empty,
    /// Transaction has been started but not yet prepared
    Ongoing,
    /// Commit decided, markers not yet written
    PrepareCommit,
    /// Abort decided, markers not yet written
    PrepareAbort,
    /// Transaction has been committed
    CompleteCommit,
    /// Transaction has been aborted
    CompleteAbort,
    /// Transactional id is about to be removed
    Dead,
}

impl TransactionState {
    /// States from which a transition into `self` is legal
    pub fn valid_previous_states(&self) -> &'static [TransactionState] {
        use TransactionState::*;
        match self {
            Empty => &[Empty, CompleteCommit, CompleteAbort],
            Ongoing => &[Ongoing, Empty, CompleteCommit, CompleteAbort],
            PrepareCommit => &[Ongoing],
            PrepareAbort => &[Ongoing, Empty, CompleteCommit, CompleteAbort],
            CompleteCommit => &[PrepareCommit],
            CompleteAbort => &[PrepareAbort],
            Dead => &[Empty, CompleteCommit, CompleteAbort],
        }
    }

    /// Check if a transactional id in this state may be expired
    pub fn is_expiration_allowed(&self) -> bool {
        matches!(
            self,
            TransactionState::Empty
                | TransactionState::CompleteCommit
                | TransactionState::CompleteAbort
        )
    }

    /// Check if this is a preparing state
    pub fn is_preparing(&self) -> bool {
        matches!(
            self,
            TransactionState::PrepareCommit | TransactionState::PrepareAbort
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Empty => write!(f, "Empty"),
            TransactionState::Ongoing => write!(f, "Ongoing"),
            TransactionState::PrepareCommit => write!(f, "PrepareCommit"),
            TransactionState::PrepareAbort => write!(f, "PrepareAbort"),
            TransactionState::CompleteCommit => write!(f, "CompleteCommit"),
            TransactionState::CompleteAbort => write!(f, "CompleteAbort"),
            TransactionState::Dead => write!(f, "Dead"),
        }
    }
}

/// Outcome of a prepared transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionResult {
    Commit,
    Abort,
}

/// A topic-partition participating in a transaction
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionPartition {
    /// Topic name
    pub topic: String,
    /// Partition index
    pub partition: i32,
}

impl TransactionPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// Immutable snapshot of a proposed transition
///
/// Compared by value: an append completion only commits if the metadata's
/// pending state is still equal to the snapshot it appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnTransitMetadata {
    pub producer_id: ProducerId,
    pub producer_epoch: ProducerEpoch,
    pub last_producer_epoch: ProducerEpoch,
    pub txn_timeout_ms: i64,
    pub txn_state: TransactionState,
    pub topic_partitions: BTreeSet<TransactionPartition>,
    pub txn_start_timestamp_ms: i64,
    pub txn_last_update_timestamp_ms: i64,
}

/// Per-transactional-id state tracked by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMetadata {
    /// The transactional ID
    pub transactional_id: String,
    /// The producer ID associated with this transactional ID
    pub producer_id: ProducerId,
    /// Current producer epoch
    pub producer_epoch: ProducerEpoch,
    /// Epoch before the last bump, used to recognise retried requests
    pub last_producer_epoch: ProducerEpoch,
    /// Transaction timeout in milliseconds
    pub txn_timeout_ms: i64,
    /// Current transaction state
    pub state: TransactionState,
    /// Partitions participating in the current transaction
    pub topic_partitions: BTreeSet<TransactionPartition>,
    /// Start of the current transaction (unix ms), -1 when none
    pub txn_start_timestamp_ms: i64,
    /// Last state change (unix ms)
    pub txn_last_update_timestamp_ms: i64,
    /// Transition currently being written to the log
    pub pending_state: Option<TxnTransitMetadata>,
}

impl TransactionMetadata {
    /// Create metadata for a newly registered transactional id
    pub fn new(
        transactional_id: impl Into<String>,
        producer_id: ProducerId,
        producer_epoch: ProducerEpoch,
        txn_timeout_ms: i64,
        now_ms: i64,
    ) -> Self {
        Self {
            transactional_id: transactional_id.into(),
            producer_id,
            producer_epoch,
            last_producer_epoch: NO_PRODUCER_EPOCH,
            txn_timeout_ms,
            state: TransactionState::Empty,
            topic_partitions: BTreeSet::new(),
            txn_start_timestamp_ms: -1,
            txn_last_update_timestamp_ms: now_ms,
            pending_state: None,
        }
    }

    /// Rebuild metadata from a snapshot read back from the log
    pub fn from_transit(transactional_id: impl Into<String>, transit: &TxnTransitMetadata) -> Self {
        Self {
            transactional_id: transactional_id.into(),
            producer_id: transit.producer_id,
            producer_epoch: transit.producer_epoch,
            last_producer_epoch: transit.last_producer_epoch,
            txn_timeout_ms: transit.txn_timeout_ms,
            state: transit.txn_state,
            topic_partitions: transit.topic_partitions.clone(),
            txn_start_timestamp_ms: transit.txn_start_timestamp_ms,
            txn_last_update_timestamp_ms: transit.txn_last_update_timestamp_ms,
            pending_state: None,
        }
    }

    /// Check if a transition is currently being written
    pub fn pending_transition_in_progress(&self) -> bool {
        self.pending_state.is_some()
    }

    /// Check if an ongoing transaction has exceeded its timeout
    pub fn is_ongoing_timed_out(&self, now_ms: i64) -> bool {
        self.state == TransactionState::Ongoing
            && !self.pending_transition_in_progress()
            && self.txn_start_timestamp_ms + self.txn_timeout_ms < now_ms
    }

    /// Snapshot of the current state without registering a transition
    pub fn prepare_no_transit(&self) -> TxnTransitMetadata {
        TxnTransitMetadata {
            producer_id: self.producer_id,
            producer_epoch: self.producer_epoch,
            last_producer_epoch: self.last_producer_epoch,
            txn_timeout_ms: self.txn_timeout_ms,
            txn_state: self.state,
            topic_partitions: self.topic_partitions.clone(),
            txn_start_timestamp_ms: self.txn_start_timestamp_ms,
            txn_last_update_timestamp_ms: self.txn_last_update_timestamp_ms,
        }
    }

    /// Bump the producer epoch and reset to `Empty` (InitProducerId)
    pub fn prepare_increment_producer_epoch(
        &mut self,
        new_txn_timeout_ms: i64,
        now_ms: i64,
    ) -> Result<TxnTransitMetadata> {
        if self.producer_epoch == ProducerEpoch::MAX {
            return Err(TxnStateError::illegal_state(format!(
                "Cannot bump producer epoch for {}: epoch is exhausted",
                self.transactional_id
            )));
        }

        let mut transit = self.prepare_no_transit();
        transit.producer_epoch = self.producer_epoch + 1;
        transit.last_producer_epoch = self.producer_epoch;
        transit.txn_timeout_ms = new_txn_timeout_ms;
        transit.txn_state = TransactionState::Empty;
        transit.topic_partitions.clear();
        transit.txn_start_timestamp_ms = -1;
        transit.txn_last_update_timestamp_ms = now_ms;
        self.prepare_transition_to(transit)
    }

    /// Enlist partitions, moving the transaction to `Ongoing`
    pub fn prepare_add_partitions(
        &mut self,
        partitions: impl IntoIterator<Item = TransactionPartition>,
        now_ms: i64,
    ) -> Result<TxnTransitMetadata> {
        let mut transit = self.prepare_no_transit();
        transit.txn_state = TransactionState::Ongoing;
        if matches!(
            self.state,
            TransactionState::Empty
                | TransactionState::CompleteCommit
                | TransactionState::CompleteAbort
        ) {
            transit.topic_partitions.clear();
            transit.txn_start_timestamp_ms = now_ms;
        }
        transit.topic_partitions.extend(partitions);
        transit.txn_last_update_timestamp_ms = now_ms;
        self.prepare_transition_to(transit)
    }

    /// Record the commit/abort decision
    pub fn prepare_abort_or_commit(
        &mut self,
        new_state: TransactionState,
        now_ms: i64,
    ) -> Result<TxnTransitMetadata> {
        if !new_state.is_preparing() {
            return Err(TxnStateError::illegal_state(format!(
                "{} is not a prepare state",
                new_state
            )));
        }

        let mut transit = self.prepare_no_transit();
        transit.txn_state = new_state;
        transit.txn_last_update_timestamp_ms = now_ms;
        self.prepare_transition_to(transit)
    }

    /// Complete a prepared transaction once its markers are written
    pub fn prepare_complete(&mut self, now_ms: i64) -> Result<TxnTransitMetadata> {
        let new_state = match self.state {
            TransactionState::PrepareCommit => TransactionState::CompleteCommit,
            TransactionState::PrepareAbort => TransactionState::CompleteAbort,
            other => {
                return Err(TxnStateError::illegal_state(format!(
                    "Cannot complete transaction {} in {} state",
                    self.transactional_id, other
                )))
            }
        };

        let mut transit = self.prepare_no_transit();
        transit.txn_state = new_state;
        transit.topic_partitions.clear();
        transit.txn_last_update_timestamp_ms = now_ms;
        self.prepare_transition_to(transit)
    }

    /// Mark the transactional id for removal
    pub fn prepare_dead(&mut self) -> Result<TxnTransitMetadata> {
        let mut transit = self.prepare_no_transit();
        transit.txn_state = TransactionState::Dead;
        transit.topic_partitions.clear();
        self.prepare_transition_to(transit)
    }

    fn prepare_transition_to(&mut self, transit: TxnTransitMetadata) -> Result<TxnTransitMetadata> {
        if self.pending_transition_in_progress() {
            return Err(CoordinatorError::ConcurrentTransactions.into());
        }

        if !transit
            .txn_state
            .valid_previous_states()
            .contains(&self.state)
        {
            return Err(TxnStateError::illegal_state(format!(
                "Transactional id {} cannot transition from {} to {}",
                self.transactional_id, self.state, transit.txn_state
            )));
        }

        self.pending_state = Some(transit.clone());
        Ok(transit)
    }

    /// Commit a pending transition after its log append succeeded
    pub fn complete_transition_to(&mut self, transit: &TxnTransitMetadata) -> Result<()> {
        match &self.pending_state {
            Some(pending) if pending == transit => {}
            Some(pending) => {
                return Err(TxnStateError::illegal_state(format!(
                    "Completing transition to {} for {} but pending transition is to {}",
                    transit.txn_state, self.transactional_id, pending.txn_state
                )))
            }
            None => {
                return Err(TxnStateError::illegal_state(format!(
                    "Completing transition to {} for {} with no pending transition",
                    transit.txn_state, self.transactional_id
                )))
            }
        }

        if !transit
            .txn_state
            .valid_previous_states()
            .contains(&self.state)
        {
            return Err(TxnStateError::illegal_state(format!(
                "Transactional id {} cannot complete transition from {} to {}",
                self.transactional_id, self.state, transit.txn_state
            )));
        }

        self.producer_id = transit.producer_id;
        self.producer_epoch = transit.producer_epoch;
        self.last_producer_epoch = transit.last_producer_epoch;
        self.txn_timeout_ms = transit.txn_timeout_ms;
        self.state = transit.txn_state;
        self.topic_partitions = transit.topic_partitions.clone();
        self.txn_start_timestamp_ms = transit.txn_start_timestamp_ms;
        self.txn_last_update_timestamp_ms = transit.txn_last_update_timestamp_ms;
        self.pending_state = None;
        Ok(())
    }
}
