//! Error types for the transaction state manager
//!
//! Three layers of errors live here:
//!
//! - [`StoreError`]: failures surfaced by the transaction log store
//! - [`CoordinatorError`]: the coordinator-facing taxonomy, mapped to Kafka
//!   protocol error codes. Store errors are always translated into one of
//!   these before they reach the request layer.
//! - [`TxnStateError`]: the crate error, used for caller bugs (illegal state
//!   transitions), encoding failures and configuration problems.

use thiserror::Error;

/// Result type alias for transaction state operations
pub type Result<T> = std::result::Result<T, TxnStateError>;

/// Result type alias for log store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned to the transaction coordinator request layer
///
/// Success is expressed as `Ok(())`, which corresponds to the protocol's
/// `NONE` error code.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorError {
    /// This broker does not own the shard the transactional id hashes to
    #[error("This is not the correct coordinator")]
    NotCoordinator,

    /// The shard is being loaded from the transaction log
    #[error("The coordinator is loading and hence can't process requests")]
    CoordinatorLoadInProgress,

    /// The transaction log is temporarily unavailable
    #[error("The coordinator is not available")]
    CoordinatorNotAvailable,

    /// Another transition is already in flight for this transactional id
    #[error("The producer attempted to update a transaction while another concurrent operation on the same transaction was ongoing")]
    ConcurrentTransactions,

    /// Unexpected failure while writing the transaction log
    #[error("The server experienced an unexpected error when processing the request")]
    UnknownServerError,
}

impl CoordinatorError {
    /// Kafka protocol error code for this error
    pub fn code(&self) -> i16 {
        match self {
            CoordinatorError::UnknownServerError => -1,
            CoordinatorError::CoordinatorLoadInProgress => 14,
            CoordinatorError::CoordinatorNotAvailable => 15,
            CoordinatorError::NotCoordinator => 16,
            CoordinatorError::ConcurrentTransactions => 51,
        }
    }

    /// Protocol name of this error, used as a metrics label
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorError::NotCoordinator => "NOT_COORDINATOR",
            CoordinatorError::CoordinatorLoadInProgress => "COORDINATOR_LOAD_IN_PROGRESS",
            CoordinatorError::CoordinatorNotAvailable => "COORDINATOR_NOT_AVAILABLE",
            CoordinatorError::ConcurrentTransactions => "CONCURRENT_TRANSACTIONS",
            CoordinatorError::UnknownServerError => "UNKNOWN_SERVER_ERROR",
        }
    }

    /// Returns true if the client is expected to retry (possibly after
    /// rediscovering the coordinator)
    pub fn is_retriable(&self) -> bool {
        !matches!(self, CoordinatorError::UnknownServerError)
    }
}

impl From<CoordinatorError> for i16 {
    fn from(err: CoordinatorError) -> i16 {
        err.code()
    }
}

/// Errors surfaced by the transaction log store
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Not enough in-sync replicas")]
    NotEnoughReplicas,

    #[error("Messages were written to the log, but to fewer in-sync replicas than required")]
    NotEnoughReplicasAfterAppend,

    #[error("Request timed out")]
    RequestTimedOut,

    #[error("Unknown partition: {0}")]
    UnknownTopicOrPartition(i32),

    #[error("Not leader for partition {0}")]
    NotLeaderOrFollower(i32),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Message too large: size={0}, max={1}")]
    MessageTooLarge(usize, usize),

    #[error("Record batch too large: size={0}, max={1}")]
    RecordListTooLarge(usize, usize),

    #[error("Offset {0} is out of range")]
    OffsetOutOfRange(i64),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),
}

impl StoreError {
    /// Translate a log append failure into the coordinator error returned to clients
    pub fn to_coordinator_error(&self) -> CoordinatorError {
        match self {
            StoreError::UnknownTopicOrPartition(_)
            | StoreError::NotEnoughReplicas
            | StoreError::NotEnoughReplicasAfterAppend
            | StoreError::RequestTimedOut => CoordinatorError::CoordinatorNotAvailable,
            StoreError::NotLeaderOrFollower(_) | StoreError::StorageFailure(_) => {
                CoordinatorError::NotCoordinator
            }
            StoreError::MessageTooLarge(_, _)
            | StoreError::RecordListTooLarge(_, _)
            | StoreError::OffsetOutOfRange(_)
            | StoreError::CorruptedData(_) => CoordinatorError::UnknownServerError,
        }
    }
}

/// Main error type for the transaction state manager
#[derive(Debug, Error)]
pub enum TxnStateError {
    /// A caller violated the transition protocol (programming error)
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TxnStateError {
    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        TxnStateError::IllegalState(msg.into())
    }

    /// Coordinator error carried by this error, if any
    pub fn coordinator_error(&self) -> Option<CoordinatorError> {
        match self {
            TxnStateError::Coordinator(e) => Some(*e),
            TxnStateError::Store(e) => Some(e.to_coordinator_error()),
            _ => None,
        }
    }
}
