//! Transaction state log record format
//!
//! Every transition of a transactional id is persisted as one record in the
//! transaction state log. The key identifies the transactional id, the value
//! is a full snapshot of the metadata after the transition. A record with no
//! value is a tombstone: on replay it removes the transactional id.
//!
//! Keys and values are versioned JSON documents so that a newer broker can
//! recognise (and skip) records it does not understand.

use crate::error::{Result, StoreError, TxnStateError};
use crate::transaction::state::{
    ProducerEpoch, ProducerId, TransactionMetadata, TransactionPartition, TransactionState,
    TxnTransitMetadata,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current key schema version
pub const TXN_LOG_KEY_VERSION: u16 = 0;

/// Current value schema version
pub const TXN_LOG_VALUE_VERSION: u16 = 0;

/// Fixed size of a record batch header
pub const RECORD_BATCH_OVERHEAD: usize = 61;

/// Upper bound of the per-record framing overhead
pub const RECORD_OVERHEAD: usize = 21;

/// A single record of the transaction state log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Bytes,
    /// `None` marks a tombstone
    pub value: Option<Bytes>,
    pub timestamp_ms: i64,
}

impl LogRecord {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Size of this record once framed in a batch
    pub fn size_in_bytes(&self) -> usize {
        RECORD_OVERHEAD + self.key.len() + self.value.as_ref().map_or(0, |v| v.len())
    }
}

/// Size of a batch holding `records`
pub fn batch_size_in_bytes(records: &[LogRecord]) -> usize {
    RECORD_BATCH_OVERHEAD + records.iter().map(LogRecord::size_in_bytes).sum::<usize>()
}

/// Decoded record key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnRecordKey {
    Transaction(String),
    /// Written by a newer schema version this broker does not understand
    Unknown(u16),
}

#[derive(Debug, Serialize, Deserialize)]
struct TxnLogKey {
    version: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transactional_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TxnLogPartitions {
    topic: String,
    partitions: Vec<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TxnLogValue {
    version: u16,
    producer_id: ProducerId,
    producer_epoch: ProducerEpoch,
    last_producer_epoch: ProducerEpoch,
    txn_timeout_ms: i64,
    state: TransactionState,
    partitions: Vec<TxnLogPartitions>,
    txn_start_timestamp_ms: i64,
    txn_last_update_timestamp_ms: i64,
}

/// Encode the key for a transactional id
pub fn key_to_bytes(transactional_id: &str) -> Result<Bytes> {
    let key = TxnLogKey {
        version: TXN_LOG_KEY_VERSION,
        transactional_id: Some(transactional_id.to_string()),
    };
    Ok(Bytes::from(serde_json::to_vec(&key)?))
}

/// Encode the value for a transition snapshot
pub fn value_to_bytes(transit: &TxnTransitMetadata) -> Result<Bytes> {
    if transit.txn_state == TransactionState::Empty && !transit.topic_partitions.is_empty() {
        return Err(TxnStateError::illegal_state(format!(
            "Transaction is not expected to have any partitions since its state is {}: {:?}",
            transit.txn_state, transit.topic_partitions
        )));
    }

    // topic_partitions is ordered, so grouping keeps a stable layout
    let mut grouped: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
    for tp in &transit.topic_partitions {
        grouped.entry(tp.topic.as_str()).or_default().push(tp.partition);
    }

    let value = TxnLogValue {
        version: TXN_LOG_VALUE_VERSION,
        producer_id: transit.producer_id,
        producer_epoch: transit.producer_epoch,
        last_producer_epoch: transit.last_producer_epoch,
        txn_timeout_ms: transit.txn_timeout_ms,
        state: transit.txn_state,
        partitions: grouped
            .into_iter()
            .map(|(topic, partitions)| TxnLogPartitions {
                topic: topic.to_string(),
                partitions,
            })
            .collect(),
        txn_start_timestamp_ms: transit.txn_start_timestamp_ms,
        txn_last_update_timestamp_ms: transit.txn_last_update_timestamp_ms,
    };
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

/// Decode a record key
pub fn read_key(bytes: &[u8]) -> Result<TxnRecordKey> {
    let key: TxnLogKey = serde_json::from_slice(bytes)?;
    if key.version > TXN_LOG_KEY_VERSION {
        return Ok(TxnRecordKey::Unknown(key.version));
    }
    key.transactional_id
        .map(TxnRecordKey::Transaction)
        .ok_or_else(|| {
            StoreError::CorruptedData("transaction log key without transactional id".into())
                .into()
        })
}

/// Decode a record value; `None` input (tombstone) yields `None`
pub fn read_value(transactional_id: &str, bytes: Option<&[u8]>) -> Result<Option<TransactionMetadata>> {
    let Some(bytes) = bytes else {
        return Ok(None);
    };

    let value: TxnLogValue = serde_json::from_slice(bytes)?;
    if value.version > TXN_LOG_VALUE_VERSION {
        return Err(StoreError::CorruptedData(format!(
            "unknown transaction log value version {} for {}",
            value.version, transactional_id
        ))
        .into());
    }

    let transit = TxnTransitMetadata {
        producer_id: value.producer_id,
        producer_epoch: value.producer_epoch,
        last_producer_epoch: value.last_producer_epoch,
        txn_timeout_ms: value.txn_timeout_ms,
        txn_state: value.state,
        topic_partitions: value
            .partitions
            .into_iter()
            .flat_map(|p| {
                let topic = p.topic;
                p.partitions
                    .into_iter()
                    .map(move |partition| TransactionPartition::new(topic.clone(), partition))
            })
            .collect(),
        txn_start_timestamp_ms: value.txn_start_timestamp_ms,
        txn_last_update_timestamp_ms: value.txn_last_update_timestamp_ms,
    };
    Ok(Some(TransactionMetadata::from_transit(
        transactional_id,
        &transit,
    )))
}

/// Build the record persisting a transition
pub fn transition_record(
    transactional_id: &str,
    transit: &TxnTransitMetadata,
    timestamp_ms: i64,
) -> Result<LogRecord> {
    Ok(LogRecord {
        key: key_to_bytes(transactional_id)?,
        value: Some(value_to_bytes(transit)?),
        timestamp_ms,
    })
}

/// Build the tombstone removing a transactional id
pub fn tombstone_record(transactional_id: &str, timestamp_ms: i64) -> Result<LogRecord> {
    Ok(LogRecord {
        key: key_to_bytes(transactional_id)?,
        value: None,
        timestamp_ms,
    })
}

/// Accumulates records into a batch bounded by a maximum size
///
/// The first record is always accepted, so a single oversized record still
/// gets its own batch; every further record must keep the batch strictly
/// below the bound.
#[derive(Debug)]
pub struct RecordBatchBuilder {
    max_batch_size: usize,
    records: Vec<LogRecord>,
    size_in_bytes: usize,
}

impl RecordBatchBuilder {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size,
            records: Vec::new(),
            size_in_bytes: RECORD_BATCH_OVERHEAD,
        }
    }

    pub fn has_room_for(&self, record: &LogRecord) -> bool {
        self.records.is_empty() || self.size_in_bytes + record.size_in_bytes() < self.max_batch_size
    }

    pub fn push(&mut self, record: LogRecord) {
        self.size_in_bytes += record.size_in_bytes();
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn build(self) -> Vec<LogRecord> {
        self.records
    }
}
