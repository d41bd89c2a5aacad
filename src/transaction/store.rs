//! Transaction state log storage
//!
//! The manager never touches segments, replication or offsets directly; it
//! goes through [`TransactionLogStore`]. Brokers plug in their replicated
//! log, tests and embedded setups use [`InMemoryLogStore`].

use crate::error::{StoreError, StoreResult};
use crate::transaction::log::{batch_size_in_bytes, LogRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Default maximum batch size of the in-memory store (1 MB)
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1024 * 1024;

/// Completion handler of an append; receives the base offset on success
pub type AppendCompletion = Box<dyn FnOnce(StoreResult<i64>) + Send + 'static>;

/// A record together with its log offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRecord {
    pub offset: i64,
    pub record: LogRecord,
}

/// Result of a single read
#[derive(Debug, Clone, Default)]
pub struct FetchedRecords {
    pub records: Vec<OffsetRecord>,
}

impl FetchedRecords {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Offset following the last returned record
    pub fn next_offset(&self) -> Option<i64> {
        self.records.last().map(|r| r.offset + 1)
    }
}

/// Log storage used by the transaction state manager
#[async_trait]
pub trait TransactionLogStore: Send + Sync {
    /// Read records starting at `offset`, returning roughly `max_bytes`
    /// (at least one record if any is available)
    async fn read(&self, partition: i32, offset: i64, max_bytes: usize) -> StoreResult<FetchedRecords>;

    /// Submit records for append without waiting for the outcome
    ///
    /// `on_complete` is invoked exactly once when the append finished, on
    /// any thread. Implementations must not block the caller.
    fn append(&self, partition: i32, records: Vec<LogRecord>, on_complete: AppendCompletion);

    /// First offset of the partition, `None` if the partition is unavailable
    fn log_start_offset(&self, partition: i32) -> Option<i64>;

    /// Offset of the next record to be written, `None` if unavailable
    fn log_end_offset(&self, partition: i32) -> Option<i64>;

    /// Largest batch the partition accepts, `None` if its config is unavailable
    fn max_batch_size(&self, partition: i32) -> Option<usize>;
}

#[derive(Debug)]
struct PartitionLog {
    start_offset: i64,
    records: Vec<OffsetRecord>,
    max_batch_size: Option<usize>,
    /// Scripted outcomes of upcoming appends, `None` lets one through
    append_outcomes: VecDeque<Option<StoreError>>,
    read_error: Option<StoreError>,
    batches: Vec<Vec<LogRecord>>,
}

impl PartitionLog {
    fn new(max_batch_size: Option<usize>) -> Self {
        Self {
            start_offset: 0,
            records: Vec::new(),
            max_batch_size,
            append_outcomes: VecDeque::new(),
            read_error: None,
            batches: Vec::new(),
        }
    }

    fn end_offset(&self) -> i64 {
        self.records
            .last()
            .map_or(self.start_offset, |r| r.offset + 1)
    }

    fn write(&mut self, records: Vec<LogRecord>) -> StoreResult<i64> {
        if let Some(Some(err)) = self.append_outcomes.pop_front() {
            return Err(err);
        }

        let size = batch_size_in_bytes(&records);
        if let Some(max) = self.max_batch_size {
            if size > max {
                return Err(StoreError::RecordListTooLarge(size, max));
            }
        }

        let base_offset = self.end_offset();
        for (i, record) in records.iter().enumerate() {
            self.records.push(OffsetRecord {
                offset: base_offset + i as i64,
                record: record.clone(),
            });
        }
        self.batches.push(records);
        Ok(base_offset)
    }
}

struct HeldAppend {
    partition: i32,
    records: Vec<LogRecord>,
    on_complete: AppendCompletion,
}

#[derive(Default)]
struct StoreInner {
    partitions: HashMap<i32, PartitionLog>,
    holding: bool,
    held: Vec<HeldAppend>,
}

/// In-memory transaction log with fault injection
///
/// Appends complete inline unless [`hold_appends`](Self::hold_appends) is
/// active, in which case they queue until
/// [`release_held_appends`](Self::release_held_appends).
pub struct InMemoryLogStore {
    inner: Mutex<StoreInner>,
    default_max_batch_size: Option<usize>,
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::with_max_batch_size(Some(DEFAULT_MAX_BATCH_SIZE))
    }

    /// Create a store whose partitions default to the given max batch size
    pub fn with_max_batch_size(max_batch_size: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            default_max_batch_size: max_batch_size,
        }
    }

    fn with_partition<R>(&self, partition: i32, f: impl FnOnce(&mut PartitionLog) -> R) -> R {
        let mut inner = self.inner.lock();
        let default_max = self.default_max_batch_size;
        let log = inner
            .partitions
            .entry(partition)
            .or_insert_with(|| PartitionLog::new(default_max));
        f(log)
    }

    /// Append records synchronously, bypassing fault injection and holds
    pub fn append_records(&self, partition: i32, records: Vec<LogRecord>) -> i64 {
        self.with_partition(partition, |log| {
            let base_offset = log.end_offset();
            for (i, record) in records.into_iter().enumerate() {
                log.records.push(OffsetRecord {
                    offset: base_offset + i as i64,
                    record,
                });
            }
            base_offset
        })
    }

    /// Fail the next append on `partition` with `err`
    pub fn inject_append_error(&self, partition: i32, err: StoreError) {
        self.with_partition(partition, |log| log.append_outcomes.push_back(Some(err)));
    }

    /// Script the outcomes of the next appends on `partition` in order
    pub fn script_appends(
        &self,
        partition: i32,
        outcomes: impl IntoIterator<Item = Option<StoreError>>,
    ) {
        self.with_partition(partition, |log| log.append_outcomes.extend(outcomes));
    }

    /// Fail every read on `partition` until cleared with `None`
    pub fn set_read_error(&self, partition: i32, err: Option<StoreError>) {
        self.with_partition(partition, |log| log.read_error = err);
    }

    pub fn set_max_batch_size(&self, partition: i32, max_batch_size: Option<usize>) {
        self.with_partition(partition, |log| log.max_batch_size = max_batch_size);
    }

    /// Move the log start offset forward, dropping earlier records
    pub fn truncate_before(&self, partition: i32, offset: i64) {
        self.with_partition(partition, |log| {
            log.records.retain(|r| r.offset >= offset);
            log.start_offset = offset;
        });
    }

    /// Queue appends instead of completing them
    pub fn hold_appends(&self) {
        self.inner.lock().holding = true;
    }

    /// Write and complete every queued append; returns how many were released
    pub fn release_held_appends(&self) -> usize {
        let held = {
            let mut inner = self.inner.lock();
            inner.holding = false;
            std::mem::take(&mut inner.held)
        };

        let count = held.len();
        for append in held {
            let result = self.with_partition(append.partition, |log| log.write(append.records));
            (append.on_complete)(result);
        }
        count
    }

    /// Records currently in the partition, in offset order
    pub fn records(&self, partition: i32) -> Vec<OffsetRecord> {
        self.with_partition(partition, |log| log.records.clone())
    }

    /// Batches accepted through [`TransactionLogStore::append`]
    pub fn appended_batches(&self, partition: i32) -> Vec<Vec<LogRecord>> {
        self.with_partition(partition, |log| log.batches.clone())
    }
}

#[async_trait]
impl TransactionLogStore for InMemoryLogStore {
    async fn read(&self, partition: i32, offset: i64, max_bytes: usize) -> StoreResult<FetchedRecords> {
        tokio::task::yield_now().await;

        self.with_partition(partition, |log| {
            if let Some(err) = &log.read_error {
                return Err(err.clone());
            }
            if offset < log.start_offset || offset > log.end_offset() {
                return Err(StoreError::OffsetOutOfRange(offset));
            }

            let mut fetched = FetchedRecords::default();
            let mut bytes = 0;
            for r in log.records.iter().filter(|r| r.offset >= offset) {
                if !fetched.records.is_empty() && bytes + r.record.size_in_bytes() > max_bytes {
                    break;
                }
                bytes += r.record.size_in_bytes();
                fetched.records.push(r.clone());
            }
            Ok(fetched)
        })
    }

    fn append(&self, partition: i32, records: Vec<LogRecord>, on_complete: AppendCompletion) {
        {
            let mut inner = self.inner.lock();
            if inner.holding {
                inner.held.push(HeldAppend {
                    partition,
                    records,
                    on_complete,
                });
                return;
            }
        }

        let result = self.with_partition(partition, |log| log.write(records));
        on_complete(result);
    }

    fn log_start_offset(&self, partition: i32) -> Option<i64> {
        Some(self.with_partition(partition, |log| log.start_offset))
    }

    fn log_end_offset(&self, partition: i32) -> Option<i64> {
        Some(self.with_partition(partition, |log| log.end_offset()))
    }

    fn max_batch_size(&self, partition: i32) -> Option<usize> {
        self.with_partition(partition, |log| log.max_batch_size)
    }
}
