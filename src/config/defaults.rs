//! Default constants for transaction state configuration
//!
//! These constants define the default values used when no explicit value is
//! provided in the configuration file.

/// Name of the internal topic holding transaction state
pub const TRANSACTION_STATE_TOPIC: &str = "__transaction_state";

/// Default number of partitions of the transaction state topic
pub const DEFAULT_NUM_PARTITIONS: u32 = 50;

/// Default time after which an idle transactional id expires (7 days)
pub const DEFAULT_TRANSACTIONAL_ID_EXPIRATION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Default maximum transaction timeout a client may request (15 minutes)
pub const DEFAULT_TRANSACTION_MAX_TIMEOUT_MS: i64 = 15 * 60 * 1000;

/// Default read chunk size used while loading a shard (5 MB)
pub const DEFAULT_LOAD_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// Default interval between expiration sweeps (1 hour)
pub const DEFAULT_REMOVE_EXPIRED_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Default interval between timed-out transaction checks (10 seconds)
pub const DEFAULT_ABORT_TIMED_OUT_INTERVAL_MS: u64 = 10_000;
