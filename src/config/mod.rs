//! Configuration for the transaction state manager
//!
//! Configuration can be built in code (starting from [`Default`]) or loaded
//! from a TOML file:
//!
//! ```toml
//! # transaction-state.toml
//! num_partitions = 50
//! transactional_id_expiration_ms = 604800000
//! transaction_max_timeout_ms = 900000
//! load_buffer_size = 5242880
//! remove_expired_transactional_ids_interval_ms = 3600000
//! abort_timed_out_transactions_interval_ms = 10000
//! ```
//!
//! Missing keys fall back to the values in [`defaults`].

pub mod defaults;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, TxnStateError};
use defaults::{
    DEFAULT_ABORT_TIMED_OUT_INTERVAL_MS, DEFAULT_LOAD_BUFFER_SIZE, DEFAULT_NUM_PARTITIONS,
    DEFAULT_REMOVE_EXPIRED_INTERVAL_MS, DEFAULT_TRANSACTIONAL_ID_EXPIRATION_MS,
    DEFAULT_TRANSACTION_MAX_TIMEOUT_MS,
};

/// Transaction state manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionStateConfig {
    /// Number of partitions of the transaction state topic, used when the
    /// partition count source cannot answer
    pub num_partitions: u32,

    /// Idle time after which a completed transactional id is removed
    pub transactional_id_expiration_ms: i64,

    /// Upper bound for client-requested transaction timeouts
    pub transaction_max_timeout_ms: i64,

    /// Maximum bytes read per chunk while loading a shard
    pub load_buffer_size: usize,

    /// Interval between expiration sweeps
    pub remove_expired_transactional_ids_interval_ms: u64,

    /// Interval at which the coordinator checks for timed-out transactions
    pub abort_timed_out_transactions_interval_ms: u64,
}

impl Default for TransactionStateConfig {
    fn default() -> Self {
        Self {
            num_partitions: DEFAULT_NUM_PARTITIONS,
            transactional_id_expiration_ms: DEFAULT_TRANSACTIONAL_ID_EXPIRATION_MS,
            transaction_max_timeout_ms: DEFAULT_TRANSACTION_MAX_TIMEOUT_MS,
            load_buffer_size: DEFAULT_LOAD_BUFFER_SIZE,
            remove_expired_transactional_ids_interval_ms: DEFAULT_REMOVE_EXPIRED_INTERVAL_MS,
            abort_timed_out_transactions_interval_ms: DEFAULT_ABORT_TIMED_OUT_INTERVAL_MS,
        }
    }
}

impl TransactionStateConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TxnStateError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config = Self::from_toml_str(&contents).map_err(|e| {
            tracing::error!(path = ?path, error = %e, "Invalid transaction state configuration");
            e
        })?;

        tracing::info!("Loaded transaction state configuration from {:?}", path);
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.num_partitions == 0 {
            return Err(TxnStateError::Config(
                "num_partitions must be greater than 0".to_string(),
            ));
        }
        if self.transactional_id_expiration_ms <= 0 {
            return Err(TxnStateError::Config(
                "transactional_id_expiration_ms must be positive".to_string(),
            ));
        }
        if self.transaction_max_timeout_ms <= 0 {
            return Err(TxnStateError::Config(
                "transaction_max_timeout_ms must be positive".to_string(),
            ));
        }
        if self.load_buffer_size == 0 {
            return Err(TxnStateError::Config(
                "load_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.remove_expired_transactional_ids_interval_ms == 0
            || self.abort_timed_out_transactions_interval_ms == 0
        {
            return Err(TxnStateError::Config(
                "task intervals must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns true if a client-requested transaction timeout is acceptable
    pub fn validate_transaction_timeout(&self, txn_timeout_ms: i64) -> bool {
        txn_timeout_ms > 0 && txn_timeout_ms <= self.transaction_max_timeout_ms
    }
}
