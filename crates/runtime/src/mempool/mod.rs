//! Mempool - priority-ordered transaction staging
//!
//! `TransactionPool` is the single-owner data structure; `MempoolService`
//! runs it on a dedicated tokio task and is reached only through the bounded
//! command queue behind `MempoolHandle`.

pub mod pool;
pub mod service;

pub use pool::TransactionPool;
pub use service::{MempoolHandle, MempoolService};

use powchain_codec::H256;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default maximum number of pending transactions
pub const DEFAULT_POOL_CAPACITY: usize = 10_000;

/// Mempool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Maximum pending transactions
    pub capacity: usize,
    /// Accepted nonces are `(on_chain, on_chain + nonce_window]`
    pub nonce_window: u64,
    /// Entries older than this are dropped by the sweep
    #[serde(with = "duration_secs")]
    pub entry_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// Command queue depth
    pub queue_depth: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            nonce_window: 64,
            entry_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            queue_depth: 1024,
        }
    }
}

/// Why a transaction was not admitted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("invalid transaction: {0}")]
    Validation(String),

    #[error("signature does not verify for sender")]
    InvalidSignature,

    #[error("nonce {got} outside accepted range {min}..={max}")]
    NonceConflict { got: u64, min: u64, max: u64 },

    #[error("nonce {nonce} already pending for this sender")]
    NoncePending { nonce: u64 },

    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("transaction {0} already pending")]
    Duplicate(H256),

    #[error("mempool full: priority must exceed {min_priority}")]
    MempoolFull { min_priority: u64 },

    #[error("mempool worker is not running")]
    Closed,

    #[error("account lookup failed: {0}")]
    Storage(String),
}

/// Mempool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MempoolStats {
    pub pending: usize,
    pub capacity: usize,
    pub unique_senders: usize,
    pub total_added: u64,
    pub total_removed: u64,
    pub total_evicted: u64,
    pub total_expired: u64,
    pub total_rejected: u64,
}

pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
