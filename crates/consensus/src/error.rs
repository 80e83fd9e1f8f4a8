//! Consensus errors

use powchain_admission::AdmissionError;
use powchain_codec::{Address, H256};
use powchain_runtime::ExecutionError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("{got} is not the proposer for height {height} (expected {expected})")]
    NotProposer {
        height: u64,
        expected: Address,
        got: Address,
    },

    #[error("parent {parent} of block {index} is unknown")]
    UnknownParent { index: u64, parent: H256 },

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("block proof rejected: {0}")]
    Proof(#[from] AdmissionError),

    #[error("block execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("reorganization of depth {depth} exceeds limit {max}")]
    ReorgTooDeep { depth: u64, max: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    /// The chain can no longer be trusted; the engine halts
    #[error("fatal consensus failure: {0}")]
    Fatal(String),

    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("consensus worker is not running")]
    Closed,
}

impl ConsensusError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::Fatal(_))
    }
}

impl From<anyhow::Error> for ConsensusError {
    fn from(e: anyhow::Error) -> Self {
        ConsensusError::Storage(e.to_string())
    }
}
