//! Admission errors
//!
//! Every variant is a local, side-effect free rejection. Messages carry what a
//! submitter needs to retry and nothing about cache contents.

use powchain_codec::Tier;
use std::fmt;
use thiserror::Error;

/// Resource bounded by a tier ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    ProblemSize,
    ProofBytes,
    Memory,
    VerifyOps,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::ProblemSize => "problem size",
            Resource::ProofBytes => "proof bytes",
            Resource::Memory => "memory",
            Resource::VerifyOps => "verification operations",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("commitment already admitted in this window")]
    ReplayDetected,

    #[error("stale epoch: submission targets height {got}, admission is open for height {current}")]
    StaleEpoch { current: u64, got: u64 },

    #[error("{tier} limit exceeded for {resource}: {actual} > {limit}")]
    TierLimitExceeded {
        tier: Tier,
        resource: Resource,
        limit: u64,
        actual: u64,
    },

    #[error("declared {declared} but size {size} requires {required}")]
    TierMismatch {
        declared: Tier,
        required: Tier,
        size: u32,
    },

    #[error("verification budget of {limit} operations exceeded")]
    BudgetExceeded { limit: u64 },

    #[error("reveal does not match commitment")]
    CommitmentMismatch,

    #[error("no open commitment from this miner for the current epoch")]
    UnknownCommitment,

    #[error("rate limited after repeated commitment mismatches")]
    RateLimited,

    #[error("solution does not solve the derived problem")]
    InvalidProof,

    #[error("verification cancelled")]
    Cancelled,
}
