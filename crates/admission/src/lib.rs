//! powchain admission - deciding which proofs are worth verifying
//!
//! - Tier Limiter: static resource ceilings per hardware class
//! - Budget: operation metering that aborts verification mid-flight
//! - Problem: deterministic work units derived from chain state
//! - Solver: closed set of proof kinds behind one solve/verify capability
//! - Binder: epoch-salted commit-reveal with a replay cache

pub mod binder;
pub mod budget;
pub mod error;
pub mod problem;
pub mod solver;
pub mod tier;

pub use binder::{
    derive_miner_salt, prepare_submission, verify_reveal_with, AdmittedProof, BinderConfig,
    CommitmentBinder,
};
pub use budget::{BudgetError, OpBudget};
pub use error::{AdmissionError, Resource};
pub use problem::ProblemInstance;
pub use solver::{ReferenceSolver, SolveError, Solver};
pub use tier::{TierLimiter, TierLimits};

/// Chain weight contributed by a proof of the given size
pub fn work_score_for(size: u32) -> u64 {
    1u64 << size.min(63)
}
