//! Solve/verify capability
//!
//! Proof kinds are a closed enum; `ReferenceSolver` dispatches on it. An
//! external solver only has to implement `Solver`.

use crate::budget::{BudgetError, OpBudget};
use crate::problem::{decode_assignment, encode_assignment, satisfies, InstanceBody, ProblemInstance};
use crate::tier::TierLimits;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SolveError {
    #[error("solver deadline reached")]
    Timeout,
}

/// Deadline checks happen every this many candidates
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

pub trait Solver: Send + Sync {
    /// Find a solution before `deadline` or the tier's solve-time ceiling,
    /// whichever comes first
    fn solve(
        &self,
        instance: &ProblemInstance,
        limits: &TierLimits,
        deadline: Instant,
    ) -> Result<Vec<u8>, SolveError>;

    /// Check `solution`, charging `budget` as work is done. Returns
    /// `Ok(false)` for a well-metered wrong answer.
    fn verify(
        &self,
        instance: &ProblemInstance,
        solution: &[u8],
        budget: &mut OpBudget,
    ) -> Result<bool, BudgetError>;
}

/// Brute-force solver and metered verifier for the built-in proof kinds
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceSolver;

impl Solver for ReferenceSolver {
    fn solve(
        &self,
        instance: &ProblemInstance,
        limits: &TierLimits,
        deadline: Instant,
    ) -> Result<Vec<u8>, SolveError> {
        let started = Instant::now();
        let deadline = deadline.min(started + limits.max_solve_time);
        let space = 1u64 << instance.size;

        for candidate in 0..space {
            if candidate % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                return Err(SolveError::Timeout);
            }
            if instance.accepts(candidate) {
                tracing::debug!(
                    "Solved {:?} size {} after {} candidates in {:?}",
                    instance.kind,
                    instance.size,
                    candidate + 1,
                    started.elapsed()
                );
                return Ok(encode_assignment(candidate, instance.size));
            }
        }

        // Planted instances always have a solution; only a deadline can stop us.
        Err(SolveError::Timeout)
    }

    fn verify(
        &self,
        instance: &ProblemInstance,
        solution: &[u8],
        budget: &mut OpBudget,
    ) -> Result<bool, BudgetError> {
        budget.charge(1)?;
        let Some(assignment) = decode_assignment(solution, instance.size) else {
            return Ok(false);
        };

        match &instance.body {
            InstanceBody::SubsetSum { weights } => {
                if assignment == 0 {
                    return Ok(false);
                }
                let mut sum: u64 = 0;
                for (i, weight) in weights.iter().enumerate() {
                    budget.charge(1)?;
                    if (assignment >> i) & 1 == 1 {
                        sum = sum.saturating_add(*weight);
                    }
                }
                Ok(sum == instance.target)
            }
            InstanceBody::ThreeSat { clauses } => {
                for clause in clauses {
                    budget.charge(1)?;
                    if !satisfies(clause, assignment) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}
