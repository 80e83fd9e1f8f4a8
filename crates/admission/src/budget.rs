//! Operation metering for proof verification
//!
//! Verifiers charge the budget as they go; the first charge past the limit
//! fails, so a malicious submission costs at most `limit` operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetError {
    #[error("operation budget of {limit} exceeded")]
    Exceeded { limit: u64 },
    #[error("aborted")]
    Aborted,
}

/// Operation counter with a hard ceiling and an optional abort flag
#[derive(Debug)]
pub struct OpBudget {
    limit: u64,
    used: u64,
    abort: Option<Arc<AtomicBool>>,
}

impl OpBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: 0,
            abort: None,
        }
    }

    /// Abort at the next checkpoint once `flag` is set
    pub fn with_abort(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    /// Charge `ops` operations. Every call is a cancellation checkpoint.
    pub fn charge(&mut self, ops: u64) -> Result<(), BudgetError> {
        if let Some(flag) = &self.abort {
            if flag.load(Ordering::Relaxed) {
                return Err(BudgetError::Aborted);
            }
        }
        let used = self.used.saturating_add(ops);
        if used > self.limit {
            self.used = self.limit;
            return Err(BudgetError::Exceeded { limit: self.limit });
        }
        self.used = used;
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit - self.used
    }
}
