//! Proposer schedule - round-robin over a fixed validator set

use crate::error::ConsensusError;
use powchain_codec::Address;
use std::collections::HashSet;

/// A proposer assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorSlot {
    pub height: u64,
    /// Position in the validator set
    pub index: usize,
    pub validator: Address,
}

/// Ordered, non-empty set of validators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Address>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Address>) -> Result<Self, ConsensusError> {
        if validators.is_empty() {
            return Err(ConsensusError::Config("validator set must not be empty".into()));
        }
        let mut seen = HashSet::with_capacity(validators.len());
        if let Some(dup) = validators.iter().find(|v| !seen.insert(**v)) {
            return Err(ConsensusError::Config(format!(
                "validator {} listed twice",
                dup.short()
            )));
        }
        Ok(Self { validators })
    }

    /// `slot(height) = validators[height mod N]`
    pub fn slot(&self, height: u64) -> ValidatorSlot {
        let index = (height % self.validators.len() as u64) as usize;
        ValidatorSlot {
            height,
            index,
            validator: self.validators[index],
        }
    }

    pub fn proposer(&self, height: u64) -> Address {
        self.slot(height).validator
    }

    pub fn contains(&self, validator: &Address) -> bool {
        self.validators.contains(validator)
    }

    pub fn position(&self, validator: &Address) -> Option<usize> {
        self.validators.iter().position(|v| v == validator)
    }

    /// First height at or after `from` where `validator` proposes
    pub fn next_slot_for(&self, validator: &Address, from: u64) -> Option<u64> {
        let position = self.position(validator)? as u64;
        let n = self.validators.len() as u64;
        let offset = (position + n - from % n) % n;
        from.checked_add(offset)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validators(&self) -> &[Address] {
        &self.validators
    }
}
