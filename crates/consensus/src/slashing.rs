//! Slashing ledger
//!
//! Records proposer offenses keyed by validator. Penalties escalate with
//! each repeat offense; acting on the score is left to stake management.

use powchain_codec::{Address, H256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

/// Slashing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlashingConfig {
    pub enabled: bool,
    /// Base penalty for signing two blocks at one height
    pub double_proposal_penalty: u64,
    /// Base penalty for proposing outside the assigned slot
    pub out_of_slot_penalty: u64,
    /// Heights of proposal history kept for double-proposal detection
    pub history_window: u64,
}

impl Default for SlashingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            double_proposal_penalty: 100,
            out_of_slot_penalty: 10,
            history_window: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Offense {
    DoubleProposal {
        height: u64,
        first: H256,
        second: H256,
    },
    OutOfSlot {
        height: u64,
        expected: Address,
    },
}

impl Offense {
    pub fn height(&self) -> u64 {
        match self {
            Offense::DoubleProposal { height, .. } | Offense::OutOfSlot { height, .. } => *height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlashingRecord {
    pub validator: Address,
    pub offense: Offense,
    pub penalty: u64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SlashingLedger {
    config: SlashingConfig,
    records: Vec<SlashingRecord>,
    scores: HashMap<Address, u64>,
    /// (height, proposer) -> distinct block hashes seen
    proposals: BTreeMap<(u64, Address), Vec<H256>>,
    /// (height, validator) pairs already charged for being out of slot
    out_of_slot: BTreeMap<(u64, Address), H256>,
}

impl SlashingLedger {
    pub fn new(config: SlashingConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Track a signed proposal and detect a second, conflicting one
    pub fn observe_proposal(
        &mut self,
        height: u64,
        proposer: Address,
        hash: H256,
    ) -> Option<SlashingRecord> {
        if !self.config.enabled {
            return None;
        }
        let seen = self.proposals.entry((height, proposer)).or_default();
        if seen.contains(&hash) {
            return None;
        }
        let first = seen.first().copied();
        // Keep every distinct hash so a re-observed block is not charged twice
        seen.push(hash);
        let first = first?;

        Some(self.charge(
            proposer,
            Offense::DoubleProposal {
                height,
                first,
                second: hash,
            },
        ))
    }

    /// Charge `validator` for a block it signed at someone else's height
    pub fn record_out_of_slot(
        &mut self,
        height: u64,
        validator: Address,
        expected: Address,
        hash: H256,
    ) -> Option<SlashingRecord> {
        if !self.config.enabled {
            return None;
        }
        if self.out_of_slot.contains_key(&(height, validator)) {
            return None;
        }
        self.out_of_slot.insert((height, validator), hash);
        Some(self.charge(validator, Offense::OutOfSlot { height, expected }))
    }

    fn charge(&mut self, validator: Address, offense: Offense) -> SlashingRecord {
        let base = match offense {
            Offense::DoubleProposal { .. } => self.config.double_proposal_penalty,
            Offense::OutOfSlot { .. } => self.config.out_of_slot_penalty,
        };
        let prior = self.records.iter().filter(|r| r.validator == validator).count() as u64;
        let penalty = base.saturating_mul(prior + 1);

        let score = self.scores.entry(validator).or_insert(0);
        *score = score.saturating_add(penalty);

        let record = SlashingRecord {
            validator,
            offense,
            penalty,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        };
        tracing::warn!(
            "Slashing {}: {:?} (penalty {}, score {})",
            validator.short(),
            record.offense,
            penalty,
            *score
        );
        self.records.push(record.clone());
        record
    }

    /// Accumulated penalty for a validator
    pub fn penalty_score(&self, validator: &Address) -> u64 {
        self.scores.get(validator).copied().unwrap_or(0)
    }

    pub fn records(&self) -> &[SlashingRecord] {
        &self.records
    }

    pub fn records_for(&self, validator: &Address) -> Vec<&SlashingRecord> {
        self.records
            .iter()
            .filter(|r| r.validator == *validator)
            .collect()
    }

    /// Forget proposal history older than the window. Records and scores stay.
    pub fn prune(&mut self, current_height: u64) {
        let Some(cutoff) = current_height.checked_sub(self.config.history_window) else {
            return;
        };
        self.proposals = self.proposals.split_off(&(cutoff, Address::zero()));
        self.out_of_slot = self.out_of_slot.split_off(&(cutoff, Address::zero()));
    }

    pub fn tracked_heights(&self) -> usize {
        let mut heights: Vec<u64> = self.proposals.keys().map(|(h, _)| *h).collect();
        heights.dedup();
        heights.len()
    }
}
