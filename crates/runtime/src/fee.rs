//! Fee settlement
//!
//! A block's fee total is divided three ways: the proposer, a burn, and the
//! protocol treasury. Shares are fixed basis points computed in u128; the
//! treasury takes the rounding remainder so the parts always add up.

use serde::Serialize;

/// Proposer share, ~1/sqrt(2) - (1 - 1/sqrt(2))
pub const VALIDATOR_SHARE_BPS: u128 = 4_142;

/// Burned share, ~(1 - 1/sqrt(2))
pub const BURN_SHARE_BPS: u128 = 2_929;

pub const BPS_DENOMINATOR: u128 = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeeSplit {
    pub validator: u64,
    pub burn: u64,
    pub treasury: u64,
}

impl FeeSplit {
    pub fn total(&self) -> u64 {
        self.validator + self.burn + self.treasury
    }
}

/// Split `total` into validator, burn and treasury parts
pub fn split_fee(total: u64) -> FeeSplit {
    let fees = total as u128;
    // Both products stay below total, so the casts cannot truncate
    let validator = (fees * VALIDATOR_SHARE_BPS / BPS_DENOMINATOR) as u64;
    let burn = (fees * BURN_SHARE_BPS / BPS_DENOMINATOR) as u64;
    FeeSplit {
        validator,
        burn,
        treasury: total - validator - burn,
    }
}
