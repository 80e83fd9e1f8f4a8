//! Tier Limiter - static admission policy per hardware class
//!
//! Each tier owns a band of problem sizes: (previous tier max, own max].
//! A submission must declare exactly the tier whose band holds its size.

use crate::error::{AdmissionError, Resource};
use powchain_codec::Tier;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Resource ceilings for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub max_problem_size: u32,
    pub max_solve_time: Duration,
    pub max_memory_bytes: u64,
    pub max_proof_bytes: usize,
    pub max_verify_ops: u64,
}

/// Default table, easiest tier first
pub const DEFAULT_TIER_TABLE: [TierLimits; 4] = [
    TierLimits {
        max_problem_size: 12,
        max_solve_time: Duration::from_secs(10),
        max_memory_bytes: 64 << 20,
        max_proof_bytes: 64,
        max_verify_ops: 1 << 12,
    },
    TierLimits {
        max_problem_size: 16,
        max_solve_time: Duration::from_secs(30),
        max_memory_bytes: 256 << 20,
        max_proof_bytes: 128,
        max_verify_ops: 1 << 14,
    },
    TierLimits {
        max_problem_size: 24,
        max_solve_time: Duration::from_secs(120),
        max_memory_bytes: 1 << 30,
        max_proof_bytes: 256,
        max_verify_ops: 1 << 16,
    },
    TierLimits {
        max_problem_size: 32,
        max_solve_time: Duration::from_secs(600),
        max_memory_bytes: 4 << 30,
        max_proof_bytes: 512,
        max_verify_ops: 1 << 18,
    },
];

/// Maps a declared tier to its ceilings and validates submissions against them
#[derive(Debug, Clone)]
pub struct TierLimiter {
    table: [TierLimits; 4],
}

impl TierLimiter {
    /// Custom table. Sizes must strictly increase with the tier.
    pub fn with_table(table: [TierLimits; 4]) -> Self {
        debug_assert!(table
            .windows(2)
            .all(|w| w[0].max_problem_size < w[1].max_problem_size));
        Self { table }
    }

    pub fn limits(&self, tier: Tier) -> &TierLimits {
        &self.table[tier.index()]
    }

    /// Sizes that belong to `tier`
    pub fn size_band(&self, tier: Tier) -> RangeInclusive<u32> {
        let low = tier
            .previous()
            .map(|t| self.limits(t).max_problem_size + 1)
            .unwrap_or(1);
        low..=self.limits(tier).max_problem_size
    }

    /// The easiest tier whose bounds accommodate `size`
    pub fn minimal_tier(&self, size: u32) -> Option<Tier> {
        if size == 0 {
            return None;
        }
        Tier::ALL
            .into_iter()
            .find(|t| size <= self.limits(*t).max_problem_size)
    }

    /// Static checks run before any verification work.
    ///
    /// Order: size over the declared ceiling, then declared tier not minimal,
    /// then proof byte size.
    pub fn validate_all_limits(
        &self,
        declared: Tier,
        size: u32,
        proof_bytes: usize,
    ) -> Result<&TierLimits, AdmissionError> {
        if size == 0 {
            return Err(AdmissionError::Validation("problem size must be non-zero".into()));
        }

        let limits = self.limits(declared);
        if size > limits.max_problem_size {
            return Err(AdmissionError::TierLimitExceeded {
                tier: declared,
                resource: Resource::ProblemSize,
                limit: limits.max_problem_size as u64,
                actual: size as u64,
            });
        }

        match self.minimal_tier(size) {
            Some(required) if required == declared => {}
            Some(required) => {
                return Err(AdmissionError::TierMismatch {
                    declared,
                    required,
                    size,
                })
            }
            None => {
                return Err(AdmissionError::Validation(format!(
                    "size {size} fits no tier"
                )))
            }
        }

        if proof_bytes > limits.max_proof_bytes {
            return Err(AdmissionError::TierLimitExceeded {
                tier: declared,
                resource: Resource::ProofBytes,
                limit: limits.max_proof_bytes as u64,
                actual: proof_bytes as u64,
            });
        }

        Ok(limits)
    }

    /// Memory ceiling check for a derived instance
    pub fn check_memory(&self, tier: Tier, required_bytes: u64) -> Result<(), AdmissionError> {
        let limit = self.limits(tier).max_memory_bytes;
        if required_bytes > limit {
            return Err(AdmissionError::TierLimitExceeded {
                tier,
                resource: Resource::Memory,
                limit,
                actual: required_bytes,
            });
        }
        Ok(())
    }
}

impl Default for TierLimiter {
    fn default() -> Self {
        Self::with_table(DEFAULT_TIER_TABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_16_needs_tier_2() {
        let limiter = TierLimiter::default();

        let err = limiter.validate_all_limits(Tier::Tier1, 16, 2).unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::TierLimitExceeded {
                tier: Tier::Tier1,
                resource: Resource::ProblemSize,
                limit: 12,
                actual: 16,
            }
        ));

        let limits = limiter.validate_all_limits(Tier::Tier2, 16, 2).unwrap();
        assert_eq!(limits.max_problem_size, 16);
    }

    #[test]
    fn test_every_size_in_band_is_accepted() {
        let limiter = TierLimiter::default();
        for tier in Tier::ALL {
            for size in limiter.size_band(tier) {
                assert!(
                    limiter.validate_all_limits(tier, size, 1).is_ok(),
                    "{tier} rejected size {size}"
                );
            }
            let over = limiter.limits(tier).max_problem_size + 1;
            assert!(matches!(
                limiter.validate_all_limits(tier, over, 1),
                Err(AdmissionError::TierLimitExceeded { .. })
            ));
        }
    }

    #[test]
    fn test_overclaiming_a_harder_tier_is_rejected() {
        let limiter = TierLimiter::default();
        let err = limiter.validate_all_limits(Tier::Tier3, 8, 1).unwrap_err();
        assert_eq!(
            err,
            AdmissionError::TierMismatch {
                declared: Tier::Tier3,
                required: Tier::Tier1,
                size: 8,
            }
        );
    }

    #[test]
    fn test_proof_bytes_ceiling() {
        let limiter = TierLimiter::default();
        assert!(matches!(
            limiter.validate_all_limits(Tier::Tier1, 10, 65),
            Err(AdmissionError::TierLimitExceeded {
                resource: Resource::ProofBytes,
                ..
            })
        ));
    }

    #[test]
    fn test_zero_size_and_bands() {
        let limiter = TierLimiter::default();
        assert!(matches!(
            limiter.validate_all_limits(Tier::Tier1, 0, 1),
            Err(AdmissionError::Validation(_))
        ));
        assert_eq!(limiter.size_band(Tier::Tier1), 1..=12);
        assert_eq!(limiter.size_band(Tier::Tier2), 13..=16);
        assert_eq!(limiter.minimal_tier(33), None);
    }
}
