//! Commitment Binder - epoch-salted commit-reveal admission
//!
//! Flow per epoch (one epoch = one block height):
//! 1. Miner derives `miner_salt = HMAC(secret, epoch_salt || parent_hash || index)`
//! 2. Miner submits `commitment = H(solution || miner_salt || epoch_salt)`
//! 3. Miner reveals `(solution, miner_salt, epoch_salt)`; the binder recomputes
//!    the commitment and the problem instance, then verifies under budget
//!
//! One commitment per (epoch, miner). Admitted `(commitment, epoch_salt)`
//! pairs stay in the replay cache for `replay_ttl_epochs` epochs; expiry is
//! driven by chain height alone, so a restarted node rebuilds the same view.
//!
//! The cache lock is held only while reading or mutating the maps. Commitment
//! recomputation and proof verification run outside it.

use crate::budget::{BudgetError, OpBudget};
use crate::error::AdmissionError;
use crate::problem::ProblemInstance;
use crate::solver::Solver;
use crate::tier::TierLimiter;
use crate::work_score_for;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use powchain_codec::{
    commitment_hash, Address, Epoch, ProblemRef, ProofCommitment, ProofReveal, H256,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Binder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderConfig {
    /// Epochs an admitted pair stays in the replay cache
    pub replay_ttl_epochs: u64,
    /// Mismatching reveals a miner may send per epoch before being refused
    pub max_mismatches_per_epoch: u32,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            replay_ttl_epochs: 2,
            max_mismatches_per_epoch: 3,
        }
    }
}

/// A proof that passed every admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedProof {
    pub reveal: ProofReveal,
    pub work_score: u64,
    /// Verification operations spent
    pub verify_ops: u64,
}

impl AdmittedProof {
    pub fn block_index(&self) -> u64 {
        self.reveal.problem.block_index
    }
}

/// Committed, not yet revealed
#[derive(Debug, Clone)]
struct Committed {
    commitment: H256,
    block_index: u64,
}

impl Committed {
    /// The only transition out of `Committed`
    fn into_revealed(self) -> Revealed {
        Revealed {
            commitment: self.commitment,
            block_index: self.block_index,
        }
    }
}

/// Revealed and admitted. Terminal.
#[derive(Debug, Clone)]
struct Revealed {
    #[allow(dead_code)]
    commitment: H256,
    block_index: u64,
}

#[derive(Debug, Clone)]
enum CommitRecord {
    Committed(Committed),
    Revealed(Revealed),
}

impl CommitRecord {
    fn block_index(&self) -> u64 {
        match self {
            CommitRecord::Committed(c) => c.block_index,
            CommitRecord::Revealed(r) => r.block_index,
        }
    }
}

struct BinderState {
    epoch: Epoch,
    /// (epoch salt, miner) -> record
    records: HashMap<(H256, Address), CommitRecord>,
    /// (commitment, epoch salt) -> block index admitted at
    replay: HashMap<(H256, H256), u64>,
    /// miner -> (epoch index, mismatches)
    strikes: HashMap<Address, (u64, u32)>,
}

impl BinderState {
    fn check_epoch(&self, epoch_salt: &H256, block_index: u64) -> Result<(), AdmissionError> {
        if *epoch_salt != self.epoch.salt || block_index != self.epoch.index {
            return Err(AdmissionError::StaleEpoch {
                current: self.epoch.index,
                got: block_index,
            });
        }
        Ok(())
    }

    fn strike(&mut self, miner: Address) {
        let index = self.epoch.index;
        let entry = self.strikes.entry(miner).or_insert((index, 0));
        if entry.0 != index {
            *entry = (index, 0);
        }
        entry.1 += 1;
    }

    fn strikes(&self, miner: &Address) -> u32 {
        match self.strikes.get(miner) {
            Some((index, count)) if *index == self.epoch.index => *count,
            _ => 0,
        }
    }
}

/// Owner of the replay cache
pub struct CommitmentBinder {
    state: Mutex<BinderState>,
    limiter: TierLimiter,
    config: BinderConfig,
}

impl CommitmentBinder {
    /// Open admission for the block at `block_index` built on `parent_hash`
    pub fn new(config: BinderConfig, limiter: TierLimiter, parent_hash: H256, block_index: u64) -> Self {
        Self {
            state: Mutex::new(BinderState {
                epoch: Epoch::derive(parent_hash, block_index),
                records: HashMap::new(),
                replay: HashMap::new(),
                strikes: HashMap::new(),
            }),
            limiter,
            config,
        }
    }

    /// Current admission window
    pub fn epoch(&self) -> Epoch {
        self.state.lock().epoch
    }

    pub fn limiter(&self) -> &TierLimiter {
        &self.limiter
    }

    /// Number of pairs held in the replay cache
    pub fn replay_cache_len(&self) -> usize {
        self.state.lock().replay.len()
    }

    /// Roll over to a new epoch and drop everything older than the TTL
    pub fn advance_epoch(&self, parent_hash: H256, block_index: u64) {
        let ttl = self.config.replay_ttl_epochs;
        let mut state = self.state.lock();
        state.epoch = Epoch::derive(parent_hash, block_index);

        let before = state.replay.len();
        state
            .replay
            .retain(|_, admitted_at| block_index.saturating_sub(*admitted_at) < ttl);
        state
            .records
            .retain(|_, record| block_index.saturating_sub(record.block_index()) < ttl);
        state.strikes.retain(|_, (index, _)| *index == block_index);

        tracing::debug!(
            "Admission epoch {} opened: {} replay entries expired, {} kept",
            block_index,
            before - state.replay.len(),
            state.replay.len()
        );
    }

    /// Phase one: record a hidden commitment
    pub fn submit_commitment(&self, commitment: &ProofCommitment) -> Result<(), AdmissionError> {
        let mut state = self.state.lock();
        state.check_epoch(&commitment.epoch_salt, commitment.block_index)?;

        if state
            .replay
            .contains_key(&(commitment.commitment, commitment.epoch_salt))
        {
            return Err(AdmissionError::ReplayDetected);
        }

        let key = (commitment.epoch_salt, commitment.miner);
        if state.records.contains_key(&key) {
            tracing::debug!(
                "Second commitment from miner {} in epoch {} refused",
                commitment.miner.short(),
                commitment.block_index
            );
            return Err(AdmissionError::ReplayDetected);
        }

        state.records.insert(
            key,
            CommitRecord::Committed(Committed {
                commitment: commitment.commitment,
                block_index: commitment.block_index,
            }),
        );
        Ok(())
    }

    /// Phase two: check a reveal and, if it holds up, admit it.
    ///
    /// `abort` lets a shutting-down node stop verification at the next
    /// budget checkpoint.
    pub fn admit_reveal(
        &self,
        reveal: &ProofReveal,
        solver: &dyn Solver,
        abort: Option<Arc<AtomicBool>>,
    ) -> Result<AdmittedProof, AdmissionError> {
        let result = self.try_admit(reveal, solver, abort);
        match &result {
            Ok(admitted) => tracing::info!(
                "Admitted {:?} proof from {} for height {} (size {}, {} ops)",
                reveal.problem.kind,
                reveal.miner.short(),
                reveal.problem.block_index,
                reveal.problem.size,
                admitted.verify_ops
            ),
            Err(AdmissionError::CommitmentMismatch) => tracing::warn!(
                "Commitment mismatch from miner {} at height {}",
                reveal.miner.short(),
                reveal.problem.block_index
            ),
            Err(e) => tracing::debug!(
                "Reveal from {} rejected: {}",
                reveal.miner.short(),
                e
            ),
        }
        result
    }

    fn try_admit(
        &self,
        reveal: &ProofReveal,
        solver: &dyn Solver,
        abort: Option<Arc<AtomicBool>>,
    ) -> Result<AdmittedProof, AdmissionError> {
        let problem = &reveal.problem;
        let key = (reveal.epoch_salt, reveal.miner);

        {
            let mut state = self.state.lock();
            state.check_epoch(&reveal.epoch_salt, problem.block_index)?;
            if problem.parent_hash != state.epoch.parent_hash {
                return Err(AdmissionError::StaleEpoch {
                    current: state.epoch.index,
                    got: problem.block_index,
                });
            }
            if state.replay.contains_key(&(reveal.commitment, reveal.epoch_salt)) {
                return Err(AdmissionError::ReplayDetected);
            }
            if state.strikes(&reveal.miner) >= self.config.max_mismatches_per_epoch {
                return Err(AdmissionError::RateLimited);
            }
            let status = match state.records.get(&key) {
                None => Err(AdmissionError::UnknownCommitment),
                Some(CommitRecord::Revealed(_)) => Err(AdmissionError::ReplayDetected),
                Some(CommitRecord::Committed(c)) if c.commitment != reveal.commitment => {
                    Err(AdmissionError::CommitmentMismatch)
                }
                Some(CommitRecord::Committed(_)) => Ok(()),
            };
            if status == Err(AdmissionError::CommitmentMismatch) {
                state.strike(reveal.miner);
            }
            status?;
        }

        if reveal.derived_commitment() != reveal.commitment {
            self.state.lock().strike(reveal.miner);
            return Err(AdmissionError::CommitmentMismatch);
        }

        let verify_ops = self.verify_reveal(reveal, solver, abort)?;

        let mut state = self.state.lock();
        // The epoch may have rolled over while we were verifying.
        state.check_epoch(&reveal.epoch_salt, problem.block_index)?;
        if state.replay.contains_key(&(reveal.commitment, reveal.epoch_salt)) {
            return Err(AdmissionError::ReplayDetected);
        }
        let committed = match state.records.remove(&key) {
            Some(CommitRecord::Committed(c)) if c.commitment == reveal.commitment => c,
            Some(other) => {
                state.records.insert(key, other);
                return Err(AdmissionError::ReplayDetected);
            }
            None => return Err(AdmissionError::UnknownCommitment),
        };
        state
            .records
            .insert(key, CommitRecord::Revealed(committed.into_revealed()));
        state
            .replay
            .insert((reveal.commitment, reveal.epoch_salt), problem.block_index);

        Ok(AdmittedProof {
            reveal: reveal.clone(),
            work_score: work_score_for(problem.size),
            verify_ops,
        })
    }

    /// Stateless part of admission: tier limits, instance derivation and
    /// metered verification. Also used when importing a peer's block.
    pub fn verify_reveal(
        &self,
        reveal: &ProofReveal,
        solver: &dyn Solver,
        abort: Option<Arc<AtomicBool>>,
    ) -> Result<u64, AdmissionError> {
        verify_reveal_with(&self.limiter, reveal, solver, abort)
    }
}

/// Tier checks, commitment recomputation and metered verification, without
/// touching any cache
pub fn verify_reveal_with(
    limiter: &TierLimiter,
    reveal: &ProofReveal,
    solver: &dyn Solver,
    abort: Option<Arc<AtomicBool>>,
) -> Result<u64, AdmissionError> {
    let problem = &reveal.problem;
    if reveal.derived_commitment() != reveal.commitment {
        return Err(AdmissionError::CommitmentMismatch);
    }
    if reveal.epoch_salt != Epoch::derive(problem.parent_hash, problem.block_index).salt {
        return Err(AdmissionError::StaleEpoch {
            current: problem.block_index,
            got: problem.block_index,
        });
    }

    let limits = limiter.validate_all_limits(problem.tier, problem.size, reveal.solution.len())?;
    let instance = ProblemInstance::derive(problem);
    limiter.check_memory(problem.tier, instance.memory_bytes())?;

    let mut budget = OpBudget::new(limits.max_verify_ops);
    if let Some(flag) = abort {
        budget = budget.with_abort(flag);
    }

    match solver.verify(&instance, &reveal.solution, &mut budget) {
        Ok(true) => Ok(budget.used()),
        Ok(false) => Err(AdmissionError::InvalidProof),
        Err(BudgetError::Exceeded { limit }) => Err(AdmissionError::BudgetExceeded { limit }),
        Err(BudgetError::Aborted) => Err(AdmissionError::Cancelled),
    }
}

/// `miner_salt = HMAC(secret, epoch_salt || parent_hash || block_index)`.
///
/// The salt is fixed per (miner, epoch); a miner cannot pick it.
pub fn derive_miner_salt(miner_secret: &[u8], epoch: &Epoch) -> H256 {
    let mut mac =
        HmacSha256::new_from_slice(miner_secret).expect("HMAC accepts keys of any length");
    mac.update(epoch.salt.as_ref());
    mac.update(epoch.parent_hash.as_ref());
    mac.update(&epoch.index.to_le_bytes());
    H256(mac.finalize().into_bytes().into())
}

/// Miner side: bind `solution` for `problem` into a commitment and the
/// matching reveal
pub fn prepare_submission(
    miner_secret: &[u8],
    miner: Address,
    problem: ProblemRef,
    solution: Vec<u8>,
) -> (ProofCommitment, ProofReveal) {
    let epoch = Epoch::derive(problem.parent_hash, problem.block_index);
    let miner_salt = derive_miner_salt(miner_secret, &epoch);
    let commitment = commitment_hash(&solution, &miner_salt, &epoch.salt);

    (
        ProofCommitment {
            miner,
            commitment,
            epoch_salt: epoch.salt,
            block_index: epoch.index,
        },
        ProofReveal {
            miner,
            commitment,
            solution,
            miner_salt,
            epoch_salt: epoch.salt,
            problem,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::ReferenceSolver;
    use powchain_codec::{ProofKind, Tier};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    const PARENT: H256 = H256([7; 32]);

    fn binder() -> CommitmentBinder {
        CommitmentBinder::new(BinderConfig::default(), TierLimiter::default(), PARENT, 1)
    }

    fn problem(block_index: u64, parent_hash: H256) -> ProblemRef {
        ProblemRef {
            kind: ProofKind::SubsetSum,
            tier: Tier::Tier1,
            size: 10,
            parent_hash,
            block_index,
        }
    }

    fn solved(miner_seed: u8, problem: ProblemRef) -> (ProofCommitment, ProofReveal) {
        let instance = ProblemInstance::derive(&problem);
        let limits = *TierLimiter::default().limits(problem.tier);
        let solution = ReferenceSolver
            .solve(&instance, &limits, Instant::now() + Duration::from_secs(30))
            .unwrap();
        prepare_submission(&[miner_seed; 32], H256([miner_seed; 32]), problem, solution)
    }

    #[test]
    fn test_commit_then_reveal_is_admitted() {
        let binder = binder();
        let (commitment, reveal) = solved(1, problem(1, PARENT));
        binder.submit_commitment(&commitment).unwrap();
        let admitted = binder.admit_reveal(&reveal, &ReferenceSolver, None).unwrap();
        assert_eq!(admitted.work_score, 1 << 10);
        assert_eq!(admitted.block_index(), 1);
        assert_eq!(binder.replay_cache_len(), 1);
    }

    #[test]
    fn test_identical_reveal_twice_is_replay() {
        let binder = binder();
        let (commitment, reveal) = solved(1, problem(1, PARENT));
        binder.submit_commitment(&commitment).unwrap();
        assert!(binder.admit_reveal(&reveal, &ReferenceSolver, None).is_ok());
        assert_eq!(
            binder.admit_reveal(&reveal, &ReferenceSolver, None),
            Err(AdmissionError::ReplayDetected)
        );
        // recommitting the same pair is refused too
        assert_eq!(
            binder.submit_commitment(&commitment),
            Err(AdmissionError::ReplayDetected)
        );
    }

    #[test]
    fn test_one_commitment_per_miner_per_epoch() {
        let binder = binder();
        let (first, _) = solved(1, problem(1, PARENT));
        let mut second = first.clone();
        second.commitment = H256([0xee; 32]);
        binder.submit_commitment(&first).unwrap();
        assert_eq!(
            binder.submit_commitment(&second),
            Err(AdmissionError::ReplayDetected)
        );
    }

    #[test]
    fn test_reveal_for_other_epoch_is_stale() {
        let binder = binder();
        let (commitment, reveal) = solved(1, problem(1, PARENT));
        binder.submit_commitment(&commitment).unwrap();
        binder.advance_epoch(H256([8; 32]), 2);
        assert!(matches!(
            binder.admit_reveal(&reveal, &ReferenceSolver, None),
            Err(AdmissionError::StaleEpoch { current: 2, got: 1 })
        ));
    }

    #[test]
    fn test_replay_entries_expire_after_two_epochs() {
        let binder = binder();
        let (commitment, reveal) = solved(1, problem(1, PARENT));
        binder.submit_commitment(&commitment).unwrap();
        binder.admit_reveal(&reveal, &ReferenceSolver, None).unwrap();

        binder.advance_epoch(H256([2; 32]), 2);
        assert_eq!(binder.replay_cache_len(), 1);
        binder.advance_epoch(H256([3; 32]), 3);
        assert_eq!(binder.replay_cache_len(), 0);
    }

    #[test]
    fn test_tampered_solution_is_commitment_mismatch() {
        let binder = binder();
        let (commitment, mut reveal) = solved(1, problem(1, PARENT));
        binder.submit_commitment(&commitment).unwrap();
        reveal.solution[0] ^= 0x02;
        assert_eq!(
            binder.admit_reveal(&reveal, &ReferenceSolver, None),
            Err(AdmissionError::CommitmentMismatch)
        );
    }

    #[test]
    fn test_repeated_mismatches_are_rate_limited() {
        let binder = binder();
        let (commitment, reveal) = solved(1, problem(1, PARENT));
        binder.submit_commitment(&commitment).unwrap();

        let mut bad = reveal.clone();
        bad.miner_salt = H256([0; 32]);
        for _ in 0..3 {
            assert_eq!(
                binder.admit_reveal(&bad, &ReferenceSolver, None),
                Err(AdmissionError::CommitmentMismatch)
            );
        }
        assert_eq!(
            binder.admit_reveal(&reveal, &ReferenceSolver, None),
            Err(AdmissionError::RateLimited)
        );
    }

    #[test]
    fn test_reveal_without_commitment_is_unknown() {
        let binder = binder();
        let (_, reveal) = solved(1, problem(1, PARENT));
        assert_eq!(
            binder.admit_reveal(&reveal, &ReferenceSolver, None),
            Err(AdmissionError::UnknownCommitment)
        );
    }

    #[test]
    fn test_wrong_answer_with_valid_binding_is_invalid_proof() {
        let binder = binder();
        let problem = problem(1, PARENT);
        let (commitment, reveal) = prepare_submission(&[1; 32], H256([1; 32]), problem, vec![0, 0]);
        binder.submit_commitment(&commitment).unwrap();
        assert_eq!(
            binder.admit_reveal(&reveal, &ReferenceSolver, None),
            Err(AdmissionError::InvalidProof)
        );
    }

    #[test]
    fn test_overclaimed_tier_is_rejected_before_verification() {
        let binder = binder();
        let mut problem = problem(1, PARENT);
        problem.tier = Tier::Tier2;
        let (commitment, reveal) = prepare_submission(&[1; 32], H256([1; 32]), problem, vec![0, 0]);
        binder.submit_commitment(&commitment).unwrap();
        assert!(matches!(
            binder.admit_reveal(&reveal, &ReferenceSolver, None),
            Err(AdmissionError::TierMismatch { .. })
        ));
    }

    #[test]
    fn test_abort_flag_cancels_verification() {
        let binder = binder();
        let (commitment, reveal) = solved(1, problem(1, PARENT));
        binder.submit_commitment(&commitment).unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        flag.store(true, Ordering::Relaxed);
        assert_eq!(
            binder.admit_reveal(&reveal, &ReferenceSolver, Some(flag)),
            Err(AdmissionError::Cancelled)
        );
        // the commitment is still open; a later attempt succeeds
        assert!(binder.admit_reveal(&reveal, &ReferenceSolver, None).is_ok());
    }

    #[test]
    fn test_miner_salt_is_deterministic_per_epoch() {
        let e1 = Epoch::derive(PARENT, 1);
        let e2 = Epoch::derive(PARENT, 2);
        assert_eq!(derive_miner_salt(b"secret", &e1), derive_miner_salt(b"secret", &e1));
        assert_ne!(derive_miner_salt(b"secret", &e1), derive_miner_salt(b"secret", &e2));
        assert_ne!(derive_miner_salt(b"secret", &e1), derive_miner_salt(b"other", &e1));
    }
}
