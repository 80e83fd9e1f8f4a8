//! Problem instances derived from chain state
//!
//! An instance is a pure function of (parent hash, block index, tier, kind,
//! size). Every instance has a planted solution, so honest miners can always
//! find one and verifiers never have to reason about unsatisfiable work.

use powchain_codec::{salt_for, sha256, ProblemRef, ProofKind, Tier, H256};

const INSTANCE_DOMAIN: &[u8] = b"powchain/instance/v1";

/// Clauses per variable for 3-SAT instances
pub const CLAUSE_RATIO: u32 = 4;

/// One literal of a 3-SAT clause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Literal {
    pub var: u32,
    pub negated: bool,
}

impl Literal {
    fn satisfied_by(&self, assignment: u64) -> bool {
        let value = (assignment >> self.var) & 1 == 1;
        value != self.negated
    }
}

pub type Clause = [Literal; 3];

/// Kind-specific instance data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceBody {
    SubsetSum { weights: Vec<u64> },
    ThreeSat { clauses: Vec<Clause> },
}

/// A work unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemInstance {
    pub kind: ProofKind,
    pub tier: Tier,
    pub size: u32,
    /// Subset sum: required weight total. 3-SAT: clauses to satisfy.
    pub target: u64,
    pub parent_hash: H256,
    pub block_index: u64,
    pub epoch_salt: H256,
    pub body: InstanceBody,
}

impl ProblemInstance {
    /// Derive the instance a reveal claims to solve
    pub fn derive(problem: &ProblemRef) -> Self {
        Self::derive_for(
            problem.kind,
            problem.tier,
            problem.size,
            problem.parent_hash,
            problem.block_index,
        )
    }

    pub fn derive_for(
        kind: ProofKind,
        tier: Tier,
        size: u32,
        parent_hash: H256,
        block_index: u64,
    ) -> Self {
        let size = size.clamp(1, 63);
        let seed = instance_seed(kind, tier, size, &parent_hash, block_index);
        let mut stream = SeedStream::new(seed);
        let full = full_mask(size);

        let (target, body) = match kind {
            ProofKind::SubsetSum => {
                let weights: Vec<u64> = (0..size).map(|_| (stream.next_u64() >> 32) + 1).collect();
                let mut planted = stream.next_u64() & full;
                if planted == 0 {
                    planted = 1;
                }
                let target = weights
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| (planted >> i) & 1 == 1)
                    .map(|(_, w)| *w)
                    .sum();
                (target, InstanceBody::SubsetSum { weights })
            }
            ProofKind::ThreeSat => {
                let planted = stream.next_u64() & full;
                let count = size * CLAUSE_RATIO;
                let clauses: Vec<Clause> = (0..count)
                    .map(|_| {
                        let mut clause = [0; 3].map(|_: u8| Literal {
                            var: (stream.next_u64() % size as u64) as u32,
                            negated: stream.next_u64() & 1 == 1,
                        });
                        if !clause.iter().any(|l| l.satisfied_by(planted)) {
                            clause[0].negated = !clause[0].negated;
                        }
                        clause
                    })
                    .collect();
                (count as u64, InstanceBody::ThreeSat { clauses })
            }
        };

        Self {
            kind,
            tier,
            size,
            target,
            parent_hash,
            block_index,
            epoch_salt: salt_for(&parent_hash, block_index),
            body,
        }
    }

    /// Bytes a verifier holds for this instance
    pub fn memory_bytes(&self) -> u64 {
        match &self.body {
            InstanceBody::SubsetSum { weights } => (weights.len() * 8) as u64,
            InstanceBody::ThreeSat { clauses } => (clauses.len() * 3 * 8) as u64,
        }
    }

    /// Exact byte length of a well-formed solution
    pub fn solution_len(&self) -> usize {
        solution_len(self.size)
    }

    /// Check a candidate assignment without metering
    pub(crate) fn accepts(&self, assignment: u64) -> bool {
        match &self.body {
            InstanceBody::SubsetSum { weights } => {
                let sum: u64 = weights
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| (assignment >> i) & 1 == 1)
                    .map(|(_, w)| *w)
                    .sum();
                assignment != 0 && sum == self.target
            }
            InstanceBody::ThreeSat { clauses } => clauses
                .iter()
                .all(|c| c.iter().any(|l| l.satisfied_by(assignment))),
        }
    }
}

pub(crate) fn satisfies(clause: &Clause, assignment: u64) -> bool {
    clause.iter().any(|l| l.satisfied_by(assignment))
}

fn instance_seed(kind: ProofKind, tier: Tier, size: u32, parent: &H256, index: u64) -> H256 {
    let kind_tag = match kind {
        ProofKind::SubsetSum => 0u8,
        ProofKind::ThreeSat => 1u8,
    };
    sha256(&[
        INSTANCE_DOMAIN,
        parent.as_ref(),
        &index.to_le_bytes(),
        &[tier.index() as u8, kind_tag],
        &size.to_le_bytes(),
    ])
}

fn full_mask(size: u32) -> u64 {
    if size >= 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    }
}

/// `ceil(size / 8)`
pub fn solution_len(size: u32) -> usize {
    size.div_ceil(8) as usize
}

/// Little-endian bitmask, bit `i` selects item / sets variable `i`
pub fn encode_assignment(assignment: u64, size: u32) -> Vec<u8> {
    assignment.to_le_bytes()[..solution_len(size)].to_vec()
}

/// Inverse of `encode_assignment`. Rejects wrong lengths and stray high bits,
/// so each assignment has exactly one encoding.
pub fn decode_assignment(bytes: &[u8], size: u32) -> Option<u64> {
    if bytes.len() != solution_len(size) || bytes.len() > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    let assignment = u64::from_le_bytes(buf);
    if assignment & !full_mask(size) != 0 {
        return None;
    }
    Some(assignment)
}

/// Deterministic u64 stream: `H(seed || counter)`
struct SeedStream {
    seed: H256,
    counter: u64,
}

impl SeedStream {
    fn new(seed: H256) -> Self {
        Self { seed, counter: 0 }
    }

    fn next_u64(&mut self) -> u64 {
        let block = sha256(&[self.seed.as_ref(), &self.counter.to_le_bytes()]);
        self.counter += 1;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&block.0[..8]);
        u64::from_le_bytes(buf)
    }
}
