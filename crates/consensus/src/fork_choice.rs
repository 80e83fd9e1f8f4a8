//! Fork choice
//!
//! Heaviest cumulative work wins. Equal work goes to the lower head hash, so
//! the order is total and every node picks the same head.

use powchain_codec::{BlockHeader, H256};
use std::cmp::Ordering;

/// The head of a candidate chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHead {
    pub hash: H256,
    pub index: u64,
    pub cumulative_work: u64,
}

impl ChainHead {
    pub fn of(header: &BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            index: header.index,
            cumulative_work: header.cumulative_work,
        }
    }
}

/// Greater means preferred
impl Ord for ChainHead {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cumulative_work
            .cmp(&other.cumulative_work)
            .then_with(|| other.hash.cmp(&self.hash))
    }
}

impl PartialOrd for ChainHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The preferred of two heads
pub fn choose(a: ChainHead, b: ChainHead) -> ChainHead {
    a.max(b)
}

/// True when `candidate` should replace `current`
pub fn prefers(candidate: &ChainHead, current: &ChainHead) -> bool {
    candidate > current
}
