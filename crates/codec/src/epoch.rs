//! Replay-protection windows
//!
//! Every block opens a new epoch. The salt is derived from chain data alone,
//! so any node at the same height computes the same salt.

use crate::hash::{sha256, H256};

/// An admission window scoped to one block height
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Epoch {
    /// Height of the block being built in this window
    pub index: u64,
    /// Hash of the block this window builds on
    pub parent_hash: H256,
    /// `H(parent_hash || block_index)`
    pub salt: H256,
}

impl Epoch {
    pub fn derive(parent_hash: H256, block_index: u64) -> Self {
        Self {
            index: block_index,
            parent_hash,
            salt: salt_for(&parent_hash, block_index),
        }
    }

    /// True once `current` is `ttl` or more epochs past this one
    pub fn expired_at(&self, current: u64, ttl: u64) -> bool {
        current.saturating_sub(self.index) >= ttl
    }
}

/// `epoch_salt = H(parent_hash || block_index)`
pub fn salt_for(parent_hash: &H256, block_index: u64) -> H256 {
    sha256(&[parent_hash.as_ref(), &block_index.to_le_bytes()])
}
