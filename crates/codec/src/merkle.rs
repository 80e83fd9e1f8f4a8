//! Transaction merkle root

use crate::hash::{sha256, H256};

/// SHA-256 binary merkle root. An odd node at any level is paired with
/// itself; the empty list hashes to zero.
pub fn merkle_root(leaves: &[H256]) -> H256 {
    if leaves.is_empty() {
        return H256::zero();
    }

    let mut level: Vec<H256> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                sha256(&[left.as_ref(), right.as_ref()])
            })
            .collect();
    }
    level[0]
}
