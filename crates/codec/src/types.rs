//! Consensus records
//!
//! Field order in every struct below is part of the protocol. Reordering,
//! inserting or removing a field changes canonical bytes and therefore every
//! hash derived from them.

use crate::hash::{hex_bytes, sha256, Address, H256};
use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain prefix for transaction signatures
pub const TX_SIGNING_DOMAIN: &[u8] = b"powchain/tx/v1";

/// Domain prefix for block proposer signatures
pub const BLOCK_SIGNING_DOMAIN: &[u8] = b"powchain/block/v1";

/// Hardware capability class
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum Tier {
    #[serde(rename = "TIER_1")]
    Tier1,
    #[serde(rename = "TIER_2")]
    Tier2,
    #[serde(rename = "TIER_3")]
    Tier3,
    #[serde(rename = "TIER_4")]
    Tier4,
}

impl Tier {
    /// All tiers, easiest first
    pub const ALL: [Tier; 4] = [Tier::Tier1, Tier::Tier2, Tier::Tier3, Tier::Tier4];

    pub fn index(self) -> usize {
        match self {
            Tier::Tier1 => 0,
            Tier::Tier2 => 1,
            Tier::Tier3 => 2,
            Tier::Tier4 => 3,
        }
    }

    /// The next easier tier, if any
    pub fn previous(self) -> Option<Tier> {
        self.index().checked_sub(1).map(|i| Tier::ALL[i])
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TIER_{}", self.index() + 1)
    }
}

/// Supported proof types. Adding a proof type means adding a variant here.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    SubsetSum,
    ThreeSat,
}

/// A value transfer request
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Transaction {
    pub sender: Address,
    pub recipient: Address,
    pub amount: u64,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    /// ed25519 signature over `signing_bytes()`
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Build and sign a transfer
    pub fn signed(
        key: &SigningKey,
        recipient: Address,
        amount: u64,
        nonce: u64,
        gas_limit: u64,
        gas_price: u64,
    ) -> Self {
        let mut tx = Self {
            sender: H256(key.verifying_key().to_bytes()),
            recipient,
            amount,
            nonce,
            gas_limit,
            gas_price,
            signature: Vec::new(),
        };
        tx.signature = key.sign(&tx.signing_bytes()).to_bytes().to_vec();
        tx
    }

    /// Bytes covered by the sender's signature (everything but the signature)
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TX_SIGNING_DOMAIN.len() + 96);
        buf.extend_from_slice(TX_SIGNING_DOMAIN);
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(self.recipient.as_bytes());
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.gas_limit.to_le_bytes());
        buf.extend_from_slice(&self.gas_price.to_le_bytes());
        buf
    }

    /// Check the signature against the sender key
    pub fn verify_signature(&self) -> bool {
        verify_ed25519(&self.sender, &self.signing_bytes(), &self.signature)
    }

    /// `gas_price * gas_limit`, the mempool ordering key and the fee paid
    pub fn priority(&self) -> Option<u64> {
        self.gas_price.checked_mul(self.gas_limit)
    }

    /// Fee charged on inclusion
    pub fn fee(&self) -> Option<u64> {
        self.priority()
    }

    /// `amount + fee`, the balance the sender must hold
    pub fn total_cost(&self) -> Option<u64> {
        self.fee()?.checked_add(self.amount)
    }
}

/// Ledger balance and sequence state
#[derive(
    Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    /// Highest nonce applied for this sender
    pub nonce: u64,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            nonce: 0,
        }
    }

    pub fn with_balance(address: Address, balance: u64) -> Self {
        Self {
            address,
            balance,
            nonce: 0,
        }
    }
}

/// Identifies the work unit a reveal solves
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProblemRef {
    pub kind: ProofKind,
    pub tier: Tier,
    pub size: u32,
    pub parent_hash: H256,
    pub block_index: u64,
}

/// Hash binding a hidden solution to a miner before reveal
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProofCommitment {
    pub miner: Address,
    /// `H(solution || miner_salt || epoch_salt)`
    pub commitment: H256,
    pub epoch_salt: H256,
    pub block_index: u64,
}

/// Disclosed solution and binding material
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProofReveal {
    pub miner: Address,
    pub commitment: H256,
    #[serde(with = "hex_bytes")]
    pub solution: Vec<u8>,
    pub miner_salt: H256,
    pub epoch_salt: H256,
    pub problem: ProblemRef,
}

impl ProofReveal {
    /// Recompute the commitment from the disclosed material
    pub fn derived_commitment(&self) -> H256 {
        commitment_hash(&self.solution, &self.miner_salt, &self.epoch_salt)
    }
}

/// `commitment = H(solution || miner_salt || epoch_salt)`
pub fn commitment_hash(solution: &[u8], miner_salt: &H256, epoch_salt: &H256) -> H256 {
    sha256(&[solution, miner_salt.as_ref(), epoch_salt.as_ref()])
}

/// Block header. Wire order: index, timestamp, previous_hash, merkle_root,
/// problem_commitment, work_score, cumulative_work, tier.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockHeader {
    pub index: u64,
    /// Unix millis
    pub timestamp: u64,
    pub previous_hash: H256,
    pub merkle_root: H256,
    pub problem_commitment: Option<H256>,
    pub work_score: u64,
    pub cumulative_work: u64,
    pub tier: Tier,
}

/// A settled unit of chain history
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Block {
    pub header: BlockHeader,
    pub proposer: Address,
    pub transactions: Vec<Transaction>,
    pub proof: Option<ProofReveal>,
    /// Proposer's ed25519 signature over the header hash
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl Block {
    /// Bytes the proposer signs
    pub fn signing_bytes(header_hash: &H256) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_SIGNING_DOMAIN.len() + 32);
        buf.extend_from_slice(BLOCK_SIGNING_DOMAIN);
        buf.extend_from_slice(header_hash.as_bytes());
        buf
    }

    pub fn verify_signature(&self, header_hash: &H256) -> bool {
        verify_ed25519(
            &self.proposer,
            &Self::signing_bytes(header_hash),
            &self.signature,
        )
    }
}

fn verify_ed25519(signer: &Address, message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(signer.as_bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify_strict(message, &signature).is_ok()
}

/// Address of a signing key
pub fn address_of(key: &SigningKey) -> Address {
    H256(key.verifying_key().to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn test_signed_transaction_verifies() {
        let tx = Transaction::signed(&key(1), address_of(&key(2)), 10, 1, 21_000, 3);
        assert!(tx.verify_signature());
        assert_eq!(tx.sender, address_of(&key(1)));
    }

    #[test]
    fn test_tampered_transaction_fails() {
        let mut tx = Transaction::signed(&key(1), address_of(&key(2)), 10, 1, 21_000, 3);
        tx.amount = 11;
        assert!(!tx.verify_signature());

        let mut tx = Transaction::signed(&key(1), address_of(&key(2)), 10, 1, 21_000, 3);
        tx.signature.truncate(10);
        assert!(!tx.verify_signature());
    }

    #[test]
    fn test_priority_overflow_is_none() {
        let mut tx = Transaction::signed(&key(1), address_of(&key(2)), 10, 1, u64::MAX, 2);
        assert_eq!(tx.priority(), None);
        tx.gas_price = 1;
        assert_eq!(tx.priority(), Some(u64::MAX));
        assert_eq!(tx.total_cost(), None);
    }

    #[test]
    fn test_tier_order_and_display() {
        assert!(Tier::Tier1 < Tier::Tier2);
        assert_eq!(Tier::Tier3.to_string(), "TIER_3");
        assert_eq!(Tier::Tier1.previous(), None);
        assert_eq!(Tier::Tier4.previous(), Some(Tier::Tier3));
        assert_eq!(serde_json::to_string(&Tier::Tier2).unwrap(), "\"TIER_2\"");
    }

    #[test]
    fn test_commitment_binds_all_inputs() {
        let a = commitment_hash(b"sol", &H256([1; 32]), &H256([2; 32]));
        assert_ne!(a, commitment_hash(b"sol", &H256([1; 32]), &H256([3; 32])));
        assert_ne!(a, commitment_hash(b"sol", &H256([4; 32]), &H256([2; 32])));
        assert_ne!(a, commitment_hash(b"so1", &H256([1; 32]), &H256([2; 32])));
    }
}
