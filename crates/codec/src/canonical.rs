//! Canonical encoding, decoding and hashing

use crate::hash::{sha256, H256};
use crate::types::{Account, Block, BlockHeader, ProofCommitment, ProofReveal, Transaction};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Codec errors. Always local and recoverable except `FormDivergence`.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid binary encoding: {0}")]
    InvalidEncoding(String),

    #[error("invalid json encoding: {0}")]
    InvalidJson(String),

    /// The two wire forms disagree on a record's hash
    #[error("wire forms diverge: binary {binary}, json {json}")]
    FormDivergence { binary: H256, json: H256 },
}

/// Supported wire forms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Compact borsh bytes; these are the canonical bytes
    Binary,
    /// serde_json text for debugging and tooling
    Json,
}

/// A consensus-relevant record with one canonical byte form
pub trait Canonical: BorshSerialize + BorshDeserialize + Serialize + DeserializeOwned {
    /// Canonical bytes
    fn encode(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("in-memory borsh serialization should not fail")
    }

    /// Decode canonical bytes. Trailing bytes and short input are rejected.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        borsh::from_slice(bytes).map_err(|e| CodecError::InvalidEncoding(e.to_string()))
    }

    /// SHA-256 over canonical bytes
    fn hash(&self) -> H256 {
        sha256(&[&self.encode()])
    }

    fn encode_as(&self, format: WireFormat) -> Vec<u8> {
        match format {
            WireFormat::Binary => self.encode(),
            WireFormat::Json => {
                serde_json::to_vec(self).expect("in-memory json serialization should not fail")
            }
        }
    }

    fn decode_as(format: WireFormat, bytes: &[u8]) -> Result<Self, CodecError> {
        match format {
            WireFormat::Binary => Self::decode(bytes),
            WireFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::InvalidJson(e.to_string()))
            }
        }
    }
}

impl Canonical for Transaction {}
impl Canonical for Account {}
impl Canonical for BlockHeader {}
impl Canonical for Block {}
impl Canonical for ProofCommitment {}
impl Canonical for ProofReveal {}

impl Transaction {
    pub fn hash(&self) -> H256 {
        Canonical::hash(self)
    }
}

impl BlockHeader {
    pub fn hash(&self) -> H256 {
        Canonical::hash(self)
    }
}

impl Block {
    /// A block is identified by its header hash
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }
}

/// Hash a record received in the given wire form
pub fn hash_wire<T: Canonical>(format: WireFormat, bytes: &[u8]) -> Result<H256, CodecError> {
    T::decode_as(format, bytes).map(|record| record.hash())
}

/// Encode `record` in both wire forms, decode each and compare hashes.
///
/// A `FormDivergence` here means two nodes could disagree on a hash; callers
/// treat it as fatal.
pub fn check_equivalence<T: Canonical>(record: &T) -> Result<H256, CodecError> {
    let binary = hash_wire::<T>(WireFormat::Binary, &record.encode_as(WireFormat::Binary))?;
    let json = hash_wire::<T>(WireFormat::Json, &record.encode_as(WireFormat::Json))?;
    if binary != json {
        return Err(CodecError::FormDivergence { binary, json });
    }
    Ok(binary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{address_of, ProblemRef, ProofKind, Tier};
    use ed25519_dalek::SigningKey;
    use proptest::prelude::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            index: 7,
            timestamp: 1_700_000_000_000,
            previous_hash: H256([1; 32]),
            merkle_root: H256([2; 32]),
            problem_commitment: Some(H256([3; 32])),
            work_score: 4096,
            cumulative_work: 10_000,
            tier: Tier::Tier1,
        }
    }

    fn sample_reveal() -> ProofReveal {
        ProofReveal {
            miner: H256([9; 32]),
            commitment: H256([8; 32]),
            solution: vec![0xde, 0xad],
            miner_salt: H256([7; 32]),
            epoch_salt: H256([6; 32]),
            problem: ProblemRef {
                kind: ProofKind::ThreeSat,
                tier: Tier::Tier2,
                size: 16,
                parent_hash: H256([5; 32]),
                block_index: 3,
            },
        }
    }

    #[test]
    fn test_header_field_order_is_fixed() {
        let header = sample_header();
        let bytes = header.encode();
        // index u64 LE comes first, then timestamp
        assert_eq!(&bytes[..8], &7u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &1_700_000_000_000u64.to_le_bytes());
        assert_eq!(&bytes[16..48], &[1u8; 32]);
        assert_eq!(&bytes[48..80], &[2u8; 32]);
        // Some(commitment)
        assert_eq!(bytes[80], 1);
        assert_eq!(&bytes[81..113], &[3u8; 32]);
        assert_eq!(&bytes[113..121], &4096u64.to_le_bytes());
        assert_eq!(&bytes[121..129], &10_000u64.to_le_bytes());
        // tier variant index is last
        assert_eq!(bytes[129], 0);
        assert_eq!(bytes.len(), 130);
    }

    #[test]
    fn test_header_hash_is_sha256_of_canonical_bytes() {
        let header = sample_header();
        assert_eq!(header.hash(), sha256(&[&header.encode()]));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = sample_header().encode();
        bytes.push(0);
        assert!(matches!(
            BlockHeader::decode(&bytes),
            Err(CodecError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let bytes = sample_header().encode();
        assert!(BlockHeader::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_variant_and_option_tags() {
        let mut bytes = sample_header().encode();
        let last = bytes.len() - 1;
        bytes[last] = 9;
        assert!(BlockHeader::decode(&bytes).is_err());

        let mut bytes = sample_header().encode();
        bytes[80] = 2;
        assert!(BlockHeader::decode(&bytes).is_err());
    }

    #[test]
    fn test_json_rejects_unknown_fields() {
        let mut value = serde_json::to_value(sample_header()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("extra".into(), serde_json::json!(1));
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            BlockHeader::decode_as(WireFormat::Json, &bytes),
            Err(CodecError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_json_does_not_coerce_types() {
        let mut value = serde_json::to_value(sample_header()).unwrap();
        value["index"] = serde_json::json!("7");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(BlockHeader::decode_as(WireFormat::Json, &bytes).is_err());

        let mut value = serde_json::to_value(sample_header()).unwrap();
        value["index"] = serde_json::json!(-1);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(BlockHeader::decode_as(WireFormat::Json, &bytes).is_err());
    }

    #[test]
    fn test_reveal_round_trips_both_forms() {
        let reveal = sample_reveal();
        for format in [WireFormat::Binary, WireFormat::Json] {
            let decoded = ProofReveal::decode_as(format, &reveal.encode_as(format)).unwrap();
            assert_eq!(decoded, reveal);
        }
    }

    #[test]
    fn test_block_equivalence() {
        let key = SigningKey::from_bytes(&[4; 32]);
        let tx = Transaction::signed(&key, H256([2; 32]), 5, 1, 10, 2);
        let block = Block {
            header: sample_header(),
            proposer: address_of(&key),
            transactions: vec![tx],
            proof: Some(sample_reveal()),
            signature: vec![1, 2, 3],
        };
        assert_eq!(check_equivalence(&block).unwrap(), block.hash());
    }

    fn arb_h256() -> impl Strategy<Value = H256> {
        any::<[u8; 32]>().prop_map(H256)
    }

    fn arb_tier() -> impl Strategy<Value = Tier> {
        prop_oneof![
            Just(Tier::Tier1),
            Just(Tier::Tier2),
            Just(Tier::Tier3),
            Just(Tier::Tier4)
        ]
    }

    fn arb_header() -> impl Strategy<Value = BlockHeader> {
        (
            any::<u64>(),
            any::<u64>(),
            arb_h256(),
            arb_h256(),
            proptest::option::of(arb_h256()),
            any::<u64>(),
            any::<u64>(),
            arb_tier(),
        )
            .prop_map(
                |(index, timestamp, previous_hash, merkle_root, problem_commitment, work_score, cumulative_work, tier)| {
                    BlockHeader {
                        index,
                        timestamp,
                        previous_hash,
                        merkle_root,
                        problem_commitment,
                        work_score,
                        cumulative_work,
                        tier,
                    }
                },
            )
    }

    fn arb_transaction() -> impl Strategy<Value = Transaction> {
        (
            arb_h256(),
            arb_h256(),
            any::<u64>(),
            any::<u64>(),
            any::<u64>(),
            any::<u64>(),
            proptest::collection::vec(any::<u8>(), 0..80),
        )
            .prop_map(
                |(sender, recipient, amount, nonce, gas_limit, gas_price, signature)| Transaction {
                    sender,
                    recipient,
                    amount,
                    nonce,
                    gas_limit,
                    gas_price,
                    signature,
                },
            )
    }

    fn arb_reveal() -> impl Strategy<Value = ProofReveal> {
        (
            arb_h256(),
            arb_h256(),
            proptest::collection::vec(any::<u8>(), 0..64),
            arb_h256(),
            arb_h256(),
            prop_oneof![Just(ProofKind::SubsetSum), Just(ProofKind::ThreeSat)],
            arb_tier(),
            any::<u32>(),
            arb_h256(),
            any::<u64>(),
        )
            .prop_map(
                |(miner, commitment, solution, miner_salt, epoch_salt, kind, tier, size, parent_hash, block_index)| {
                    ProofReveal {
                        miner,
                        commitment,
                        solution,
                        miner_salt,
                        epoch_salt,
                        problem: ProblemRef {
                            kind,
                            tier,
                            size,
                            parent_hash,
                            block_index,
                        },
                    }
                },
            )
    }

    proptest! {
        #[test]
        fn prop_header_forms_hash_identically(header in arb_header()) {
            prop_assert_eq!(check_equivalence(&header).unwrap(), header.hash());
            prop_assert_eq!(BlockHeader::decode(&header.encode()).unwrap(), header);
        }

        #[test]
        fn prop_transaction_forms_hash_identically(tx in arb_transaction()) {
            prop_assert_eq!(check_equivalence(&tx).unwrap(), tx.hash());
            prop_assert_eq!(Transaction::decode(&tx.encode()).unwrap(), tx);
        }

        #[test]
        fn prop_reveal_forms_hash_identically(reveal in arb_reveal()) {
            prop_assert_eq!(check_equivalence(&reveal).unwrap(), Canonical::hash(&reveal));
        }

        #[test]
        fn prop_account_forms_hash_identically(address in arb_h256(), balance in any::<u64>(), nonce in any::<u64>()) {
            let account = Account { address, balance, nonce };
            prop_assert_eq!(check_equivalence(&account).unwrap(), Canonical::hash(&account));
        }
    }
}
