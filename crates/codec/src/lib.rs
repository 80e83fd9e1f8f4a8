//! powchain codec - canonical bytes and digests for every consensus record
//!
//! Two wire forms are supported:
//! - Binary: borsh, fields written in declaration order
//! - Json: serde_json with hex-encoded byte fields, for debugging
//!
//! Hashes are always SHA-256 over the binary form. A record decoded from
//! either wire form hashes identically; `check_equivalence` enforces this.

pub mod canonical;
pub mod epoch;
pub mod hash;
pub mod merkle;
pub mod types;

pub use canonical::{check_equivalence, hash_wire, Canonical, CodecError, WireFormat};
pub use epoch::{salt_for, Epoch};
pub use hash::{sha256, Address, H256};
pub use merkle::merkle_root;
pub use types::*;
