//! powchain runtime - ledger state and transaction staging
//!
//! This crate provides:
//! - The storage collaborator contract plus in-memory and sled-backed stores
//! - The blob-store collaborator contract plus an in-memory store
//! - Fee Splitter: the protocol's 3-way fee settlement
//! - Executor: applies a block's transfers to an account overlay
//! - Mempool: priority-ordered staging with nonce replay protection

pub mod account_store;
pub mod blob;
pub mod executor;
pub mod fee;
pub mod mempool;
pub mod persistence;
pub mod store;

pub use account_store::MemoryStore;
pub use blob::{BlobError, BlobStore, Cid, MemoryBlobStore};
pub use executor::{execute_block, AccountOverlay, BlockEffects, BlockLimits, ExecutionError, ExecutionMode};
pub use fee::{split_fee, FeeSplit};
pub use mempool::{duration_secs, MempoolConfig, MempoolError, MempoolHandle, MempoolService, MempoolStats, TransactionPool};
pub use persistence::SledStore;
pub use store::{ChainMetadata, ChainStore, StateBatch};

/// Default gas ceiling per block
pub const MAX_BLOCK_GAS: u64 = 30_000_000;

/// Default byte ceiling for a block's transactions
pub const MAX_BLOCK_BYTES: usize = 1 << 20;

/// Maximum transactions per block
pub const MAX_TXS_PER_BLOCK: usize = 1024;
