//! Storage collaborator contract
//!
//! The engine is the only writer. Every block commit goes through
//! `ChainStore::commit` so account updates, the block append and any fork
//! truncation land together or not at all.

use powchain_codec::{Account, Address, Block, BlockHeader, H256};
use serde::{Deserialize, Serialize};

/// Metadata about the canonical chain
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainMetadata {
    /// Tip height
    pub height: u64,
    /// Tip header hash
    pub tip_hash: [u8; 32],
    /// Cumulative work of the tip
    pub cumulative_work: u64,
    /// Fees destroyed since genesis
    pub total_burned: u64,
    /// Last commit timestamp (unix seconds)
    pub last_save_ts: i64,
}

impl ChainMetadata {
    pub fn tip_hash(&self) -> H256 {
        H256(self.tip_hash)
    }
}

/// One atomic state transition
#[derive(Debug, Clone, Default)]
pub struct StateBatch {
    /// Drop every block with index above this before appending
    pub truncate_above: Option<u64>,
    /// Full account records to write
    pub accounts: Vec<Account>,
    /// Blocks to append in order on top of the (truncated) tip
    pub append: Vec<Block>,
    pub metadata: ChainMetadata,
}

pub trait ChainStore: Send + Sync {
    /// Account state; unknown addresses read as a zero account
    fn get_account(&self, address: &Address) -> anyhow::Result<Account>;

    fn put_account(&self, account: &Account) -> anyhow::Result<()>;

    fn get_block(&self, index: u64) -> anyhow::Result<Option<Block>>;

    /// Append a block on top of the current tip
    fn append_block(&self, block: &Block) -> anyhow::Result<()>;

    /// Header of the highest stored block
    fn chain_tip(&self) -> anyhow::Result<Option<BlockHeader>>;

    fn load_metadata(&self) -> anyhow::Result<Option<ChainMetadata>>;

    /// Apply a batch atomically
    fn commit(&self, batch: &StateBatch) -> anyhow::Result<()>;

    /// Flush pending writes to durable storage
    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Check that `blocks` form a chain on top of `tip`
pub(crate) fn check_chain(tip: Option<BlockHeader>, blocks: &[Block]) -> anyhow::Result<()> {
    let mut tip = tip;
    for block in blocks {
        check_extends(tip.as_ref(), block)?;
        tip = Some(block.header.clone());
    }
    Ok(())
}

/// Reject appends that do not extend the tip
pub(crate) fn check_extends(tip: Option<&BlockHeader>, block: &Block) -> anyhow::Result<()> {
    match tip {
        None if block.header.index == 0 => Ok(()),
        None => anyhow::bail!("first block must have index 0, got {}", block.header.index),
        Some(tip) => {
            if block.header.index != tip.index + 1 || block.header.previous_hash != tip.hash() {
                anyhow::bail!(
                    "block {} ({}) does not extend tip {} ({})",
                    block.header.index,
                    block.hash().short(),
                    tip.index,
                    tip.hash().short()
                );
            }
            Ok(())
        }
    }
}
