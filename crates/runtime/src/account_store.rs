//! In-memory chain storage using DashMap for concurrent account reads

use crate::store::{check_chain, check_extends, ChainMetadata, ChainStore, StateBatch};
use dashmap::DashMap;
use parking_lot::RwLock;
use powchain_codec::{Account, Address, Block, BlockHeader};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Thread-safe in-memory chain storage
///
/// Accounts live in a DashMap so the mempool can read balances while the
/// engine commits. Blocks and metadata sit behind one lock; `commit` holds
/// it for the whole batch, which serializes writers.
#[derive(Clone, Default)]
pub struct MemoryStore {
    accounts: Arc<DashMap<Address, Account>>,
    blocks: Arc<RwLock<BTreeMap<u64, Block>>>,
    metadata: Arc<RwLock<Option<ChainMetadata>>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if an account record exists
    pub fn account_exists(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    /// Get account count
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Number of stored blocks
    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    /// Snapshot of every account record
    pub fn all_accounts(&self) -> Vec<Account> {
        self.accounts.iter().map(|r| r.value().clone()).collect()
    }
}

impl ChainStore for MemoryStore {
    fn get_account(&self, address: &Address) -> anyhow::Result<Account> {
        Ok(self
            .accounts
            .get(address)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| Account::new(*address)))
    }

    fn put_account(&self, account: &Account) -> anyhow::Result<()> {
        self.accounts.insert(account.address, account.clone());
        Ok(())
    }

    fn get_block(&self, index: u64) -> anyhow::Result<Option<Block>> {
        Ok(self.blocks.read().get(&index).cloned())
    }

    fn append_block(&self, block: &Block) -> anyhow::Result<()> {
        let mut blocks = self.blocks.write();
        let tip = blocks.values().next_back().map(|b| b.header.clone());
        check_extends(tip.as_ref(), block)?;
        blocks.insert(block.header.index, block.clone());
        Ok(())
    }

    fn chain_tip(&self) -> anyhow::Result<Option<BlockHeader>> {
        Ok(self.blocks.read().values().next_back().map(|b| b.header.clone()))
    }

    fn load_metadata(&self) -> anyhow::Result<Option<ChainMetadata>> {
        Ok(self.metadata.read().clone())
    }

    fn commit(&self, batch: &StateBatch) -> anyhow::Result<()> {
        let mut blocks = self.blocks.write();

        // Validate against the post-truncation tip before touching anything
        let tip = match batch.truncate_above {
            Some(height) => blocks.range(..=height).next_back().map(|(_, b)| b.header.clone()),
            None => blocks.values().next_back().map(|b| b.header.clone()),
        };
        check_chain(tip, &batch.append)?;

        if let Some(height) = batch.truncate_above {
            let dropped = blocks.split_off(&(height + 1));
            if !dropped.is_empty() {
                tracing::debug!("Truncated {} blocks above {}", dropped.len(), height);
            }
        }
        for account in &batch.accounts {
            self.accounts.insert(account.address, account.clone());
        }
        for block in &batch.append {
            blocks.insert(block.header.index, block.clone());
        }
        *self.metadata.write() = Some(batch.metadata.clone());
        Ok(())
    }
}
