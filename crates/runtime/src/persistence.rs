//! Persistence layer for chain state
//!
//! Uses the sled embedded database. Accounts and blocks are stored as their
//! canonical borsh bytes; chain metadata is bincode. A block commit is one
//! sled transaction across all three trees.

use crate::store::{check_chain, check_extends, ChainMetadata, ChainStore, StateBatch};
use powchain_codec::{Account, Address, Block, BlockHeader, Canonical};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional};
use std::path::Path;

const METADATA_KEY: &[u8] = b"chain";

/// Persistent chain storage
pub struct SledStore {
    /// Sled database instance
    db: Db,
    /// Address -> borsh Account
    accounts: sled::Tree,
    /// Big-endian block index -> borsh Block
    blocks: sled::Tree,
    /// Metadata tree
    metadata: sled::Tree,
}

impl SledStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        let accounts = db.open_tree("accounts")?;
        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;

        tracing::info!("Opened persistent store at {:?}", path.as_ref());

        Ok(Self {
            db,
            accounts,
            blocks,
            metadata,
        })
    }

    /// Get the number of stored accounts
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Get all accounts
    pub fn all_accounts(&self) -> anyhow::Result<Vec<Account>> {
        let mut accounts = Vec::with_capacity(self.accounts.len());
        for result in self.accounts.iter() {
            let (_, value) = result?;
            accounts.push(Account::decode(&value)?);
        }
        Ok(accounts)
    }

    /// Save chain metadata outside a block commit
    pub fn save_metadata(&self, metadata: &ChainMetadata) -> anyhow::Result<()> {
        let bytes = bincode::serialize(metadata)?;
        self.metadata.insert(METADATA_KEY, bytes)?;
        Ok(())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) -> anyhow::Result<()> {
        self.accounts.clear()?;
        self.blocks.clear()?;
        self.metadata.clear()?;
        Ok(())
    }

    fn last_block(&self) -> anyhow::Result<Option<Block>> {
        match self.blocks.last()? {
            Some((_, bytes)) => Ok(Some(Block::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn block_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

impl ChainStore for SledStore {
    fn get_account(&self, address: &Address) -> anyhow::Result<Account> {
        match self.accounts.get(address.as_ref())? {
            Some(bytes) => Ok(Account::decode(&bytes)?),
            None => Ok(Account::new(*address)),
        }
    }

    fn put_account(&self, account: &Account) -> anyhow::Result<()> {
        self.accounts.insert(account.address.as_ref(), account.encode())?;
        Ok(())
    }

    fn get_block(&self, index: u64) -> anyhow::Result<Option<Block>> {
        match self.blocks.get(block_key(index))? {
            Some(bytes) => Ok(Some(Block::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn append_block(&self, block: &Block) -> anyhow::Result<()> {
        let tip = self.last_block()?.map(|b| b.header);
        check_extends(tip.as_ref(), block)?;
        self.blocks.insert(block_key(block.header.index), block.encode())?;
        Ok(())
    }

    fn chain_tip(&self) -> anyhow::Result<Option<BlockHeader>> {
        Ok(self.last_block()?.map(|b| b.header))
    }

    fn load_metadata(&self) -> anyhow::Result<Option<ChainMetadata>> {
        match self.metadata.get(METADATA_KEY)? {
            Some(bytes) => {
                let metadata: ChainMetadata = bincode::deserialize(&bytes)?;
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }

    fn commit(&self, batch: &StateBatch) -> anyhow::Result<()> {
        // Transactional trees cannot iterate, so resolve the truncation
        // range and the post-truncation tip up front. The engine is the
        // only writer, so nothing moves underneath us.
        let mut stale = Vec::new();
        let mut tip = None;
        match batch.truncate_above {
            Some(height) => {
                for entry in self.blocks.range(block_key(height + 1)..) {
                    let (key, _) = entry?;
                    stale.push(key);
                }
                if let Some(entry) = self.blocks.range(..=block_key(height)).next_back() {
                    let (_, bytes) = entry?;
                    tip = Some(Block::decode(&bytes)?.header);
                }
            }
            None => tip = self.last_block()?.map(|b| b.header),
        }

        check_chain(tip, &batch.append)?;
        let block_rows: Vec<([u8; 8], Vec<u8>)> = batch
            .append
            .iter()
            .map(|b| (block_key(b.header.index), b.encode()))
            .collect();
        let account_rows: Vec<([u8; 32], Vec<u8>)> = batch
            .accounts
            .iter()
            .map(|a| (a.address.0, a.encode()))
            .collect();
        let metadata_bytes = bincode::serialize(&batch.metadata)?;

        let result: Result<(), TransactionError<()>> = (&self.accounts, &self.blocks, &self.metadata)
            .transaction(|(accounts, blocks, metadata)| {
                for key in &stale {
                    blocks.remove(key.as_ref())?;
                }
                for (key, value) in &account_rows {
                    accounts.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &block_rows {
                    blocks.insert(key.as_slice(), value.as_slice())?;
                }
                metadata.insert(METADATA_KEY, metadata_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            });
        result.map_err(|e| anyhow::anyhow!("block commit transaction failed: {:?}", e))?;

        if !stale.is_empty() {
            tracing::debug!("Truncated {} persisted blocks", stale.len());
        }
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
