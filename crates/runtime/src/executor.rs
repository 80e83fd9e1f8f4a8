//! Block executor
//!
//! Applies a block's transfers and fee settlement to an account overlay.
//! Nothing touches the store until the engine commits the overlay in one
//! `StateBatch`, so a block is applied entirely or not at all.

use crate::fee::{split_fee, FeeSplit};
use crate::store::ChainStore;
use powchain_codec::{Account, Address, Canonical, Transaction, H256};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("fee overflows u64")]
    FeeOverflow,

    #[error("nonce {got} already used, expected at least {expected}")]
    NonceTooLow { expected: u64, got: u64 },

    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("balance overflow crediting {0}")]
    BalanceOverflow(Address),

    #[error("block limit exceeded: {0}")]
    BlockLimit(&'static str),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-block ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLimits {
    pub max_gas: u64,
    pub max_bytes: usize,
    pub max_txs: usize,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self {
            max_gas: crate::MAX_BLOCK_GAS,
            max_bytes: crate::MAX_BLOCK_BYTES,
            max_txs: crate::MAX_TXS_PER_BLOCK,
        }
    }
}

/// How invalid transactions are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Building our own block: skip what does not apply
    Assemble,
    /// Checking a peer's block: any invalid transaction rejects the block
    Import,
}

/// Account state layered over a store
pub struct AccountOverlay<'a> {
    base: &'a dyn ChainStore,
    accounts: BTreeMap<Address, Account>,
}

impl<'a> AccountOverlay<'a> {
    pub fn new(base: &'a dyn ChainStore) -> Self {
        Self {
            base,
            accounts: BTreeMap::new(),
        }
    }

    pub fn get(&self, address: &Address) -> Result<Account, ExecutionError> {
        match self.accounts.get(address) {
            Some(account) => Ok(account.clone()),
            None => self
                .base
                .get_account(address)
                .map_err(|e| ExecutionError::Storage(e.to_string())),
        }
    }

    pub fn put(&mut self, account: Account) {
        self.accounts.insert(account.address, account);
    }

    /// Restore account values recorded in an undo log
    pub fn restore(&mut self, undo: &[Account]) {
        for account in undo {
            self.put(account.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Touched accounts in address order
    pub fn into_accounts(self) -> Vec<Account> {
        self.accounts.into_values().collect()
    }
}

/// Result of applying one block
#[derive(Debug, Clone, Default)]
pub struct BlockEffects {
    /// Transactions applied, in block order
    pub included: Vec<Transaction>,
    /// Skipped transactions (assembly only)
    pub rejected: Vec<(H256, ExecutionError)>,
    /// Pre-block values of every account the block touched
    pub undo: Vec<Account>,
    pub total_fees: u64,
    pub split: FeeSplit,
    pub gas_used: u64,
    pub bytes_used: usize,
}

/// Records each account's value before its first write in this block
struct BlockRun<'o, 'a> {
    overlay: &'o mut AccountOverlay<'a>,
    before: BTreeMap<Address, Account>,
}

impl BlockRun<'_, '_> {
    fn load(&mut self, address: &Address) -> Result<Account, ExecutionError> {
        let account = self.overlay.get(address)?;
        self.before
            .entry(*address)
            .or_insert_with(|| account.clone());
        Ok(account)
    }

    fn credit(&mut self, address: &Address, amount: u64) -> Result<(), ExecutionError> {
        if amount == 0 {
            return Ok(());
        }
        let mut account = self.load(address)?;
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or(ExecutionError::BalanceOverflow(*address))?;
        self.overlay.put(account);
        Ok(())
    }

    /// Apply one transfer; nothing is written unless every check passes
    fn transfer(&mut self, tx: &Transaction) -> Result<u64, ExecutionError> {
        if !tx.verify_signature() {
            return Err(ExecutionError::InvalidSignature);
        }
        let fee = tx.fee().ok_or(ExecutionError::FeeOverflow)?;
        let cost = tx.total_cost().ok_or(ExecutionError::FeeOverflow)?;

        let mut sender = self.load(&tx.sender)?;
        if tx.nonce <= sender.nonce {
            return Err(ExecutionError::NonceTooLow {
                expected: sender.nonce.saturating_add(1),
                got: tx.nonce,
            });
        }
        if sender.balance < cost {
            return Err(ExecutionError::InsufficientBalance {
                required: cost,
                available: sender.balance,
            });
        }
        sender.balance -= cost;
        sender.nonce = tx.nonce;

        if tx.recipient == tx.sender {
            sender.balance += tx.amount;
            self.overlay.put(sender);
        } else {
            let mut recipient = self.load(&tx.recipient)?;
            recipient.balance = recipient
                .balance
                .checked_add(tx.amount)
                .ok_or(ExecutionError::BalanceOverflow(tx.recipient))?;
            self.overlay.put(sender);
            self.overlay.put(recipient);
        }
        Ok(fee)
    }
}

/// Apply `transactions` and settle their fees onto `overlay`
pub fn execute_block(
    overlay: &mut AccountOverlay<'_>,
    transactions: &[Transaction],
    proposer: &Address,
    treasury: &Address,
    limits: &BlockLimits,
    mode: ExecutionMode,
) -> Result<BlockEffects, ExecutionError> {
    let mut run = BlockRun {
        overlay,
        before: BTreeMap::new(),
    };
    let mut effects = BlockEffects::default();

    for tx in transactions {
        let hash = tx.hash();
        if effects.included.len() >= limits.max_txs {
            match mode {
                ExecutionMode::Assemble => break,
                ExecutionMode::Import => return Err(ExecutionError::BlockLimit("transaction count")),
            }
        }

        let size = tx.encode().len();
        let over_gas = effects
            .gas_used
            .checked_add(tx.gas_limit)
            .map_or(true, |gas| gas > limits.max_gas);
        let over_bytes = effects.bytes_used + size > limits.max_bytes;
        if over_gas || over_bytes {
            match mode {
                ExecutionMode::Assemble => {
                    let what = if over_gas { "gas" } else { "bytes" };
                    effects.rejected.push((hash, ExecutionError::BlockLimit(what)));
                    continue;
                }
                ExecutionMode::Import => {
                    return Err(ExecutionError::BlockLimit(if over_gas { "gas" } else { "bytes" }))
                }
            }
        }

        match run.transfer(tx) {
            Ok(fee) => {
                effects.total_fees = effects
                    .total_fees
                    .checked_add(fee)
                    .ok_or(ExecutionError::FeeOverflow)?;
                effects.gas_used += tx.gas_limit;
                effects.bytes_used += size;
                effects.included.push(tx.clone());
            }
            Err(e) if mode == ExecutionMode::Assemble => {
                tracing::debug!("Skipping transaction {}: {}", hash.short(), e);
                effects.rejected.push((hash, e));
            }
            Err(e) => return Err(e),
        }
    }

    effects.split = split_fee(effects.total_fees);
    run.credit(proposer, effects.split.validator)?;
    run.credit(treasury, effects.split.treasury)?;

    effects.undo = run.before.into_values().collect();
    Ok(effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account_store::MemoryStore;
    use ed25519_dalek::SigningKey;
    use powchain_codec::address_of;

    const PROPOSER: H256 = H256([0xaa; 32]);
    const TREASURY: H256 = H256([0xbb; 32]);

    fn funded(store: &MemoryStore, key: &SigningKey, balance: u64) -> Address {
        let address = address_of(key);
        store
            .put_account(&Account::with_balance(address, balance))
            .unwrap();
        address
    }

    #[test]
    fn test_transfer_and_fee_settlement() {
        let store = MemoryStore::new();
        let alice = SigningKey::from_bytes(&[1; 32]);
        let alice_addr = funded(&store, &alice, 1_000_000);
        let bob = H256([2; 32]);

        // fee = 10 * 10_000 = 100_000
        let tx = Transaction::signed(&alice, bob, 500, 1, 10_000, 10);
        let mut overlay = AccountOverlay::new(&store);
        let effects = execute_block(
            &mut overlay,
            &[tx],
            &PROPOSER,
            &TREASURY,
            &BlockLimits::default(),
            ExecutionMode::Import,
        )
        .unwrap();

        assert_eq!(effects.total_fees, 100_000);
        assert_eq!(effects.split.burn, 29_290);
        assert_eq!(overlay.get(&alice_addr).unwrap().balance, 1_000_000 - 100_500);
        assert_eq!(overlay.get(&alice_addr).unwrap().nonce, 1);
        assert_eq!(overlay.get(&bob).unwrap().balance, 500);
        assert_eq!(overlay.get(&PROPOSER).unwrap().balance, 41_420);
        assert_eq!(overlay.get(&TREASURY).unwrap().balance, 29_290);

        // Nothing reaches the store before commit
        assert_eq!(store.get_account(&bob).unwrap().balance, 0);

        // Undo holds the pre-block values
        let before: BTreeMap<_, _> = effects.undo.iter().map(|a| (a.address, a.balance)).collect();
        assert_eq!(before[&alice_addr], 1_000_000);
        assert_eq!(before[&bob], 0);
        assert_eq!(before[&PROPOSER], 0);
    }

    #[test]
    fn test_assembly_skips_invalid_transactions() {
        let store = MemoryStore::new();
        let alice = SigningKey::from_bytes(&[1; 32]);
        funded(&store, &alice, 1_000);
        let bob = H256([2; 32]);

        let ok = Transaction::signed(&alice, bob, 10, 1, 1, 1);
        let replayed = Transaction::signed(&alice, bob, 10, 1, 1, 1);
        let broke = Transaction::signed(&alice, bob, 10_000, 2, 1, 1);
        let mut forged = Transaction::signed(&alice, bob, 1, 3, 1, 1);
        forged.amount = 900;

        let mut overlay = AccountOverlay::new(&store);
        let effects = execute_block(
            &mut overlay,
            &[ok, replayed, broke, forged],
            &PROPOSER,
            &TREASURY,
            &BlockLimits::default(),
            ExecutionMode::Assemble,
        )
        .unwrap();

        assert_eq!(effects.included.len(), 1);
        let errors: Vec<_> = effects.rejected.iter().map(|(_, e)| e.clone()).collect();
        assert_eq!(
            errors,
            vec![
                ExecutionError::NonceTooLow { expected: 2, got: 1 },
                ExecutionError::InsufficientBalance {
                    required: 10_001,
                    available: 989
                },
                ExecutionError::InvalidSignature,
            ]
        );
    }

    #[test]
    fn test_import_rejects_block_with_invalid_transaction() {
        let store = MemoryStore::new();
        let alice = SigningKey::from_bytes(&[1; 32]);
        funded(&store, &alice, 5);
        let tx = Transaction::signed(&alice, H256([2; 32]), 10, 1, 1, 1);

        let mut overlay = AccountOverlay::new(&store);
        let result = execute_block(
            &mut overlay,
            &[tx],
            &PROPOSER,
            &TREASURY,
            &BlockLimits::default(),
            ExecutionMode::Import,
        );
        assert!(matches!(result, Err(ExecutionError::InsufficientBalance { .. })));
    }

    #[test]
    fn test_import_with_exhausted_nonce_is_rejected() {
        let store = MemoryStore::new();
        let alice = SigningKey::from_bytes(&[1; 32]);
        funded(&store, &alice, 1_000);
        let bob = H256([2; 32]);
        let txs = vec![
            Transaction::signed(&alice, bob, 1, u64::MAX, 1, 1),
            Transaction::signed(&alice, bob, 1, 5, 1, 1),
        ];

        let mut overlay = AccountOverlay::new(&store);
        let result = execute_block(
            &mut overlay,
            &txs,
            &PROPOSER,
            &TREASURY,
            &BlockLimits::default(),
            ExecutionMode::Import,
        );
        assert_eq!(
            result.unwrap_err(),
            ExecutionError::NonceTooLow {
                expected: u64::MAX,
                got: 5
            }
        );
    }

    #[test]
    fn test_gas_ceiling() {
        let store = MemoryStore::new();
        let alice = SigningKey::from_bytes(&[1; 32]);
        funded(&store, &alice, 1_000_000);
        let bob = H256([2; 32]);
        let txs = vec![
            Transaction::signed(&alice, bob, 1, 1, 600, 1),
            Transaction::signed(&alice, bob, 1, 2, 600, 1),
            Transaction::signed(&alice, bob, 1, 3, 400, 1),
        ];
        let limits = BlockLimits {
            max_gas: 1_000,
            ..Default::default()
        };

        let mut overlay = AccountOverlay::new(&store);
        let effects = execute_block(
            &mut overlay,
            &txs,
            &PROPOSER,
            &TREASURY,
            &limits,
            ExecutionMode::Assemble,
        )
        .unwrap();
        assert_eq!(effects.included.len(), 2);
        assert_eq!(effects.gas_used, 1_000);

        let mut overlay = AccountOverlay::new(&store);
        let result = execute_block(&mut overlay, &txs, &PROPOSER, &TREASURY, &limits, ExecutionMode::Import);
        assert_eq!(result.unwrap_err(), ExecutionError::BlockLimit("gas"));
    }

    #[test]
    fn test_self_transfer_only_pays_fee() {
        let store = MemoryStore::new();
        let alice = SigningKey::from_bytes(&[3; 32]);
        let address = funded(&store, &alice, 100);
        let tx = Transaction::signed(&alice, address, 50, 1, 2, 5);

        let mut overlay = AccountOverlay::new(&store);
        execute_block(
            &mut overlay,
            &[tx],
            &PROPOSER,
            &TREASURY,
            &BlockLimits::default(),
            ExecutionMode::Import,
        )
        .unwrap();
        assert_eq!(overlay.get(&address).unwrap().balance, 90);
    }

    #[test]
    fn test_restore_reverts_block() {
        let store = MemoryStore::new();
        let alice = SigningKey::from_bytes(&[1; 32]);
        let alice_addr = funded(&store, &alice, 1_000);
        let tx = Transaction::signed(&alice, H256([2; 32]), 100, 1, 1, 1);

        let mut overlay = AccountOverlay::new(&store);
        let effects = execute_block(
            &mut overlay,
            &[tx],
            &PROPOSER,
            &TREASURY,
            &BlockLimits::default(),
            ExecutionMode::Import,
        )
        .unwrap();
        overlay.restore(&effects.undo);
        assert_eq!(overlay.get(&alice_addr).unwrap(), Account::with_balance(alice_addr, 1_000));
        assert_eq!(overlay.get(&PROPOSER).unwrap().balance, 0);
    }
}
