//! Transaction pool - priority queue with hash and sender indexes
//!
//! Ordering is `(priority desc, arrival asc)` with the transaction hash as a
//! final tie-breaker so the set is totally ordered. Arrival is a per-pool
//! sequence number rather than a clock reading, so two entries never tie on
//! arrival.
//!
//! Not thread-safe. It is owned by the mempool worker.

use super::{MempoolConfig, MempoolError, MempoolStats};
use crate::executor::BlockLimits;
use powchain_codec::{Account, Address, Canonical, Transaction, H256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TxPriority {
    priority: u64,
    arrival: u64,
    tx_hash: H256,
}

impl Ord for TxPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.arrival.cmp(&other.arrival))
            .then_with(|| self.tx_hash.cmp(&other.tx_hash))
    }
}

impl PartialOrd for TxPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    tx: Arc<Transaction>,
    priority: u64,
    arrival: u64,
    /// amount + fee
    cost: u64,
    size: usize,
    received_at: Instant,
}

impl PoolEntry {
    fn key(&self, tx_hash: H256) -> TxPriority {
        TxPriority {
            priority: self.priority,
            arrival: self.arrival,
            tx_hash,
        }
    }
}

pub struct TransactionPool {
    by_hash: HashMap<H256, PoolEntry>,
    by_priority: BTreeSet<TxPriority>,
    /// sender -> nonce -> hash
    by_sender: HashMap<Address, BTreeMap<u64, H256>>,
    /// Sum of pending `cost` per sender
    pending_spend: HashMap<Address, u64>,
    next_arrival: u64,
    config: MempoolConfig,
    stats: MempoolStats,
}

impl TransactionPool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            by_hash: HashMap::with_capacity(config.capacity),
            by_priority: BTreeSet::new(),
            by_sender: HashMap::new(),
            pending_spend: HashMap::new(),
            next_arrival: 0,
            stats: MempoolStats {
                capacity: config.capacity,
                ..Default::default()
            },
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains(&self, tx_hash: &H256) -> bool {
        self.by_hash.contains_key(tx_hash)
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    /// Admit `tx` against the sender's on-chain `account`
    pub fn add(&mut self, tx: Transaction, account: &Account, now: Instant) -> Result<H256, MempoolError> {
        let result = self.try_add(tx, account, now);
        if result.is_err() {
            self.stats.total_rejected += 1;
        }
        result
    }

    fn try_add(&mut self, tx: Transaction, account: &Account, now: Instant) -> Result<H256, MempoolError> {
        let tx_hash = tx.hash();
        if self.by_hash.contains_key(&tx_hash) {
            return Err(MempoolError::Duplicate(tx_hash));
        }
        if account.address != tx.sender {
            return Err(MempoolError::Validation("account does not belong to sender".into()));
        }
        if tx.gas_limit == 0 {
            return Err(MempoolError::Validation("gas limit must be positive".into()));
        }
        let priority = tx
            .priority()
            .ok_or_else(|| MempoolError::Validation("gas_price * gas_limit overflows".into()))?;
        let cost = tx
            .total_cost()
            .ok_or_else(|| MempoolError::Validation("amount + fee overflows".into()))?;

        if !tx.verify_signature() {
            return Err(MempoolError::InvalidSignature);
        }

        let min = account.nonce.saturating_add(1);
        let max = account.nonce.saturating_add(self.config.nonce_window);
        if tx.nonce < min || tx.nonce > max {
            return Err(MempoolError::NonceConflict {
                got: tx.nonce,
                min,
                max,
            });
        }
        if self
            .by_sender
            .get(&tx.sender)
            .is_some_and(|nonces| nonces.contains_key(&tx.nonce))
        {
            return Err(MempoolError::NoncePending { nonce: tx.nonce });
        }

        let pending = self.pending_spend.get(&tx.sender).copied().unwrap_or(0);
        let required = pending
            .checked_add(cost)
            .ok_or_else(|| MempoolError::Validation("pending spend overflows".into()))?;
        if account.balance < required {
            return Err(MempoolError::InsufficientBalance {
                required,
                available: account.balance,
            });
        }

        if self.by_hash.len() >= self.config.capacity {
            match self.min_priority() {
                Some(min_priority) if priority > min_priority => self.evict_lowest(),
                Some(min_priority) => return Err(MempoolError::MempoolFull { min_priority }),
                // zero capacity
                None => return Err(MempoolError::MempoolFull { min_priority: 0 }),
            }
        }

        let entry = PoolEntry {
            size: tx.encode().len(),
            tx: Arc::new(tx),
            priority,
            arrival: self.next_arrival,
            cost,
            received_at: now,
        };
        self.next_arrival += 1;

        self.by_priority.insert(entry.key(tx_hash));
        self.by_sender
            .entry(entry.tx.sender)
            .or_default()
            .insert(entry.tx.nonce, tx_hash);
        *self.pending_spend.entry(entry.tx.sender).or_default() += cost;
        self.by_hash.insert(tx_hash, entry);
        self.stats.total_added += 1;

        Ok(tx_hash)
    }

    /// Highest-priority `n` transactions
    pub fn top_n(&self, n: usize) -> Vec<Arc<Transaction>> {
        self.iter_by_priority().take(n).collect()
    }

    pub fn iter_by_priority(&self) -> impl Iterator<Item = Arc<Transaction>> + '_ {
        self.by_priority
            .iter()
            .filter_map(|p| self.by_hash.get(&p.tx_hash).map(|e| Arc::clone(&e.tx)))
    }

    /// Snapshot of a block's worth of transactions under `limits`.
    ///
    /// Entries are taken in priority order. Within one sender the chosen
    /// transactions are then placed in nonce order, keeping the sender's
    /// positions in the block, so a later nonce never lands before an
    /// earlier one.
    pub fn select(&self, limits: &BlockLimits) -> Vec<Arc<Transaction>> {
        let mut picked: Vec<&PoolEntry> = Vec::new();
        let mut gas = 0u64;
        let mut bytes = 0usize;

        for key in &self.by_priority {
            if picked.len() >= limits.max_txs {
                break;
            }
            let Some(entry) = self.by_hash.get(&key.tx_hash) else {
                continue;
            };
            let fits_gas = gas
                .checked_add(entry.tx.gas_limit)
                .is_some_and(|g| g <= limits.max_gas);
            if !fits_gas || bytes + entry.size > limits.max_bytes {
                continue;
            }
            gas += entry.tx.gas_limit;
            bytes += entry.size;
            picked.push(entry);
        }

        let mut per_sender: HashMap<Address, Vec<Arc<Transaction>>> = HashMap::new();
        for entry in &picked {
            per_sender
                .entry(entry.tx.sender)
                .or_default()
                .push(Arc::clone(&entry.tx));
        }
        for txs in per_sender.values_mut() {
            // pop() yields the lowest nonce
            txs.sort_by(|a, b| b.nonce.cmp(&a.nonce));
        }
        picked
            .iter()
            .filter_map(|entry| per_sender.get_mut(&entry.tx.sender).and_then(|txs| txs.pop()))
            .collect()
    }

    /// Remove included transactions. Returns how many were pending.
    pub fn remove(&mut self, hashes: &[H256]) -> usize {
        let removed = hashes
            .iter()
            .filter(|h| self.remove_entry(h).is_some())
            .count();
        self.stats.total_removed += removed as u64;
        removed
    }

    /// Drop a sender's entries whose nonce is no longer above `account.nonce`
    pub fn prune_stale(&mut self, account: &Account) -> usize {
        let stale: Vec<H256> = match self.by_sender.get(&account.address) {
            Some(nonces) => nonces.range(..=account.nonce).map(|(_, h)| *h).collect(),
            None => return 0,
        };
        for hash in &stale {
            self.remove_entry(hash);
        }
        self.stats.total_removed += stale.len() as u64;
        stale.len()
    }

    /// Purge entries older than the configured TTL
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let ttl = self.config.entry_ttl;
        let expired: Vec<H256> = self
            .by_hash
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.received_at) >= ttl)
            .map(|(h, _)| *h)
            .collect();
        for hash in &expired {
            self.remove_entry(hash);
        }
        self.stats.total_expired += expired.len() as u64;
        expired.len()
    }

    /// Pending nonces for `sender`, ascending
    pub fn sender_nonces(&self, sender: &Address) -> Vec<u64> {
        self.by_sender
            .get(sender)
            .map(|nonces| nonces.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            pending: self.by_hash.len(),
            unique_senders: self.by_sender.len(),
            ..self.stats.clone()
        }
    }

    fn min_priority(&self) -> Option<u64> {
        // last() is the lowest priority, latest arrival
        self.by_priority.last().map(|p| p.priority)
    }

    fn evict_lowest(&mut self) {
        if let Some(lowest) = self.by_priority.last().cloned() {
            tracing::debug!(
                "Evicting {} (priority {}) to make room",
                lowest.tx_hash.short(),
                lowest.priority
            );
            self.remove_entry(&lowest.tx_hash);
            self.stats.total_evicted += 1;
        }
    }

    fn remove_entry(&mut self, tx_hash: &H256) -> Option<PoolEntry> {
        let entry = self.by_hash.remove(tx_hash)?;
        self.by_priority.remove(&entry.key(*tx_hash));

        let sender = entry.tx.sender;
        if let Some(nonces) = self.by_sender.get_mut(&sender) {
            nonces.remove(&entry.tx.nonce);
            if nonces.is_empty() {
                self.by_sender.remove(&sender);
            }
        }
        if let Some(spend) = self.pending_spend.get_mut(&sender) {
            *spend -= entry.cost;
            if *spend == 0 {
                self.pending_spend.remove(&sender);
            }
        }
        Some(entry)
    }
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new(MempoolConfig::default())
    }
}
