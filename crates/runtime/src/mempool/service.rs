//! Mempool service - the pool's dedicated worker
//!
//! ```text
//! RPC/P2P ──[add]──────────► Mempool ◄──[select]─── Consensus
//!                               │
//!                               ◄──[remove]───────── Consensus (after commit)
//! ```
//!
//! All access goes through a bounded command queue. Signature checks run on
//! the worker so the caller's task is never blocked on crypto.

use super::{MempoolConfig, MempoolError, MempoolStats, TransactionPool};
use crate::executor::BlockLimits;
use crate::store::ChainStore;
use powchain_codec::{Address, Transaction, H256};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

enum MempoolCommand {
    Add {
        tx: Transaction,
        reply: oneshot::Sender<Result<H256, MempoolError>>,
    },
    TopN {
        n: usize,
        reply: oneshot::Sender<Vec<Arc<Transaction>>>,
    },
    Select {
        limits: BlockLimits,
        reply: oneshot::Sender<Vec<Arc<Transaction>>>,
    },
    /// Drop included transactions and anything the new nonces made stale
    Remove {
        hashes: Vec<H256>,
        senders: Vec<Address>,
        reply: oneshot::Sender<usize>,
    },
    EvictExpired {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<MempoolStats>,
    },
    Shutdown,
}

/// Handle for talking to the mempool worker
#[derive(Clone)]
pub struct MempoolHandle {
    sender: mpsc::Sender<MempoolCommand>,
}

impl MempoolHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> MempoolCommand,
    ) -> Result<T, MempoolError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(make(reply))
            .await
            .map_err(|_| MempoolError::Closed)?;
        response.await.map_err(|_| MempoolError::Closed)
    }

    /// Submit a transaction for admission
    pub async fn add(&self, tx: Transaction) -> Result<H256, MempoolError> {
        self.request(|reply| MempoolCommand::Add { tx, reply }).await?
    }

    pub async fn top_n(&self, n: usize) -> Result<Vec<Arc<Transaction>>, MempoolError> {
        self.request(|reply| MempoolCommand::TopN { n, reply }).await
    }

    /// Snapshot of the transactions for the next block
    pub async fn select(&self, limits: BlockLimits) -> Result<Vec<Arc<Transaction>>, MempoolError> {
        self.request(|reply| MempoolCommand::Select { limits, reply }).await
    }

    /// Remove transactions that a committed block included
    pub async fn remove(&self, hashes: Vec<H256>, senders: Vec<Address>) -> Result<usize, MempoolError> {
        self.request(|reply| MempoolCommand::Remove {
            hashes,
            senders,
            reply,
        })
        .await
    }

    /// Run the TTL sweep now
    pub async fn evict_expired(&self) -> Result<usize, MempoolError> {
        self.request(|reply| MempoolCommand::EvictExpired { reply }).await
    }

    pub async fn stats(&self) -> Result<MempoolStats, MempoolError> {
        self.request(|reply| MempoolCommand::Stats { reply }).await
    }

    /// Stop the worker
    pub async fn shutdown(&self) {
        let _ = self.sender.send(MempoolCommand::Shutdown).await;
    }
}

/// Mempool worker
pub struct MempoolService<S> {
    pool: TransactionPool,
    store: Arc<S>,
    commands: mpsc::Receiver<MempoolCommand>,
}

impl<S: ChainStore + 'static> MempoolService<S> {
    /// Create the worker and its handle
    pub fn new(store: Arc<S>, config: MempoolConfig) -> (Self, MempoolHandle) {
        let (sender, commands) = mpsc::channel(config.queue_depth.max(1));
        let service = Self {
            pool: TransactionPool::new(config),
            store,
            commands,
        };
        (service, MempoolHandle { sender })
    }

    /// Spawn the worker on the current runtime
    pub fn spawn(store: Arc<S>, config: MempoolConfig) -> (MempoolHandle, JoinHandle<()>) {
        let (service, handle) = Self::new(store, config);
        (handle, tokio::spawn(service.run()))
    }

    /// Run until shut down or every handle is dropped
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.pool.config().sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        sweep.tick().await;

        tracing::info!(
            "Mempool started (capacity {}, nonce window {}, ttl {:?})",
            self.pool.config().capacity,
            self.pool.config().nonce_window,
            self.pool.config().entry_ttl
        );

        loop {
            tokio::select! {
                biased;

                _ = sweep.tick() => {
                    let expired = self.pool.evict_expired(now());
                    if expired > 0 {
                        tracing::debug!("Swept {} expired transactions", expired);
                    }
                }
                command = self.commands.recv() => match command {
                    Some(MempoolCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
            }
        }

        tracing::info!("Mempool stopped with {} pending", self.pool.len());
    }

    fn handle(&mut self, command: MempoolCommand) {
        match command {
            MempoolCommand::Add { tx, reply } => {
                let result = self.admit(tx);
                let _ = reply.send(result);
            }
            MempoolCommand::TopN { n, reply } => {
                let _ = reply.send(self.pool.top_n(n));
            }
            MempoolCommand::Select { limits, reply } => {
                let _ = reply.send(self.pool.select(&limits));
            }
            MempoolCommand::Remove {
                hashes,
                senders,
                reply,
            } => {
                let mut removed = self.pool.remove(&hashes);
                for sender in senders {
                    match self.store.get_account(&sender) {
                        Ok(account) => removed += self.pool.prune_stale(&account),
                        Err(e) => tracing::warn!("Account lookup for {} failed: {}", sender.short(), e),
                    }
                }
                let _ = reply.send(removed);
            }
            MempoolCommand::EvictExpired { reply } => {
                let _ = reply.send(self.pool.evict_expired(now()));
            }
            MempoolCommand::Stats { reply } => {
                let _ = reply.send(self.pool.stats());
            }
            MempoolCommand::Shutdown => {}
        }
    }

    fn admit(&mut self, tx: Transaction) -> Result<H256, MempoolError> {
        let account = self
            .store
            .get_account(&tx.sender)
            .map_err(|e| MempoolError::Storage(e.to_string()))?;
        match self.pool.add(tx, &account, now()) {
            Ok(hash) => {
                tracing::trace!("Admitted transaction {}", hash.short());
                Ok(hash)
            }
            Err(e) => {
                tracing::debug!("Rejected transaction: {}", e);
                Err(e)
            }
        }
    }
}

/// Tokio's clock, so paused-time tests drive TTL expiry
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account_store::MemoryStore;
    use ed25519_dalek::SigningKey;
    use powchain_codec::{address_of, Account};
    use std::time::Duration;

    fn funded_store(keys: &[&SigningKey]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for key in keys {
            store
                .put_account(&Account::with_balance(address_of(key), 1_000_000))
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_add_select_remove() {
        let alice = SigningKey::from_bytes(&[1; 32]);
        let store = funded_store(&[&alice]);
        let (handle, worker) = MempoolService::spawn(store.clone(), MempoolConfig::default());

        let recipient = H256([9; 32]);
        let first = handle
            .add(Transaction::signed(&alice, recipient, 5, 1, 10, 1))
            .await
            .unwrap();
        handle
            .add(Transaction::signed(&alice, recipient, 5, 2, 10, 1))
            .await
            .unwrap();

        let replay = handle.add(Transaction::signed(&alice, recipient, 5, 0, 10, 1)).await;
        assert!(matches!(replay, Err(MempoolError::NonceConflict { min: 1, .. })));

        let snapshot = handle.select(BlockLimits::default()).await.unwrap();
        assert_eq!(snapshot.len(), 2);
        // Selection is a snapshot; nothing is removed until commit
        assert_eq!(handle.stats().await.unwrap().pending, 2);

        // The block carrying nonce 1 and 2 commits
        let mut committed = Account::with_balance(address_of(&alice), 999_000);
        committed.nonce = 2;
        store.put_account(&committed).unwrap();
        let removed = handle.remove(vec![first], vec![address_of(&alice)]).await.unwrap();
        assert_eq!(removed, 2);
        assert!(handle.top_n(10).await.unwrap().is_empty());

        handle.shutdown().await;
        worker.await.unwrap();
        assert!(matches!(handle.stats().await, Err(MempoolError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_expires_entries() {
        let alice = SigningKey::from_bytes(&[1; 32]);
        let store = funded_store(&[&alice]);
        let config = MempoolConfig {
            entry_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            ..Default::default()
        };
        let (handle, _worker) = MempoolService::spawn(store, config);

        handle
            .add(Transaction::signed(&alice, H256([9; 32]), 5, 1, 10, 1))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(handle.stats().await.unwrap().pending, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total_expired, 1);
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_worker() {
        let store = Arc::new(MemoryStore::new());
        let (handle, worker) = MempoolService::spawn(store, MempoolConfig::default());
        drop(handle);
        worker.await.unwrap();
    }
}
