//! Engine service - the consensus engine's dedicated worker
//!
//! ```text
//! slot timer ──► propose ──┐
//! relay ──[import]─────────┼──► ConsensusEngine ──► store
//! miners ──[proof]─────────┘          │
//!                                     ├──► mempool.remove / re-add
//!                                     ├──► gossip.enqueue(cid)
//!                                     └──► BlockUpdate subscribers
//! ```
//!
//! Proof verification runs on the blocking pool before the proof reaches the
//! worker, so a slow reveal never delays a slot.

use crate::engine::ConsensusEngine;
use crate::error::ConsensusError;
use crate::gossip::GossipHandle;
use crate::slashing::SlashingRecord;
use crate::types::{BlockUpdate, CommitInfo, ConsensusStats, ImportOutcome};
use chrono::Utc;
use powchain_admission::{AdmissionError, AdmittedProof, CommitmentBinder, Solver};
use powchain_codec::{Block, BlockHeader, Epoch, ProofCommitment, ProofReveal, Transaction};
use powchain_runtime::{ChainStore, MempoolHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Capacity of the block update channel
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

enum EngineCommand {
    SubmitProof {
        proof: AdmittedProof,
        reply: oneshot::Sender<bool>,
    },
    ImportBlock {
        block: Block,
        reply: oneshot::Sender<Result<ImportOutcome, ConsensusError>>,
    },
    Stats {
        reply: oneshot::Sender<ConsensusStats>,
    },
    Tip {
        reply: oneshot::Sender<BlockHeader>,
    },
    Slashing {
        reply: oneshot::Sender<Vec<SlashingRecord>>,
    },
    Blocks {
        from: u64,
        count: u64,
        reply: oneshot::Sender<Result<Vec<Block>, ConsensusError>>,
    },
    Shutdown,
}

/// Handle for talking to the engine worker
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
    binder: Arc<CommitmentBinder>,
    solver: Arc<dyn Solver>,
    abort: Arc<AtomicBool>,
    updates: broadcast::Sender<BlockUpdate>,
    halted: Arc<AtomicBool>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, ConsensusError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(make(reply))
            .await
            .map_err(|_| ConsensusError::Closed)?;
        response.await.map_err(|_| ConsensusError::Closed)
    }

    /// Epoch miners should currently target
    pub fn epoch(&self) -> Epoch {
        self.binder.epoch()
    }

    /// Phase one of proof admission
    pub fn submit_commitment(&self, commitment: &ProofCommitment) -> Result<(), AdmissionError> {
        self.binder.submit_commitment(commitment)
    }

    /// Phase two: verify off the worker, then offer the proof for the next
    /// block. Returns whether it became the best proof.
    pub async fn admit_reveal(&self, reveal: ProofReveal) -> Result<bool, ConsensusError> {
        let binder = self.binder.clone();
        let solver = self.solver.clone();
        let abort = self.abort.clone();
        let admitted = tokio::task::spawn_blocking(move || {
            binder.admit_reveal(&reveal, solver.as_ref(), Some(abort))
        })
        .await
        .map_err(|_| ConsensusError::Closed)??;

        self.request(|reply| EngineCommand::SubmitProof {
            proof: admitted,
            reply,
        })
        .await
    }

    /// Hand a peer's block to the engine
    pub async fn import_block(&self, block: Block) -> Result<ImportOutcome, ConsensusError> {
        self.request(|reply| EngineCommand::ImportBlock { block, reply })
            .await?
    }

    pub async fn stats(&self) -> Result<ConsensusStats, ConsensusError> {
        self.request(|reply| EngineCommand::Stats { reply }).await
    }

    pub async fn tip(&self) -> Result<BlockHeader, ConsensusError> {
        self.request(|reply| EngineCommand::Tip { reply }).await
    }

    pub async fn slashing_records(&self) -> Result<Vec<SlashingRecord>, ConsensusError> {
        self.request(|reply| EngineCommand::Slashing { reply }).await
    }

    /// Canonical blocks for a peer catching up
    pub async fn canonical_blocks(&self, from: u64, count: u64) -> Result<Vec<Block>, ConsensusError> {
        self.request(|reply| EngineCommand::Blocks { from, count, reply })
            .await?
    }

    /// Subscribe to committed blocks
    pub fn subscribe(&self) -> broadcast::Receiver<BlockUpdate> {
        self.updates.subscribe()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop the worker and cut in-flight verification short
    pub async fn shutdown(&self) {
        self.abort.store(true, Ordering::SeqCst);
        let _ = self.sender.send(EngineCommand::Shutdown).await;
    }
}

/// Engine worker
pub struct EngineService<S> {
    engine: ConsensusEngine<S>,
    mempool: MempoolHandle,
    gossip: Option<GossipHandle>,
    commands: mpsc::Receiver<EngineCommand>,
    updates: broadcast::Sender<BlockUpdate>,
    halted: Arc<AtomicBool>,
}

impl<S: ChainStore + 'static> EngineService<S> {
    /// Create the worker and its handle
    pub fn new(
        engine: ConsensusEngine<S>,
        mempool: MempoolHandle,
        gossip: Option<GossipHandle>,
    ) -> (Self, EngineHandle) {
        let (sender, commands) = mpsc::channel(engine.config().queue_depth.max(1));
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let halted = Arc::new(AtomicBool::new(engine.is_halted()));

        let handle = EngineHandle {
            sender,
            binder: engine.binder(),
            solver: engine.solver(),
            abort: engine.abort_flag(),
            updates: updates.clone(),
            halted: halted.clone(),
        };
        let service = Self {
            engine,
            mempool,
            gossip,
            commands,
            updates,
            halted,
        };
        (service, handle)
    }

    /// Spawn the worker on the current runtime
    pub fn spawn(
        engine: ConsensusEngine<S>,
        mempool: MempoolHandle,
        gossip: Option<GossipHandle>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (service, handle) = Self::new(engine, mempool, gossip);
        (handle, tokio::spawn(service.run()))
    }

    /// Run until shut down or every handle is dropped
    pub async fn run(mut self) {
        let mut slots = tokio::time::interval(self.engine.config().slot_interval);
        slots.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        slots.tick().await;

        tracing::info!(
            "Engine started as {} at height {} (slot {:?}, {} validators)",
            self.engine.address().short(),
            self.engine.tip().index,
            self.engine.config().slot_interval,
            self.engine.schedule().len()
        );

        loop {
            tokio::select! {
                _ = slots.tick() => self.on_slot().await,
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
            }
        }

        if let Err(e) = self.engine.store().flush() {
            tracing::error!("Failed to flush chain store: {}", e);
        }
        tracing::info!("Engine stopped at height {}", self.engine.tip().index);
    }

    async fn on_slot(&mut self) {
        if self.engine.is_halted() {
            return;
        }
        let height = self.engine.next_height();
        if !self.engine.is_my_slot(height) {
            return;
        }

        let candidates: Vec<Transaction> = match self
            .mempool
            .select(self.engine.config().block_limits())
            .await
        {
            Ok(selected) => selected.iter().map(|tx| tx.as_ref().clone()).collect(),
            Err(e) => {
                tracing::warn!("Mempool unavailable for slot {}: {}", height, e);
                Vec::new()
            }
        };

        let timestamp = Utc::now().timestamp_millis().max(0) as u64;
        match self.engine.propose(&candidates, timestamp) {
            Ok(info) => self.after_commits(&[info], None, Vec::new()).await,
            Err(e) => self.on_error("propose", e),
        }
    }

    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SubmitProof { proof, reply } => {
                let _ = reply.send(self.engine.submit_proof(proof));
            }
            EngineCommand::ImportBlock { block, reply } => {
                let result = self.engine.import_block(block);
                match &result {
                    Ok(ImportOutcome::Extended(info)) => {
                        self.after_commits(std::slice::from_ref(info), None, Vec::new())
                            .await
                    }
                    Ok(ImportOutcome::Reorganized {
                        depth,
                        committed,
                        reverted,
                    }) => {
                        self.after_commits(committed, Some(*depth), reverted.clone())
                            .await
                    }
                    Ok(_) => {}
                    Err(e) => self.on_error("import", e.clone()),
                }
                let _ = reply.send(result);
            }
            EngineCommand::Stats { reply } => {
                let _ = reply.send(self.engine.stats());
            }
            EngineCommand::Tip { reply } => {
                let _ = reply.send(self.engine.tip().clone());
            }
            EngineCommand::Slashing { reply } => {
                let _ = reply.send(self.engine.slashing().records().to_vec());
            }
            EngineCommand::Blocks { from, count, reply } => {
                let _ = reply.send(self.engine.canonical_blocks(from, count));
            }
            EngineCommand::Shutdown => {}
        }
    }

    /// Tell the mempool, gossip and subscribers about new canonical blocks
    async fn after_commits(
        &mut self,
        commits: &[CommitInfo],
        reorg_depth: Option<u64>,
        reverted: Vec<Transaction>,
    ) {
        for info in commits {
            if let Err(e) = self
                .mempool
                .remove(info.included.clone(), info.senders.clone())
                .await
            {
                tracing::warn!("Failed to prune mempool after block {}: {}", info.index, e);
            }
            if let (Some(gossip), Some(cid)) = (&self.gossip, info.cid) {
                if let Err(e) = gossip.enqueue(cid) {
                    tracing::warn!("Block {} not queued for gossip: {}", info.index, e);
                }
            }
            // No subscribers is fine
            let _ = self.updates.send(BlockUpdate::from_commit(info, reorg_depth));
        }

        let returned = reverted.len();
        for tx in reverted {
            if let Err(e) = self.mempool.add(tx).await {
                tracing::debug!("Reverted transaction not readmitted: {}", e);
            }
        }
        if returned > 0 {
            tracing::info!("Returned {} reverted transactions to the mempool", returned);
        }
    }

    fn on_error(&mut self, action: &str, error: ConsensusError) {
        if error.is_fatal() {
            self.halted.store(true, Ordering::SeqCst);
            tracing::error!("Engine halted during {}: {}", action, error);
        } else {
            tracing::warn!("Engine {} failed: {}", action, error);
        }
    }
}
