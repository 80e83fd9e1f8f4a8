//! Consensus engine - the only writer of chain state
//!
//! ```text
//! Idle ─► ProposingSlot ─► AssemblingBlock ─► Committed ─┐
//!            ▲                                           │ height + 1
//!            └───────────────────────────────────────────┘
//! (any) ─► ForkDetected ─► Reorganizing ─► Committed
//! ```
//!
//! Every state change reaches the store as one `StateBatch`. The engine keeps
//! an undo record per recent canonical block so a heavier branch can replace
//! up to `max_reorg_depth` blocks in a single commit.

use crate::error::ConsensusError;
use crate::fork_choice::{prefers, ChainHead};
use crate::schedule::ValidatorSet;
use crate::slashing::SlashingLedger;
use crate::types::{CommitInfo, ConsensusStats, EngineConfig, EngineState, ImportOutcome};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use powchain_admission::{
    verify_reveal_with, work_score_for, AdmittedProof, BinderConfig, CommitmentBinder,
    ReferenceSolver, Solver, TierLimiter,
};
use powchain_codec::{
    address_of, check_equivalence, merkle_root, Account, Address, Block, BlockHeader, Canonical,
    Tier, Transaction, H256,
};
use powchain_runtime::{
    execute_block, AccountOverlay, BlobStore, BlockEffects, BlockLimits, ChainMetadata, ChainStore,
    Cid, ExecutionMode, MemoryBlobStore, StateBatch,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// What it takes to take a canonical block back off the chain
#[derive(Debug, Clone)]
struct UndoRecord {
    block: Block,
    /// Pre-block values of every touched account
    accounts: Vec<Account>,
    burned: u64,
    fees: u64,
}

/// Where an imported block's parent lives
enum Parent {
    Tip,
    Elsewhere(BlockHeader),
}

/// Genesis block for a configuration. The merkle root commits to the
/// initial allocations so differently funded chains never share a genesis.
pub fn genesis_block(config: &EngineConfig) -> Block {
    let leaves: Vec<H256> = config
        .genesis_allocations
        .iter()
        .map(Canonical::hash)
        .collect();
    Block {
        header: BlockHeader {
            index: 0,
            timestamp: config.genesis_timestamp,
            previous_hash: H256::zero(),
            merkle_root: merkle_root(&leaves),
            problem_commitment: None,
            work_score: 1,
            cumulative_work: 1,
            tier: Tier::Tier1,
        },
        proposer: H256::zero(),
        transactions: Vec::new(),
        proof: None,
        signature: Vec::new(),
    }
}

pub struct ConsensusEngine<S> {
    identity: SigningKey,
    address: Address,
    schedule: ValidatorSet,
    store: Arc<S>,
    binder: Arc<CommitmentBinder>,
    solver: Arc<dyn Solver>,
    blobs: Arc<dyn BlobStore>,
    /// Raised on shutdown to cut proof verification short
    abort: Arc<AtomicBool>,
    config: EngineConfig,
    limits: BlockLimits,
    state: EngineState,
    tip: BlockHeader,
    metadata: ChainMetadata,
    /// Best admitted proof for the next height
    best_proof: Option<AdmittedProof>,
    /// Recent canonical blocks, oldest first, ending at the tip
    undo: VecDeque<UndoRecord>,
    /// Valid blocks off the canonical chain
    side_blocks: HashMap<H256, Block>,
    slashing: SlashingLedger,
    stats: ConsensusStats,
    halted: bool,
}

impl<S: ChainStore + 'static> ConsensusEngine<S> {
    pub fn builder() -> ConsensusEngineBuilder<S> {
        ConsensusEngineBuilder::new()
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn tip(&self) -> &BlockHeader {
        &self.tip
    }

    /// Height the next block will have
    pub fn next_height(&self) -> u64 {
        self.tip.index + 1
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn schedule(&self) -> &ValidatorSet {
        &self.schedule
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn binder(&self) -> Arc<CommitmentBinder> {
        self.binder.clone()
    }

    pub fn solver(&self) -> Arc<dyn Solver> {
        self.solver.clone()
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn slashing(&self) -> &SlashingLedger {
        &self.slashing
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_my_slot(&self, height: u64) -> bool {
        self.schedule.proposer(height) == self.address
    }

    pub fn stats(&self) -> ConsensusStats {
        let mut stats = self.stats.clone();
        stats.height = self.tip.index;
        stats.tip_hash = self.tip.hash().to_hex();
        stats.cumulative_work = self.tip.cumulative_work;
        stats.state = self.state;
        stats.side_blocks = self.side_blocks.len();
        stats.total_burned = self.metadata.total_burned;
        stats.slashing_records = self.slashing.records().len();
        stats.halted = self.halted;
        stats
    }

    /// Offer an admitted proof for the next block. Keeps the heaviest one.
    pub fn submit_proof(&mut self, proof: AdmittedProof) -> bool {
        let height = self.next_height();
        if proof.block_index() != height || proof.reveal.problem.parent_hash != self.tip.hash() {
            tracing::debug!(
                "Ignoring proof for height {} (next height {})",
                proof.block_index(),
                height
            );
            return false;
        }
        let better = self
            .best_proof
            .as_ref()
            .map_or(true, |best| proof.work_score > best.work_score);
        if better {
            tracing::debug!(
                "Proof from {} (work {}) queued for height {}",
                proof.reveal.miner.short(),
                proof.work_score,
                height
            );
            self.best_proof = Some(proof);
        }
        better
    }

    /// Assemble, sign and commit the next block from `candidates`.
    ///
    /// Candidates that do not apply are skipped. Nothing reaches the store
    /// unless the whole block commits.
    pub fn propose(
        &mut self,
        candidates: &[Transaction],
        timestamp_ms: u64,
    ) -> Result<CommitInfo, ConsensusError> {
        self.ensure_live()?;
        let height = self.next_height();
        let expected = self.schedule.proposer(height);
        if expected != self.address {
            return Err(ConsensusError::NotProposer {
                height,
                expected,
                got: self.address,
            });
        }
        self.state = EngineState::ProposingSlot;

        let parent_hash = self.tip.hash();
        let proof = self
            .best_proof
            .take()
            .filter(|p| p.block_index() == height && p.reveal.problem.parent_hash == parent_hash);

        self.state = EngineState::AssemblingBlock;
        let store = self.store.clone();
        let mut overlay = AccountOverlay::new(&*store);
        let effects = match execute_block(
            &mut overlay,
            candidates,
            &self.address,
            &self.config.treasury,
            &self.limits,
            ExecutionMode::Assemble,
        ) {
            Ok(effects) => effects,
            Err(e) => {
                self.state = EngineState::Committed;
                return Err(e.into());
            }
        };

        let leaves: Vec<H256> = effects.included.iter().map(|tx| tx.hash()).collect();
        let (commitment, work_score, tier) = match &proof {
            Some(p) => (
                Some(p.reveal.commitment),
                p.work_score,
                p.reveal.problem.tier,
            ),
            None => (None, 1, Tier::Tier1),
        };
        let cumulative_work = self
            .tip
            .cumulative_work
            .checked_add(work_score)
            .ok_or_else(|| ConsensusError::InvalidBlock("cumulative work overflow".into()))?;

        let header = BlockHeader {
            index: height,
            timestamp: timestamp_ms.max(self.tip.timestamp),
            previous_hash: parent_hash,
            merkle_root: merkle_root(&leaves),
            problem_commitment: commitment,
            work_score,
            cumulative_work,
            tier,
        };
        let hash = match check_equivalence(&header) {
            Ok(hash) => hash,
            Err(e) => return Err(self.halt(format!("header {} hashes differ across wire forms: {}", height, e))),
        };

        let signature = self.identity.sign(&Block::signing_bytes(&hash));
        let block = Block {
            header,
            proposer: self.address,
            transactions: effects.included.clone(),
            proof: proof.map(|p| p.reveal),
            signature: signature.to_bytes().to_vec(),
        };
        if let Err(e) = check_equivalence(&block) {
            return Err(self.halt(format!("block {} encodings diverge: {}", height, e)));
        }

        let accounts = overlay.into_accounts();
        let info = self.commit_extension(block, accounts, &effects)?;
        self.stats.blocks_proposed += 1;

        tracing::info!(
            "Proposed block {} ({}) | {} txs | {} rejected | fees {}",
            info.index,
            info.hash.short(),
            info.included.len(),
            effects.rejected.len(),
            effects.total_fees
        );
        Ok(info)
    }

    /// Validate a peer's block and apply fork choice
    pub fn import_block(&mut self, block: Block) -> Result<ImportOutcome, ConsensusError> {
        self.ensure_live()?;
        let hash = match check_equivalence(&block.header) {
            Ok(hash) => hash,
            Err(e) => return Err(self.halt(format!("imported header encodings diverge: {}", e))),
        };
        let index = block.header.index;

        if self.side_blocks.contains_key(&hash) || self.is_canonical(&hash, index)? {
            return Ok(ImportOutcome::AlreadyKnown);
        }
        if index == 0 {
            return Err(ConsensusError::InvalidBlock("genesis cannot be imported".into()));
        }

        self.validate_block(&block, &hash)?;

        let parent = self.find_parent(&block)?;
        let parent_header = match &parent {
            Parent::Tip => self.tip.clone(),
            Parent::Elsewhere(header) => header.clone(),
        };
        check_linkage(&parent_header, &block)?;

        match parent {
            Parent::Tip => {
                let store = self.store.clone();
                let mut overlay = AccountOverlay::new(&*store);
                let effects = execute_block(
                    &mut overlay,
                    &block.transactions,
                    &block.proposer,
                    &self.config.treasury,
                    &self.limits,
                    ExecutionMode::Import,
                )?;
                let accounts = overlay.into_accounts();
                let info = self.commit_extension(block, accounts, &effects)?;
                self.stats.blocks_imported += 1;
                tracing::info!(
                    "Imported block {} ({}) | {} txs",
                    info.index,
                    info.hash.short(),
                    info.included.len()
                );
                Ok(ImportOutcome::Extended(info))
            }
            Parent::Elsewhere(_) => {
                let head = ChainHead::of(&block.header);
                self.side_blocks.insert(hash, block);
                self.state = EngineState::ForkDetected;

                let current = ChainHead::of(&self.tip);
                if !prefers(&head, &current) {
                    tracing::debug!(
                        "Side block {} ({}) with work {} kept; canonical work {}",
                        index,
                        hash.short(),
                        head.cumulative_work,
                        current.cumulative_work
                    );
                    self.state = EngineState::Committed;
                    return Ok(ImportOutcome::SideChain { index, hash });
                }

                let (ancestor, branch) = self.branch_to(hash)?;
                match self.reorganize(ancestor, branch) {
                    Ok(outcome) => Ok(outcome),
                    Err(e) => {
                        if !e.is_fatal() {
                            self.side_blocks.remove(&hash);
                            self.state = EngineState::Committed;
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Signature, slot, merkle root and proof checks
    fn validate_block(&mut self, block: &Block, hash: &H256) -> Result<(), ConsensusError> {
        let index = block.header.index;
        if !block.verify_signature(hash) {
            return Err(ConsensusError::InvalidBlock(format!(
                "block {} has an invalid proposer signature",
                index
            )));
        }

        let expected = self.schedule.proposer(index);
        if block.proposer != expected {
            if self.schedule.contains(&block.proposer) {
                self.slashing
                    .record_out_of_slot(index, block.proposer, expected, *hash);
            }
            return Err(ConsensusError::NotProposer {
                height: index,
                expected,
                got: block.proposer,
            });
        }
        self.slashing.observe_proposal(index, block.proposer, *hash);

        let leaves: Vec<H256> = block.transactions.iter().map(|tx| tx.hash()).collect();
        if merkle_root(&leaves) != block.header.merkle_root {
            return Err(ConsensusError::InvalidBlock(format!(
                "block {} merkle root does not match its transactions",
                index
            )));
        }

        let header = &block.header;
        match &block.proof {
            Some(reveal) => {
                let problem = &reveal.problem;
                if header.problem_commitment != Some(reveal.commitment) {
                    return Err(ConsensusError::InvalidBlock(
                        "header commitment does not match the carried proof".into(),
                    ));
                }
                if problem.block_index != index || problem.parent_hash != header.previous_hash {
                    return Err(ConsensusError::InvalidBlock(format!(
                        "proof targets height {} but block is {}",
                        problem.block_index, index
                    )));
                }
                if problem.tier != header.tier || header.work_score != work_score_for(problem.size)
                {
                    return Err(ConsensusError::InvalidBlock(
                        "header tier or work score does not match the proof".into(),
                    ));
                }
                verify_reveal_with(
                    self.binder.limiter(),
                    reveal,
                    self.solver.as_ref(),
                    Some(self.abort.clone()),
                )?;
            }
            None => {
                if header.problem_commitment.is_some()
                    || header.work_score != 1
                    || header.tier != Tier::Tier1
                {
                    return Err(ConsensusError::InvalidBlock(
                        "block without a proof must have work score 1".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn find_parent(&self, block: &Block) -> Result<Parent, ConsensusError> {
        let previous = block.header.previous_hash;
        if previous == self.tip.hash() {
            return Ok(Parent::Tip);
        }
        let parent_index = block.header.index - 1;
        if parent_index < self.tip.index {
            if let Some(parent) = self.store.get_block(parent_index)? {
                if parent.hash() == previous {
                    return Ok(Parent::Elsewhere(parent.header));
                }
            }
        }
        match self.side_blocks.get(&previous) {
            Some(parent) => Ok(Parent::Elsewhere(parent.header.clone())),
            None => Err(ConsensusError::UnknownParent {
                index: block.header.index,
                parent: previous,
            }),
        }
    }

    /// Up to `count` canonical blocks from height `from`, in height order
    pub fn canonical_blocks(&self, from: u64, count: u64) -> Result<Vec<Block>, ConsensusError> {
        let end = from.saturating_add(count).min(self.tip.index.saturating_add(1));
        let mut blocks = Vec::new();
        for index in from..end {
            match self.store.get_block(index)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    fn is_canonical(&self, hash: &H256, index: u64) -> Result<bool, ConsensusError> {
        if index > self.tip.index {
            return Ok(false);
        }
        if index == self.tip.index {
            return Ok(*hash == self.tip.hash());
        }
        Ok(self
            .store
            .get_block(index)?
            .map_or(false, |b| b.hash() == *hash))
    }

    /// Side blocks from the canonical fork point up to `head`, oldest first
    fn branch_to(&self, head: H256) -> Result<(u64, Vec<Block>), ConsensusError> {
        let mut branch = Vec::new();
        let mut cursor = head;
        loop {
            let block = self
                .side_blocks
                .get(&cursor)
                .ok_or(ConsensusError::UnknownParent {
                    index: branch.last().map_or(0, |b: &Block| b.header.index - 1),
                    parent: cursor,
                })?;
            branch.push(block.clone());
            let parent_index = block.header.index - 1;
            if self.is_canonical(&block.header.previous_hash, parent_index)? {
                branch.reverse();
                return Ok((parent_index, branch));
            }
            cursor = block.header.previous_hash;
        }
    }

    /// Replace the canonical blocks above `ancestor` with `branch`
    fn reorganize(
        &mut self,
        ancestor: u64,
        branch: Vec<Block>,
    ) -> Result<ImportOutcome, ConsensusError> {
        let depth = self.tip.index - ancestor;
        let retained = self.undo.len() as u64;
        if depth > self.config.max_reorg_depth || depth > retained {
            return Err(ConsensusError::ReorgTooDeep {
                depth,
                max: self.config.max_reorg_depth.min(retained),
            });
        }
        self.state = EngineState::Reorganizing;
        tracing::warn!(
            "Reorganizing: reverting {} blocks above {} for a {}-block branch",
            depth,
            ancestor,
            branch.len()
        );

        let start = self.undo.len() - depth as usize;
        let store = self.store.clone();
        let mut overlay = AccountOverlay::new(&*store);
        let mut burned = self.metadata.total_burned;
        for record in self.undo.iter().skip(start).rev() {
            overlay.restore(&record.accounts);
            burned = burned.saturating_sub(record.burned);
        }

        let mut applied = Vec::with_capacity(branch.len());
        for block in &branch {
            let effects = execute_block(
                &mut overlay,
                &block.transactions,
                &block.proposer,
                &self.config.treasury,
                &self.limits,
                ExecutionMode::Import,
            )?;
            burned = burned.saturating_add(effects.split.burn);
            applied.push(effects);
        }

        let head = match branch.last() {
            Some(block) => block.header.clone(),
            None => return Err(ConsensusError::InvalidBlock("empty branch".into())),
        };
        let metadata = ChainMetadata {
            height: head.index,
            tip_hash: head.hash().0,
            cumulative_work: head.cumulative_work,
            total_burned: burned,
            last_save_ts: Utc::now().timestamp(),
        };
        self.store.commit(&StateBatch {
            truncate_above: Some(ancestor),
            accounts: overlay.into_accounts(),
            append: branch.clone(),
            metadata: metadata.clone(),
        })?;

        let reverted_records: Vec<UndoRecord> = self.undo.split_off(start).into();
        let adopted: HashSet<H256> = branch
            .iter()
            .flat_map(|b| b.transactions.iter().map(Transaction::hash))
            .collect();
        let mut reverted = Vec::new();
        for record in reverted_records {
            self.stats.total_fees = self.stats.total_fees.saturating_sub(record.fees);
            reverted.extend(
                record
                    .block
                    .transactions
                    .iter()
                    .filter(|tx| !adopted.contains(&tx.hash()))
                    .cloned(),
            );
            self.side_blocks.insert(record.block.hash(), record.block);
        }

        let mut committed = Vec::with_capacity(branch.len());
        for (block, effects) in branch.into_iter().zip(applied) {
            self.side_blocks.remove(&block.hash());
            committed.push(self.record_commit(block, &effects));
        }
        self.stats.reorgs += 1;
        self.stats.deepest_reorg = self.stats.deepest_reorg.max(depth);
        self.stats.blocks_imported += committed.len() as u64;
        self.advance_tip(head, metadata);

        tracing::info!(
            "Reorganized to block {} ({}); {} transactions returned to the pool",
            self.tip.index,
            self.tip.hash().short(),
            reverted.len()
        );
        Ok(ImportOutcome::Reorganized {
            depth,
            committed,
            reverted,
        })
    }

    /// Commit a block on top of the tip
    fn commit_extension(
        &mut self,
        block: Block,
        accounts: Vec<Account>,
        effects: &BlockEffects,
    ) -> Result<CommitInfo, ConsensusError> {
        let index = block.header.index;
        let hash = block.hash();
        if let Some(existing) = self.store.get_block(index)? {
            if existing.hash() != hash {
                self.state = EngineState::Committed;
                return Err(self.halt(format!(
                    "block {} already committed as {}, refusing {}",
                    index,
                    existing.hash().short(),
                    hash.short()
                )));
            }
        }

        let metadata = ChainMetadata {
            height: index,
            tip_hash: hash.0,
            cumulative_work: block.header.cumulative_work,
            total_burned: self.metadata.total_burned.saturating_add(effects.split.burn),
            last_save_ts: Utc::now().timestamp(),
        };
        if let Err(e) = self.store.commit(&StateBatch {
            truncate_above: None,
            accounts,
            append: vec![block.clone()],
            metadata: metadata.clone(),
        }) {
            self.state = EngineState::Committed;
            return Err(e.into());
        }

        let header = block.header.clone();
        let info = self.record_commit(block, effects);
        self.advance_tip(header, metadata);
        Ok(info)
    }

    /// Bookkeeping for a block that is now canonical
    fn record_commit(&mut self, block: Block, effects: &BlockEffects) -> CommitInfo {
        let hash = block.hash();
        self.slashing
            .observe_proposal(block.header.index, block.proposer, hash);
        if block.proof.is_some() {
            self.stats.proofs_included += 1;
        }
        self.stats.total_fees = self.stats.total_fees.saturating_add(effects.total_fees);

        let senders: BTreeSet<Address> = effects.included.iter().map(|tx| tx.sender).collect();
        let info = CommitInfo {
            index: block.header.index,
            hash,
            parent_hash: block.header.previous_hash,
            cumulative_work: block.header.cumulative_work,
            cid: self.publish(&block),
            included: effects.included.iter().map(Transaction::hash).collect(),
            senders: senders.into_iter().collect(),
            fees: effects.split,
        };
        self.undo.push_back(UndoRecord {
            block,
            accounts: effects.undo.clone(),
            burned: effects.split.burn,
            fees: effects.total_fees,
        });
        info
    }

    fn advance_tip(&mut self, tip: BlockHeader, metadata: ChainMetadata) {
        let depth = self.config.max_reorg_depth;
        self.binder.advance_epoch(tip.hash(), tip.index + 1);
        if self
            .best_proof
            .as_ref()
            .map_or(false, |p| p.block_index() != tip.index + 1 || p.reveal.problem.parent_hash != tip.hash())
        {
            self.best_proof = None;
        }

        while self.undo.len() as u64 > depth {
            self.undo.pop_front();
        }
        let floor = tip.index.saturating_sub(depth);
        self.side_blocks.retain(|_, b| b.header.index > floor);
        self.slashing.prune(tip.index);

        self.tip = tip;
        self.metadata = metadata;
        self.state = EngineState::Committed;
    }

    /// Put the block's canonical bytes in the blob store and pin them
    fn publish(&self, block: &Block) -> Option<Cid> {
        let bytes = block.encode();
        let cid = match self.blobs.put(&bytes) {
            Ok(cid) => cid,
            Err(e) => {
                tracing::warn!("Failed to store block {}: {}", block.header.index, e);
                return None;
            }
        };
        match self.blobs.pin(&cid, self.config.pin_quorum) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                "Block {} pinned below quorum {}",
                block.header.index,
                self.config.pin_quorum
            ),
            Err(e) => tracing::warn!("Failed to pin block {}: {}", block.header.index, e),
        }
        Some(cid)
    }

    fn ensure_live(&self) -> Result<(), ConsensusError> {
        if self.halted {
            return Err(ConsensusError::Fatal("engine halted".into()));
        }
        Ok(())
    }

    /// Stop accepting work. The chain can no longer be trusted.
    fn halt(&mut self, reason: String) -> ConsensusError {
        tracing::error!("Consensus halted: {}", reason);
        self.halted = true;
        ConsensusError::Fatal(reason)
    }
}

/// Height, time and weight must follow from the parent
fn check_linkage(parent: &BlockHeader, block: &Block) -> Result<(), ConsensusError> {
    let header = &block.header;
    if header.index != parent.index + 1 {
        return Err(ConsensusError::InvalidBlock(format!(
            "block {} does not follow parent {}",
            header.index, parent.index
        )));
    }
    if header.timestamp < parent.timestamp {
        return Err(ConsensusError::InvalidBlock(format!(
            "block {} is older than its parent",
            header.index
        )));
    }
    if Some(header.cumulative_work) != parent.cumulative_work.checked_add(header.work_score) {
        return Err(ConsensusError::InvalidBlock(format!(
            "block {} claims cumulative work {}, parent has {} plus {}",
            header.index, header.cumulative_work, parent.cumulative_work, header.work_score
        )));
    }
    Ok(())
}

/// Load the chain tip, writing genesis into an empty store
fn load_or_init_chain<S: ChainStore>(
    store: &S,
    config: &EngineConfig,
) -> Result<(BlockHeader, ChainMetadata), ConsensusError> {
    if let Some(tip) = store.chain_tip()? {
        let hash = tip.hash();
        let metadata = store
            .load_metadata()?
            .filter(|m| m.tip_hash() == hash)
            .unwrap_or_else(|| ChainMetadata {
                height: tip.index,
                tip_hash: hash.0,
                cumulative_work: tip.cumulative_work,
                ..Default::default()
            });
        tracing::info!(
            "Resuming at block {} ({}), cumulative work {}",
            tip.index,
            hash.short(),
            tip.cumulative_work
        );
        return Ok((tip, metadata));
    }

    let genesis = genesis_block(config);
    let metadata = ChainMetadata {
        height: 0,
        tip_hash: genesis.hash().0,
        cumulative_work: genesis.header.cumulative_work,
        total_burned: 0,
        last_save_ts: Utc::now().timestamp(),
    };
    store.commit(&StateBatch {
        truncate_above: None,
        accounts: config.genesis_allocations.clone(),
        append: vec![genesis.clone()],
        metadata: metadata.clone(),
    })?;
    tracing::info!(
        "Created genesis {} with {} allocations",
        genesis.hash().short(),
        config.genesis_allocations.len()
    );
    Ok((genesis.header, metadata))
}

/// Builder for ConsensusEngine
pub struct ConsensusEngineBuilder<S> {
    identity: Option<SigningKey>,
    validators: Vec<Address>,
    store: Option<Arc<S>>,
    config: EngineConfig,
    binder_config: BinderConfig,
    limiter: TierLimiter,
    solver: Option<Arc<dyn Solver>>,
    blobs: Option<Arc<dyn BlobStore>>,
    abort: Option<Arc<AtomicBool>>,
}

impl<S: ChainStore + 'static> ConsensusEngineBuilder<S> {
    pub fn new() -> Self {
        Self {
            identity: None,
            validators: Vec::new(),
            store: None,
            config: EngineConfig::default(),
            binder_config: BinderConfig::default(),
            limiter: TierLimiter::default(),
            solver: None,
            blobs: None,
            abort: None,
        }
    }

    pub fn identity(mut self, key: SigningKey) -> Self {
        self.identity = Some(key);
        self
    }

    pub fn validators(mut self, validators: Vec<Address>) -> Self {
        self.validators = validators;
        self
    }

    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn binder_config(mut self, config: BinderConfig) -> Self {
        self.binder_config = config;
        self
    }

    pub fn limiter(mut self, limiter: TierLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn solver(mut self, solver: Arc<dyn Solver>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    pub fn build(self) -> Result<ConsensusEngine<S>, ConsensusError> {
        let identity = self
            .identity
            .ok_or_else(|| ConsensusError::Config("validator identity is required".into()))?;
        let store = self
            .store
            .ok_or_else(|| ConsensusError::Config("chain store is required".into()))?;
        let schedule = ValidatorSet::new(self.validators)?;
        let address = address_of(&identity);
        if !schedule.contains(&address) {
            tracing::info!("{} is not in the validator set; following only", address.short());
        }

        let (tip, metadata) = load_or_init_chain(&*store, &self.config)?;
        let binder = Arc::new(CommitmentBinder::new(
            self.binder_config,
            self.limiter,
            tip.hash(),
            tip.index + 1,
        ));

        let stats = ConsensusStats {
            total_burned: metadata.total_burned,
            ..Default::default()
        };

        Ok(ConsensusEngine {
            identity,
            address,
            schedule,
            store,
            binder,
            solver: self.solver.unwrap_or_else(|| Arc::new(ReferenceSolver)),
            blobs: self
                .blobs
                .unwrap_or_else(|| Arc::new(MemoryBlobStore::new())),
            abort: self.abort.unwrap_or_default(),
            limits: self.config.block_limits(),
            slashing: SlashingLedger::new(self.config.slashing.clone()),
            config: self.config,
            state: EngineState::Idle,
            tip,
            metadata,
            best_proof: None,
            undo: VecDeque::new(),
            side_blocks: HashMap::new(),
            stats,
            halted: false,
        })
    }
}

impl<S: ChainStore + 'static> Default for ConsensusEngineBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}
