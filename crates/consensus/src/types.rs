//! Core types for block production and dissemination

use crate::slashing::SlashingConfig;
use borsh::{BorshDeserialize, BorshSerialize};
use powchain_codec::{Account, Address, Transaction, H256};
use powchain_runtime::{duration_secs, BlockLimits, Cid, FeeSplit};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coupling and damping constant of the gossip cadence (1/√2)
pub const GOSSIP_COUPLING: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Base period the gossip interval is derived from
pub const GOSSIP_BASE_PERIOD: Duration = Duration::from_secs(10);

/// `10s / λ ≈ 14.14s`
pub fn default_gossip_interval() -> Duration {
    GOSSIP_BASE_PERIOD.div_f64(GOSSIP_COUPLING)
}

/// Consensus engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time between proposer slots
    #[serde(with = "duration_secs")]
    pub slot_interval: Duration,
    pub max_block_gas: u64,
    pub max_block_bytes: usize,
    pub max_txs_per_block: usize,
    /// Deepest reorganization the engine will perform
    pub max_reorg_depth: u64,
    /// Receives the treasury share of every block's fees
    pub treasury: Address,
    /// Replicas requested when pinning a committed block
    pub pin_quorum: usize,
    /// Genesis header timestamp (unix millis)
    pub genesis_timestamp: u64,
    /// Balances created at genesis
    pub genesis_allocations: Vec<Account>,
    pub slashing: SlashingConfig,
    /// Command queue depth of the engine worker
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_interval: Duration::from_secs(2),
            max_block_gas: powchain_runtime::MAX_BLOCK_GAS,
            max_block_bytes: powchain_runtime::MAX_BLOCK_BYTES,
            max_txs_per_block: powchain_runtime::MAX_TXS_PER_BLOCK,
            max_reorg_depth: 32,
            treasury: H256::zero(),
            pin_quorum: 1,
            genesis_timestamp: 0,
            genesis_allocations: Vec::new(),
            slashing: SlashingConfig::default(),
            queue_depth: 256,
        }
    }
}

impl EngineConfig {
    pub fn block_limits(&self) -> BlockLimits {
        BlockLimits {
            max_gas: self.max_block_gas,
            max_bytes: self.max_block_bytes,
            max_txs: self.max_txs_per_block,
        }
    }
}

/// Gossip scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Queue drain and announce cadence
    #[serde(with = "duration_secs")]
    pub broadcast_interval: Duration,
    /// Peer liveness refresh cadence
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
    /// Cleanup runs every `cleanup_multiplier` refresh intervals
    pub cleanup_multiplier: u32,
    /// Peers addressed per announcement
    pub fanout: usize,
    /// Content ids per announcement
    pub max_batch: usize,
    /// Pending content id capacity
    pub queue_depth: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: default_gossip_interval(),
            refresh_interval: default_gossip_interval(),
            cleanup_multiplier: 5,
            fanout: 8,
            max_batch: 256,
            queue_depth: 4096,
        }
    }
}

impl GossipConfig {
    pub fn cleanup_interval(&self) -> Duration {
        self.refresh_interval * self.cleanup_multiplier.max(1)
    }
}

/// Where the engine is in its per-height cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum EngineState {
    #[default]
    Idle,
    ProposingSlot,
    AssemblingBlock,
    Committed,
    ForkDetected,
    Reorganizing,
}

/// A block that became part of the canonical chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub index: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub cumulative_work: u64,
    /// Blob store id of the block's canonical bytes
    pub cid: Option<Cid>,
    /// Hashes of the included transactions
    pub included: Vec<H256>,
    /// Senders whose nonces moved
    pub senders: Vec<Address>,
    pub fees: FeeSplit,
}

/// What importing a peer block did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The block extended the canonical tip
    Extended(CommitInfo),
    /// Valid but on a lighter branch; kept for a later reorganization
    SideChain { index: u64, hash: H256 },
    /// The block's branch outweighed the canonical chain
    Reorganized {
        depth: u64,
        committed: Vec<CommitInfo>,
        /// Transactions from reverted blocks that the new branch lacks
        reverted: Vec<Transaction>,
    },
    AlreadyKnown,
}

/// Block update event sent to subscribers
#[derive(Debug, Clone)]
pub struct BlockUpdate {
    pub index: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub cid: Option<Cid>,
    pub transaction_count: usize,
    pub cumulative_work: u64,
    /// Set when the update came from a reorganization
    pub reorg_depth: Option<u64>,
}

impl BlockUpdate {
    pub fn from_commit(info: &CommitInfo, reorg_depth: Option<u64>) -> Self {
        Self {
            index: info.index,
            hash: info.hash,
            parent_hash: info.parent_hash,
            cid: info.cid,
            transaction_count: info.included.len(),
            cumulative_work: info.cumulative_work,
            reorg_depth,
        }
    }
}

/// Stats about block production
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsensusStats {
    pub height: u64,
    pub tip_hash: String,
    pub cumulative_work: u64,
    pub state: EngineState,
    pub blocks_proposed: u64,
    pub blocks_imported: u64,
    pub proofs_included: u64,
    pub side_blocks: usize,
    pub reorgs: u64,
    pub deepest_reorg: u64,
    pub total_fees: u64,
    pub total_burned: u64,
    pub slashing_records: usize,
    pub halted: bool,
}

/// Stats about dissemination
#[derive(Debug, Clone, Default, Serialize)]
pub struct GossipStats {
    /// Content ids waiting for the next broadcast tick
    pub queued: usize,
    pub enqueued: u64,
    /// Content ids refused because the queue was full
    pub dropped: u64,
    pub broadcast_ticks: u64,
    pub announcements_sent: u64,
    pub cids_sent: u64,
    pub send_failures: u64,
    pub refreshes_completed: u64,
    pub peers_known: usize,
    pub peers_evicted: u64,
    /// Broadcast ticks per completed refresh; drifts from 1.0 when either
    /// cadence is starved or misconfigured
    pub broadcast_refresh_ratio: Option<f64>,
}

impl GossipStats {
    pub fn ratio(&self) -> Option<f64> {
        if self.refreshes_completed == 0 {
            return None;
        }
        Some(self.broadcast_ticks as f64 / self.refreshes_completed as f64)
    }
}

/// Message types on the peer network
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum GossipMessage {
    /// New content ids are available
    Announce { cids: Vec<Cid> },
    /// Ask the receiver for a blob it announced
    Fetch { cid: Cid },
    /// Answer to `Fetch` or `GetBlocks`
    Blob { cid: Cid, bytes: Vec<u8> },
    /// Keepalive carrying the sender's tip
    Heartbeat { height: u64, cumulative_work: u64 },
    /// Ask for up to `count` canonical blocks starting at height `from`
    GetBlocks { from: u64, count: u64 },
}

impl GossipMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("GossipMessage serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}
