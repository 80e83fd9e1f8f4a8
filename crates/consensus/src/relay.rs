//! Block relay - turns gossip announcements into imported blocks
//!
//! ```text
//! peer ──Announce{cids}──► relay ──Fetch{cid}──► peer
//! peer ──Blob{cid,bytes}─► relay ──► blob store ──► engine.import_block
//! peer ──Fetch{cid}──────► relay ──Blob{cid,bytes}──► peer
//! peer ──Heartbeat───────► relay ──GetBlocks{from,count}──► peer   (peer is heavier)
//! peer ──GetBlocks───────► relay ──Blob per canonical block──► peer
//! ```
//!
//! A blob is only trusted once its bytes hash to the announced content id.
//! Blocks whose parent is unknown wait in an orphan pool while the relay asks
//! the sender for the heights below; each import releases the orphans that
//! build on it.

use crate::error::ConsensusError;
use crate::service::EngineHandle;
use crate::transport::{Inbound, PeerId, PeerTransport};
use crate::types::{GossipMessage, ImportOutcome};
use parking_lot::RwLock;
use powchain_codec::{sha256, Block, Canonical, H256};
use powchain_runtime::{BlobStore, Cid};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Upper bound on outstanding fetches
const MAX_PENDING_FETCHES: usize = 4096;

/// Most blocks asked for, or served, per `GetBlocks`
pub const SYNC_BATCH: u64 = 64;

/// Upper bound on blocks waiting for their parent
const MAX_ORPHANS: usize = 1024;

/// Orphans this far below the local tip are given up on
const ORPHAN_HORIZON: u64 = 128;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    pub announcements_received: u64,
    pub fetches_sent: u64,
    pub blobs_served: u64,
    pub blobs_received: u64,
    /// Blobs whose bytes did not match their content id, or did not decode
    pub invalid_blobs: u64,
    pub blocks_imported: u64,
    pub blocks_rejected: u64,
    pub heartbeats_received: u64,
    /// `GetBlocks` requests sent to peers
    pub sync_requests: u64,
    /// Blocks parked because their parent was unknown
    pub orphans_queued: u64,
    pub orphans_dropped: u64,
}

/// Blocks waiting for an unknown parent, keyed by that parent's hash
#[derive(Debug, Default)]
struct OrphanPool {
    by_parent: HashMap<H256, Vec<(Block, Vec<u8>)>>,
    hashes: HashSet<H256>,
}

impl OrphanPool {
    fn len(&self) -> usize {
        self.hashes.len()
    }

    fn contains(&self, hash: &H256) -> bool {
        self.hashes.contains(hash)
    }

    /// Park a block. Refuses duplicates and anything past capacity.
    fn insert(&mut self, block: Block, bytes: Vec<u8>) -> bool {
        if self.hashes.len() >= MAX_ORPHANS || !self.hashes.insert(block.hash()) {
            return false;
        }
        self.by_parent
            .entry(block.header.previous_hash)
            .or_default()
            .push((block, bytes));
        true
    }

    /// Release every orphan whose parent is `parent`
    fn take_children(&mut self, parent: &H256) -> Vec<(Block, Vec<u8>)> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        for (block, _) in &children {
            self.hashes.remove(&block.hash());
        }
        children
    }

    /// Drop orphans at or below `height`. Returns how many went.
    fn prune(&mut self, height: u64) -> usize {
        let before = self.hashes.len();
        let hashes = &mut self.hashes;
        self.by_parent.retain(|_, children| {
            children.retain(|(block, _)| {
                let keep = block.header.index > height;
                if !keep {
                    hashes.remove(&block.hash());
                }
                keep
            });
            !children.is_empty()
        });
        before - self.hashes.len()
    }
}

pub struct BlockRelay {
    transport: Arc<dyn PeerTransport>,
    blobs: Arc<dyn BlobStore>,
    engine: EngineHandle,
    /// Content ids requested and not yet answered
    pending: HashSet<Cid>,
    orphans: OrphanPool,
    /// Latest tip height each peer reported
    peer_heights: HashMap<PeerId, u64>,
    heartbeat_interval: Duration,
    stats: Arc<RwLock<RelayStats>>,
}

impl BlockRelay {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        blobs: Arc<dyn BlobStore>,
        engine: EngineHandle,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            transport,
            blobs,
            engine,
            pending: HashSet::new(),
            orphans: OrphanPool::default(),
            peer_heights: HashMap::new(),
            heartbeat_interval,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    /// Shared view of the relay counters
    pub fn stats_handle(&self) -> Arc<RwLock<RelayStats>> {
        self.stats.clone()
    }

    /// Heights peers reported in their heartbeats
    pub fn peer_heights(&self) -> &HashMap<PeerId, u64> {
        &self.peer_heights
    }

    /// Process inbound messages until the transport closes the channel
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        heartbeat.tick().await;

        tracing::info!("Block relay started");
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some((peer, bytes)) => self.handle(peer, &bytes).await,
                    None => break,
                },
                _ = heartbeat.tick() => self.send_heartbeat().await,
            }
        }
        tracing::info!("Block relay stopped");
    }

    /// Handle one raw message from `peer`
    pub async fn handle(&mut self, peer: PeerId, bytes: &[u8]) {
        let message = match GossipMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Undecodable message from {}: {}", peer, e);
                return;
            }
        };

        match message {
            GossipMessage::Announce { cids } => self.on_announce(peer, cids).await,
            GossipMessage::Fetch { cid } => self.on_fetch(peer, cid).await,
            GossipMessage::Blob { cid, bytes } => self.on_blob(peer, cid, bytes).await,
            GossipMessage::Heartbeat {
                height,
                cumulative_work,
            } => self.on_heartbeat(peer, height, cumulative_work).await,
            GossipMessage::GetBlocks { from, count } => self.on_get_blocks(peer, from, count).await,
        }
    }

    async fn on_announce(&mut self, peer: PeerId, cids: Vec<Cid>) {
        self.stats.write().announcements_received += 1;
        for cid in cids {
            if self.blobs.get(&cid).is_ok() || self.pending.contains(&cid) {
                continue;
            }
            if self.pending.len() >= MAX_PENDING_FETCHES {
                tracing::warn!("Too many outstanding fetches, ignoring {}", cid.short());
                break;
            }
            let request = GossipMessage::Fetch { cid }.to_bytes();
            match self
                .transport
                .broadcast(std::slice::from_ref(&peer), request)
                .await
            {
                Ok(1) => {
                    self.pending.insert(cid);
                    self.stats.write().fetches_sent += 1;
                }
                Ok(_) => tracing::debug!("Peer {} unreachable for fetch", peer),
                Err(e) => tracing::warn!("Fetch of {} failed: {}", cid.short(), e),
            }
        }
    }

    async fn on_fetch(&mut self, peer: PeerId, cid: Cid) {
        let bytes = match self.blobs.get(&cid) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("Cannot serve {} to {}: {}", cid.short(), peer, e);
                return;
            }
        };
        let reply = GossipMessage::Blob { cid, bytes }.to_bytes();
        match self.transport.broadcast(&[peer], reply).await {
            Ok(_) => self.stats.write().blobs_served += 1,
            Err(e) => tracing::warn!("Serving {} failed: {}", cid.short(), e),
        }
    }

    async fn on_blob(&mut self, peer: PeerId, cid: Cid, bytes: Vec<u8>) {
        self.stats.write().blobs_received += 1;
        if !self.pending.remove(&cid) {
            tracing::trace!("Unrequested blob {} from {}", cid.short(), peer);
        }
        if sha256(&[&bytes]) != cid {
            tracing::warn!("Blob from {} does not match content id {}", peer, cid.short());
            self.stats.write().invalid_blobs += 1;
            return;
        }
        let block = match Block::decode(&bytes) {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!("Blob {} from {} is not a block: {}", cid.short(), peer, e);
                self.stats.write().invalid_blobs += 1;
                return;
            }
        };
        self.import(&peer, block, bytes).await;
    }

    /// Import a block, then any orphans it releases
    async fn import(&mut self, peer: &PeerId, block: Block, bytes: Vec<u8>) {
        let mut queue = vec![(block, bytes)];
        while let Some((block, bytes)) = queue.pop() {
            let hash = block.hash();
            let index = block.header.index;
            match self.engine.import_block(block.clone()).await {
                Ok(outcome) => {
                    if !matches!(outcome, ImportOutcome::AlreadyKnown) {
                        if let Err(e) = self.blobs.put(&bytes) {
                            tracing::warn!("Failed to keep block {}: {}", index, e);
                        }
                        self.stats.write().blocks_imported += 1;
                        tracing::debug!("Block {} from {}: {}", index, peer, outcome_kind(&outcome));
                    }
                    queue.extend(self.orphans.take_children(&hash));
                }
                Err(ConsensusError::UnknownParent { parent, .. }) => {
                    // Already walking back if the parent is itself parked
                    let walking = self.orphans.contains(&parent);
                    if self.orphans.insert(block, bytes) {
                        self.stats.write().orphans_queued += 1;
                        tracing::debug!(
                            "Block {} from {} waits for parent {}",
                            index,
                            peer,
                            parent.short()
                        );
                    } else if self.orphans.len() >= MAX_ORPHANS {
                        self.stats.write().orphans_dropped += 1;
                        tracing::warn!("Orphan pool full, dropping block {} from {}", index, peer);
                    }
                    if !walking {
                        let from = index.saturating_sub(SYNC_BATCH).max(1);
                        self.request_blocks(peer, from, index.saturating_sub(from)).await;
                    }
                }
                Err(e) => {
                    self.stats.write().blocks_rejected += 1;
                    tracing::warn!("Block {} from {} rejected: {}", index, peer, e);
                }
            }
        }
    }

    /// Catch up with a peer whose chain carries more work than ours
    async fn on_heartbeat(&mut self, peer: PeerId, height: u64, cumulative_work: u64) {
        self.stats.write().heartbeats_received += 1;
        self.peer_heights.insert(peer.clone(), height);

        let Ok(tip) = self.engine.tip().await else {
            return;
        };
        let dropped = self.orphans.prune(tip.index.saturating_sub(ORPHAN_HORIZON));
        if dropped > 0 {
            self.stats.write().orphans_dropped += dropped as u64;
        }
        if cumulative_work <= tip.cumulative_work {
            return;
        }

        // Above our tip when the peer is taller; otherwise its tip, and the
        // orphan walk finds where the chains meet
        let from = tip.index.saturating_add(1).min(height).max(1);
        let count = height.saturating_add(1).saturating_sub(from).min(SYNC_BATCH);
        tracing::debug!(
            "Peer {} is heavier ({} vs {}), asking for {} blocks from {}",
            peer,
            cumulative_work,
            tip.cumulative_work,
            count,
            from
        );
        self.request_blocks(&peer, from, count).await;
    }

    async fn on_get_blocks(&mut self, peer: PeerId, from: u64, count: u64) {
        let blocks = match self.engine.canonical_blocks(from, count.min(SYNC_BATCH)).await {
            Ok(blocks) => blocks,
            Err(e) => {
                tracing::debug!("Cannot serve blocks from {} to {}: {}", from, peer, e);
                return;
            }
        };
        for block in blocks {
            let bytes = block.encode();
            let cid = sha256(&[&bytes]);
            let reply = GossipMessage::Blob { cid, bytes }.to_bytes();
            match self.transport.broadcast(std::slice::from_ref(&peer), reply).await {
                Ok(1) => self.stats.write().blobs_served += 1,
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!("Serving block {} to {} failed: {}", block.header.index, peer, e);
                    break;
                }
            }
        }
    }

    async fn request_blocks(&self, peer: &PeerId, from: u64, count: u64) {
        if count == 0 {
            return;
        }
        let request = GossipMessage::GetBlocks { from, count }.to_bytes();
        match self.transport.broadcast(std::slice::from_ref(peer), request).await {
            Ok(1) => self.stats.write().sync_requests += 1,
            Ok(_) => tracing::debug!("Peer {} unreachable for sync", peer),
            Err(e) => tracing::warn!("Sync request to {} failed: {}", peer, e),
        }
    }

    async fn send_heartbeat(&self) {
        let tip = match self.engine.tip().await {
            Ok(tip) => tip,
            Err(_) => return,
        };
        let peers: Vec<PeerId> = match self.transport.list_peers().await {
            Ok(peers) => peers.into_iter().map(|p| p.id).collect(),
            Err(e) => {
                tracing::debug!("Heartbeat skipped: {}", e);
                return;
            }
        };
        if peers.is_empty() {
            return;
        }
        let payload = GossipMessage::Heartbeat {
            height: tip.index,
            cumulative_work: tip.cumulative_work,
        }
        .to_bytes();
        if let Err(e) = self.transport.broadcast(&peers, payload).await {
            tracing::debug!("Heartbeat failed: {}", e);
        }
    }
}

fn outcome_kind(outcome: &ImportOutcome) -> &'static str {
    match outcome {
        ImportOutcome::Extended(_) => "extended",
        ImportOutcome::SideChain { .. } => "side chain",
        ImportOutcome::Reorganized { .. } => "reorganized",
        ImportOutcome::AlreadyKnown => "known",
    }
}
