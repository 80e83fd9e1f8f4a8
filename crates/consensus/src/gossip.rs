//! Gossip scheduler - fixed-cadence dissemination of content ids
//!
//! New CIDs are queued, never sent on arrival. Three independent tasks run
//! on their own intervals:
//! - broadcast: drain up to `max_batch` CIDs and announce them to a random
//!   `fanout` sample of known peers
//! - refresh: pull the transport's peer list and note who has been active
//! - cleanup (every `cleanup_multiplier` refreshes): evict peers not seen by
//!   any refresh since the previous cleanup
//!
//! A tick whose work overruns the interval skips the next tick instead of
//! queueing it.

use crate::transport::{PeerId, PeerInfo, PeerTransport};
use crate::types::{GossipConfig, GossipMessage, GossipStats};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::{Mutex, RwLock};
use powchain_runtime::Cid;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GossipError {
    #[error("gossip queue full")]
    QueueFull,

    #[error("gossip scheduler stopped")]
    Closed,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    last_seen_ms: u64,
    /// Last refresh round that saw fresh activity
    seen_round: u64,
}

/// Refresh rounds an evicted peer may go unlisted before its tombstone is dropped
const TOMBSTONE_ROUNDS: u64 = 3;

#[derive(Debug, Clone)]
struct Tombstone {
    /// Activity at eviction; the peer is readmitted only once it advances
    last_seen_ms: u64,
    /// Last refresh round whose listing still contained the peer
    listed_round: u64,
}

#[derive(Debug, Default)]
struct PeerTable {
    peers: HashMap<PeerId, PeerEntry>,
    round: u64,
    /// Refresh round at the previous cleanup
    cleanup_round: u64,
    evicted: HashMap<PeerId, Tombstone>,
}

impl PeerTable {
    /// A peer counts as seen when it is new or its activity advanced
    fn refresh(&mut self, listing: Vec<PeerInfo>) {
        self.round += 1;
        for info in listing {
            match self.peers.get_mut(&info.id) {
                Some(entry) if info.last_seen_ms > entry.last_seen_ms => {
                    entry.last_seen_ms = info.last_seen_ms;
                    entry.seen_round = self.round;
                }
                Some(_) => {}
                None => {
                    if let Some(tombstone) = self.evicted.get_mut(&info.id) {
                        if info.last_seen_ms <= tombstone.last_seen_ms {
                            tombstone.listed_round = self.round;
                            continue;
                        }
                        self.evicted.remove(&info.id);
                    }
                    self.peers.insert(
                        info.id,
                        PeerEntry {
                            last_seen_ms: info.last_seen_ms,
                            seen_round: self.round,
                        },
                    );
                }
            }
        }
    }

    fn cleanup(&mut self) -> Vec<PeerId> {
        // Without a refresh since the last cleanup there is nothing to judge by
        if self.round == self.cleanup_round {
            return Vec::new();
        }
        let since = self.cleanup_round;
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.seen_round <= since)
            .map(|(id, _)| id.clone())
            .collect();
        let round = self.round;
        self.evicted
            .retain(|_, tombstone| round - tombstone.listed_round < TOMBSTONE_ROUNDS);
        for id in &stale {
            if let Some(entry) = self.peers.remove(id) {
                self.evicted.insert(
                    id.clone(),
                    Tombstone {
                        last_seen_ms: entry.last_seen_ms,
                        listed_round: round,
                    },
                );
            }
        }
        self.cleanup_round = round;
        stale
    }

    fn sample(&self, fanout: usize) -> Vec<PeerId> {
        let ids: Vec<&PeerId> = self.peers.keys().collect();
        ids.choose_multiple(&mut rand::thread_rng(), fanout)
            .map(|id| (*id).clone())
            .collect()
    }
}

struct Shared {
    config: GossipConfig,
    transport: Arc<dyn PeerTransport>,
    queue: Receiver<Cid>,
    /// A batch that could not be sent, retried first on the next tick
    carry: Mutex<Vec<Cid>>,
    peers: Mutex<PeerTable>,
    stats: RwLock<GossipStats>,
    running: AtomicBool,
}

impl Shared {
    fn drain_batch(&self) -> Vec<Cid> {
        let mut batch = std::mem::take(&mut *self.carry.lock());
        while batch.len() < self.config.max_batch {
            match self.queue.try_recv() {
                Ok(cid) => batch.push(cid),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        batch
    }

    async fn broadcast_tick(&self) {
        self.stats.write().broadcast_ticks += 1;
        let batch = self.drain_batch();
        if batch.is_empty() {
            return;
        }

        let peers = self.peers.lock().sample(self.config.fanout);
        if peers.is_empty() {
            tracing::debug!("No peers for {} queued content ids", batch.len());
            *self.carry.lock() = batch;
            return;
        }

        let count = batch.len();
        let payload = GossipMessage::Announce { cids: batch.clone() }.to_bytes();
        match self.transport.broadcast(&peers, payload).await {
            Ok(delivered) => {
                let mut stats = self.stats.write();
                stats.announcements_sent += 1;
                stats.cids_sent += count as u64;
                tracing::debug!(
                    "Announced {} content ids to {}/{} peers",
                    count,
                    delivered,
                    peers.len()
                );
            }
            Err(e) => {
                tracing::warn!("Announcement failed: {}", e);
                self.stats.write().send_failures += 1;
                *self.carry.lock() = batch;
            }
        }
    }

    async fn refresh_tick(&self) {
        match self.transport.list_peers().await {
            Ok(listing) => {
                let known = {
                    let mut table = self.peers.lock();
                    table.refresh(listing);
                    table.peers.len()
                };
                let mut stats = self.stats.write();
                stats.refreshes_completed += 1;
                stats.peers_known = known;
            }
            Err(e) => tracing::warn!("Peer refresh failed: {}", e),
        }
    }

    fn cleanup_tick(&self) {
        let (evicted, known) = {
            let mut table = self.peers.lock();
            let evicted = table.cleanup();
            (evicted, table.peers.len())
        };
        if !evicted.is_empty() {
            tracing::info!("Evicted {} silent peers: {:?}", evicted.len(), evicted);
        }
        let mut stats = self.stats.write();
        stats.peers_evicted += evicted.len() as u64;
        stats.peers_known = known;
    }

    fn snapshot(&self) -> GossipStats {
        let mut stats = self.stats.read().clone();
        stats.queued = self.queue.len() + self.carry.lock().len();
        stats.peers_known = self.peers.lock().peers.len();
        stats.broadcast_refresh_ratio = stats.ratio();
        stats
    }
}

/// Handle for queueing content ids
#[derive(Clone)]
pub struct GossipHandle {
    sender: Sender<Cid>,
    shared: Arc<Shared>,
}

impl GossipHandle {
    /// Queue a content id for the next broadcast tick
    pub fn enqueue(&self, cid: Cid) -> Result<(), GossipError> {
        match self.sender.try_send(cid) {
            Ok(()) => {
                self.shared.stats.write().enqueued += 1;
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.shared.stats.write().dropped += 1;
                tracing::warn!("Gossip queue full, dropping {}", cid.short());
                Err(GossipError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(GossipError::Closed),
        }
    }

    pub fn stats(&self) -> GossipStats {
        self.shared.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

/// Running scheduler tasks
pub struct GossipScheduler {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl GossipScheduler {
    /// Spawn the three periodic tasks on the current runtime
    pub fn start(config: GossipConfig, transport: Arc<dyn PeerTransport>) -> (Self, GossipHandle) {
        let (sender, queue) = bounded(config.queue_depth.max(1));
        let shared = Arc::new(Shared {
            config,
            transport,
            queue,
            carry: Mutex::new(Vec::new()),
            peers: Mutex::new(PeerTable::default()),
            stats: RwLock::new(GossipStats::default()),
            running: AtomicBool::new(true),
        });

        tracing::info!(
            "Gossip scheduler started (broadcast {:.2}s, refresh {:.2}s, cleanup {:.2}s, fanout {})",
            shared.config.broadcast_interval.as_secs_f64(),
            shared.config.refresh_interval.as_secs_f64(),
            shared.config.cleanup_interval().as_secs_f64(),
            shared.config.fanout
        );

        let tasks = vec![
            spawn_periodic(shared.clone(), shared.config.broadcast_interval, |s| async move {
                s.broadcast_tick().await
            }),
            spawn_periodic(shared.clone(), shared.config.refresh_interval, |s| async move {
                s.refresh_tick().await
            }),
            spawn_periodic(shared.clone(), shared.config.cleanup_interval(), |s| async move {
                s.cleanup_tick()
            }),
        ];

        let handle = GossipHandle {
            sender,
            shared: shared.clone(),
        };
        (Self { shared, tasks }, handle)
    }

    pub fn stats(&self) -> GossipStats {
        self.shared.snapshot()
    }

    /// Stop all tasks
    pub fn stop(self) {
        self.shared.running.store(false, Ordering::SeqCst);
        for task in self.tasks {
            task.abort();
        }
        tracing::info!("Gossip scheduler stopped");
    }
}

fn spawn_periodic<F, Fut>(shared: Arc<Shared>, period: Duration, work: F) -> JoinHandle<()>
where
    F: Fn(Arc<Shared>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        interval.tick().await;

        while shared.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            work(shared.clone()).await;
        }
    })
}
