//! Peer transport collaborator
//!
//! The gossip scheduler only needs `broadcast` and `list_peers`. Two
//! implementations live here: an in-memory network for tests and
//! single-process clusters, and a WebSocket transport for the node binary.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message, WebSocketStream};

pub type PeerId = String;

/// A message received from a peer
pub type Inbound = (PeerId, Vec<u8>);

/// Per-peer outbound queue depth
const PEER_QUEUE_DEPTH: usize = 1024;

/// Ping cadence keeping `last_seen_ms` fresh on idle connections
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Unix millis of the last frame received from the peer
    pub last_seen_ms: u64,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Queue `payload` to each listed peer. Returns how many accepted it.
    async fn broadcast(&self, peers: &[PeerId], payload: Vec<u8>) -> anyhow::Result<usize>;

    /// Currently connected peers
    async fn list_peers(&self) -> anyhow::Result<Vec<PeerInfo>>;
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

struct MemoryPeer {
    inbox: mpsc::Sender<Inbound>,
    last_seen_ms: u64,
    /// Offline members keep their inbox but neither send nor receive
    online: bool,
}

/// In-process network. Every joined member sees every other member.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    members: Arc<RwLock<HashMap<PeerId, MemoryPeer>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member and return its transport and inbox
    pub fn join(&self, id: impl Into<PeerId>) -> (MemoryTransport, mpsc::Receiver<Inbound>) {
        let id = id.into();
        let (inbox, receiver) = mpsc::channel(PEER_QUEUE_DEPTH);
        self.members.write().insert(
            id.clone(),
            MemoryPeer {
                inbox,
                last_seen_ms: 0,
                online: true,
            },
        );
        let transport = MemoryTransport {
            id,
            network: self.clone(),
            sent: Arc::new(Mutex::new(Vec::new())),
        };
        (transport, receiver)
    }

    pub fn leave(&self, id: &str) {
        self.members.write().remove(id);
    }

    /// Cut a member off from the rest of the network, or bring it back
    pub fn set_online(&self, id: &str, online: bool) {
        if let Some(member) = self.members.write().get_mut(id) {
            member.online = online;
        }
    }

    fn is_online(&self, id: &str) -> bool {
        self.members.read().get(id).map_or(false, |m| m.online)
    }

    /// Record activity from a member
    pub fn touch(&self, id: &str, last_seen_ms: u64) {
        if let Some(member) = self.members.write().get_mut(id) {
            member.last_seen_ms = last_seen_ms;
        }
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }
}

/// One member's view of a `MemoryNetwork`
#[derive(Clone)]
pub struct MemoryTransport {
    id: PeerId,
    network: MemoryNetwork,
    sent: Arc<Mutex<Vec<(PeerId, Vec<u8>)>>>,
}

impl MemoryTransport {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Every delivered (peer, payload) pair so far
    pub fn sent(&self) -> Vec<(PeerId, Vec<u8>)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn broadcast(&self, peers: &[PeerId], payload: Vec<u8>) -> anyhow::Result<usize> {
        if !self.network.is_online(&self.id) {
            return Ok(0);
        }
        let members = self.network.members.read();
        let mut delivered = 0;
        for peer in peers {
            let Some(member) = members.get(peer).filter(|m| m.online) else {
                continue;
            };
            if member.inbox.try_send((self.id.clone(), payload.clone())).is_ok() {
                self.sent.lock().push((peer.clone(), payload.clone()));
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn list_peers(&self) -> anyhow::Result<Vec<PeerInfo>> {
        if !self.network.is_online(&self.id) {
            return Ok(Vec::new());
        }
        Ok(self
            .network
            .members
            .read()
            .iter()
            .filter(|(id, member)| **id != self.id && member.online)
            .map(|(id, member)| PeerInfo {
                id: id.clone(),
                last_seen_ms: member.last_seen_ms,
            })
            .collect())
    }
}

struct PeerConnection {
    outbound: mpsc::Sender<Vec<u8>>,
    last_seen_ms: Arc<AtomicU64>,
    /// Distinguishes a reconnect from the connection it replaced
    generation: u64,
}

/// WebSocket peer transport
///
/// Listens for inbound connections and dials outbound ones. Each connection
/// gets a writer task fed by a bounded queue and a reader task that forwards
/// binary frames to the shared inbound channel.
#[derive(Clone)]
pub struct WsTransport {
    peers: Arc<RwLock<HashMap<PeerId, PeerConnection>>>,
    inbound: mpsc::Sender<Inbound>,
    next_generation: Arc<AtomicU64>,
}

impl WsTransport {
    pub fn new(queue_depth: usize) -> (Self, mpsc::Receiver<Inbound>) {
        let (inbound, receiver) = mpsc::channel(queue_depth.max(1));
        let transport = Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            inbound,
            next_generation: Arc::new(AtomicU64::new(0)),
        };
        (transport, receiver)
    }

    /// Start accepting peer connections. Returns the bound address.
    pub async fn listen(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!("Peer transport listening on {}", local);

        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws) => {
                                    tracing::info!("Peer connected from {}", peer_addr);
                                    transport.attach(peer_addr.to_string(), ws);
                                }
                                Err(e) => tracing::warn!("Handshake with {} failed: {}", peer_addr, e),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(local)
    }

    /// Dial a peer. The peer id is the address dialled.
    pub async fn connect(&self, addr: &str) -> anyhow::Result<PeerId> {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(&url).await?;
        tracing::info!("Connected to peer at {}", addr);
        let id: PeerId = addr.to_string();
        self.attach(id.clone(), ws);
        Ok(id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Record a connection under `id`, replacing any older one
    fn register(&self, id: PeerId, outbound: mpsc::Sender<Vec<u8>>) -> (u64, Arc<AtomicU64>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let last_seen_ms = Arc::new(AtomicU64::new(now_ms()));
        self.peers.write().insert(
            id,
            PeerConnection {
                outbound,
                last_seen_ms: last_seen_ms.clone(),
                generation,
            },
        );
        (generation, last_seen_ms)
    }

    /// Forget `id` unless it has reconnected since `generation` was registered
    fn detach(&self, id: &str, generation: u64) -> bool {
        let mut peers = self.peers.write();
        match peers.get(id) {
            Some(connection) if connection.generation == generation => {
                peers.remove(id);
                true
            }
            _ => false,
        }
    }

    fn attach<T>(&self, id: PeerId, ws: WebSocketStream<T>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (outbound, mut queue) = mpsc::channel::<Vec<u8>>(PEER_QUEUE_DEPTH);
        let (generation, last_seen_ms) = self.register(id.clone(), outbound);

        // Writer: queued payloads plus keepalive pings
        let writer_id = id.clone();
        let send_task = tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                let message = tokio::select! {
                    payload = queue.recv() => match payload {
                        Some(data) => Message::Binary(data),
                        None => break,
                    },
                    _ = keepalive.tick() => Message::Ping(Vec::new()),
                };
                if ws_sender.send(message).await.is_err() {
                    tracing::debug!("Writer for {} closed", writer_id);
                    break;
                }
            }
        });

        // Reader: forward binary frames, refresh liveness on any frame
        let transport = self.clone();
        let inbound = self.inbound.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        last_seen_ms.store(now_ms(), Ordering::Relaxed);
                        if inbound.send((id.clone(), data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => last_seen_ms.store(now_ms(), Ordering::Relaxed),
                    Err(e) => {
                        tracing::warn!("WebSocket error from {}: {}", id, e);
                        break;
                    }
                }
            }

            send_task.abort();
            if transport.detach(&id, generation) {
                tracing::info!("Peer {} disconnected", id);
            } else {
                tracing::debug!("Stale connection to {} closed", id);
            }
        });
    }
}

#[async_trait]
impl PeerTransport for WsTransport {
    async fn broadcast(&self, peers: &[PeerId], payload: Vec<u8>) -> anyhow::Result<usize> {
        let connections = self.peers.read();
        let mut delivered = 0;
        for peer in peers {
            let Some(connection) = connections.get(peer) else {
                continue;
            };
            match connection.outbound.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!("Dropping payload for {}: {}", peer, e),
            }
        }
        Ok(delivered)
    }

    async fn list_peers(&self) -> anyhow::Result<Vec<PeerInfo>> {
        Ok(self
            .peers
            .read()
            .iter()
            .map(|(id, connection)| PeerInfo {
                id: id.clone(),
                last_seen_ms: connection.last_seen_ms.load(Ordering::Relaxed),
            })
            .collect())
    }
}
