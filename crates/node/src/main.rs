//! powchain validator node
//!
//! Wires the engine, mempool, gossip scheduler, block relay and optional
//! miner together over a sled-backed store and a WebSocket peer transport.
//! State is persisted to disk and survives restarts.

use anyhow::Result;
use clap::Parser;
use powchain_codec::address_of;
use powchain_consensus::{
    BlockRelay, ConsensusEngine, EngineService, GossipScheduler, PeerTransport, WsTransport,
};
use powchain_runtime::{MemoryBlobStore, MempoolService, SledStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod miner;

use config::NodeConfig;
use miner::Miner;

/// Inbound peer message queue depth
const INBOUND_QUEUE_DEPTH: usize = 4096;

/// powchain validator
#[derive(Parser, Debug)]
#[command(name = "powchain")]
#[command(about = "Rotating-proposer chain with proof-of-work fork choice", long_about = None)]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peer transport bind address (overrides config)
    #[arg(long)]
    listen_addr: Option<String>,

    /// Peer to dial; repeatable (adds to config)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Data directory for persistent state (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Hex validator seed (overrides config)
    #[arg(long)]
    validator_seed: Option<String>,

    /// Run the built-in miner
    #[arg(long)]
    mine: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        config.peers.extend(self.peers);
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(seed) = self.validator_seed {
            config.validator_seed = Some(seed);
        }
        if self.mine {
            config.miner.enabled = true;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config()?;
    run(config).await
}

async fn run(config: NodeConfig) -> Result<()> {
    let identity = config.identity()?;
    let address = address_of(&identity);

    tracing::info!("Starting powchain node {}", address.to_hex());
    tracing::info!("  Peer transport: {}", config.listen_addr);
    tracing::info!("  Validators: {}", config.validators.len());
    tracing::info!("  Slot interval: {:?}", config.engine.slot_interval);
    tracing::info!(
        "  Gossip: broadcast {:.2}s, refresh {:.2}s",
        config.gossip.broadcast_interval.as_secs_f64(),
        config.gossip.refresh_interval.as_secs_f64()
    );
    tracing::info!("  Data directory: {:?}", config.data_dir);

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(SledStore::open(config.data_dir.join("chain"))?);
    let blobs = Arc::new(MemoryBlobStore::new());

    let engine = ConsensusEngine::builder()
        .identity(identity)
        .validators(config.validators.clone())
        .store(store.clone())
        .config(config.engine.clone())
        .binder_config(config.binder.clone())
        .blobs(blobs.clone())
        .build()?;
    let abort = engine.abort_flag();

    let (mempool, mempool_task) = MempoolService::spawn(store.clone(), config.mempool.clone());

    // Peer transport
    let (ws, inbound) = WsTransport::new(INBOUND_QUEUE_DEPTH);
    ws.listen(&config.listen_addr).await?;
    for peer in &config.peers {
        if let Err(e) = ws.connect(peer).await {
            tracing::warn!("Could not reach peer {}: {}", peer, e);
        }
    }
    let transport: Arc<dyn PeerTransport> = Arc::new(ws);

    let (gossip, gossip_handle) = GossipScheduler::start(config.gossip.clone(), transport.clone());
    let (engine_handle, engine_task) =
        EngineService::spawn(engine, mempool.clone(), Some(gossip_handle));

    let relay = BlockRelay::new(
        transport,
        blobs,
        engine_handle.clone(),
        config.gossip.refresh_interval,
    );
    let relay_task = tokio::spawn(relay.run(inbound));

    let miner_task = if config.miner.enabled {
        let miner = Miner::new(
            config.miner.clone(),
            address,
            config.miner_secret()?,
            engine_handle.clone(),
        );
        Some(tokio::spawn(miner.run(config.engine.slot_interval)))
    } else {
        None
    };

    // Block log
    let mut updates = engine_handle.subscribe();
    let log_task = tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            match update.reorg_depth {
                Some(depth) => tracing::info!(
                    "Block {} ({}) after reorg of depth {}, work {}",
                    update.index,
                    update.hash.short(),
                    depth,
                    update.cumulative_work
                ),
                None => tracing::info!(
                    "Block {} ({}): {} txs, work {}",
                    update.index,
                    update.hash.short(),
                    update.transaction_count,
                    update.cumulative_work
                ),
            }
        }
    });

    tracing::info!("Node running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    abort.store(true, std::sync::atomic::Ordering::SeqCst);
    if let Some(task) = miner_task {
        task.abort();
    }
    engine_handle.shutdown().await;
    if tokio::time::timeout(Duration::from_secs(5), engine_task).await.is_err() {
        tracing::warn!("Engine did not stop in time");
    }
    if let Ok(stats) = serde_json::to_string(&gossip.stats()) {
        tracing::info!("Gossip: {}", stats);
    }
    gossip.stop();
    mempool.shutdown().await;
    let _ = mempool_task.await;
    relay_task.abort();
    log_task.abort();

    tracing::info!("Node stopped");
    Ok(())
}
