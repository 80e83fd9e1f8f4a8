//! powchain consensus - rotating proposers with work-weighted fork choice
//!
//! Architecture:
//! - Schedule: round-robin proposer per height over a fixed validator set
//! - Engine: the only writer of chain state; proposes, imports and reorganizes
//! - Fork choice: highest cumulative work, ties to the lowest block hash
//! - Slashing: double proposals and out-of-slot blocks are recorded
//! - Gossip: content ids are queued and announced on a fixed cadence
//! - Relay: announcements become fetches, fetched blobs become imports

pub mod engine;
pub mod error;
pub mod fork_choice;
pub mod gossip;
pub mod relay;
pub mod schedule;
pub mod service;
pub mod slashing;
pub mod transport;
pub mod types;

pub use engine::{genesis_block, ConsensusEngine, ConsensusEngineBuilder};
pub use error::ConsensusError;
pub use fork_choice::{choose, prefers, ChainHead};
pub use gossip::{GossipError, GossipHandle, GossipScheduler};
pub use relay::{BlockRelay, RelayStats};
pub use schedule::{ValidatorSet, ValidatorSlot};
pub use service::{EngineHandle, EngineService};
pub use slashing::{Offense, SlashingConfig, SlashingLedger, SlashingRecord};
pub use transport::{Inbound, MemoryNetwork, MemoryTransport, PeerId, PeerInfo, PeerTransport, WsTransport};
pub use types::*;

#[cfg(test)]
mod tests;
