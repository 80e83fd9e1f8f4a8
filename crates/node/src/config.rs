//! Node configuration

use anyhow::{bail, Context};
use ed25519_dalek::SigningKey;
use powchain_admission::BinderConfig;
use powchain_codec::{Address, ProofKind, Tier};
use powchain_consensus::{EngineConfig, GossipConfig};
use powchain_runtime::MempoolConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Built-in miner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub enabled: bool,
    pub kind: ProofKind,
    pub tier: Tier,
    /// Problem size; work score is `2^size`
    pub size: u32,
    /// Hex secret the miner salt is derived from
    pub secret: Option<String>,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: ProofKind::SubsetSum,
            tier: Tier::Tier1,
            size: 12,
            secret: None,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Peer transport bind address
    pub listen_addr: String,
    /// Peers dialled at startup
    pub peers: Vec<String>,
    pub data_dir: PathBuf,
    /// Hex ed25519 seed of this node's validator key
    pub validator_seed: Option<String>,
    /// Proposer rotation order
    pub validators: Vec<Address>,
    pub engine: EngineConfig,
    pub mempool: MempoolConfig,
    pub gossip: GossipConfig,
    pub binder: BinderConfig,
    pub miner: MinerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9000".to_string(),
            peers: Vec::new(),
            data_dir: PathBuf::from("./data"),
            validator_seed: None,
            validators: Vec::new(),
            engine: EngineConfig::default(),
            mempool: MempoolConfig::default(),
            gossip: GossipConfig::default(),
            binder: BinderConfig::default(),
            miner: MinerConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// This node's signing key. Without a configured seed a fresh key is
    /// generated, which only makes sense for a follower.
    pub fn identity(&self) -> anyhow::Result<SigningKey> {
        match &self.validator_seed {
            Some(seed) => Ok(SigningKey::from_bytes(&parse_seed(seed)?)),
            None => Ok(SigningKey::generate(&mut rand::rngs::OsRng)),
        }
    }

    pub fn miner_secret(&self) -> anyhow::Result<Vec<u8>> {
        match &self.miner.secret {
            Some(secret) => hex::decode(secret).context("miner secret is not hex"),
            None => Ok(rand::random::<[u8; 32]>().to_vec()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.validators.is_empty() {
            bail!("at least one validator address is required");
        }
        if self.engine.slot_interval.is_zero() {
            bail!("slot_interval must be positive");
        }
        if self.gossip.broadcast_interval.is_zero() || self.gossip.refresh_interval.is_zero() {
            bail!("gossip intervals must be positive");
        }
        if self.engine.max_reorg_depth == 0 {
            bail!("max_reorg_depth must be at least 1");
        }
        Ok(())
    }
}

fn parse_seed(seed: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(seed.trim_start_matches("0x")).context("validator seed is not hex")?;
    let Ok(seed) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        bail!("validator seed must be 32 bytes, got {}", bytes.len());
    };
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use powchain_codec::{address_of, H256};
    use std::time::Duration;

    #[test]
    fn test_partial_config_takes_defaults() {
        let json = format!(
            r#"{{
                "validators": ["{}"],
                "validator_seed": "{}",
                "engine": {{ "slot_interval": 1.5 }},
                "miner": {{ "enabled": true, "kind": "three_sat", "size": 8 }}
            }}"#,
            H256([1; 32]).to_hex(),
            "07".repeat(32)
        );
        let config: NodeConfig = serde_json::from_str(&json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.validators, vec![H256([1; 32])]);
        assert_eq!(config.engine.slot_interval, Duration::from_millis(1500));
        assert_eq!(config.engine.max_reorg_depth, 32);
        assert_eq!(config.miner.kind, ProofKind::ThreeSat);
        assert_eq!(config.miner.tier, Tier::Tier1);
        assert_eq!(config.listen_addr, "127.0.0.1:9000");

        let key = config.identity().unwrap();
        assert_eq!(address_of(&key), address_of(&SigningKey::from_bytes(&[7; 32])));
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        assert!(NodeConfig::default().validate().is_err());

        let config = NodeConfig {
            validators: vec![H256([1; 32])],
            validator_seed: Some("abcd".into()),
            ..Default::default()
        };
        config.validate().unwrap();
        assert!(config.identity().is_err());

        let mut zero_slot = config.clone();
        zero_slot.engine.slot_interval = Duration::ZERO;
        assert!(zero_slot.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let config = NodeConfig {
            validators: vec![H256([2; 32]), H256([3; 32])],
            peers: vec!["127.0.0.1:9001".into()],
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.validators, config.validators);
        assert_eq!(loaded.peers, config.peers);
        assert!(NodeConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
