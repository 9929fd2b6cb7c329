//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, for logs.
    pub node_name: String,
    /// Network id exchanged during the handshake.
    pub network_id: u64,
    /// Hard-fork block peers must prove lineage for, if any.
    pub fork_block: Option<u64>,
    /// Sync strategy at startup (full, fast).
    #[serde(default = "default_sync_mode")]
    pub sync_mode: String,
    /// Network configuration.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Verifier channel configuration.
    #[serde(default)]
    pub verifier: VerifierConfig,
}

fn default_sync_mode() -> String {
    "full".to_string()
}

/// P2P configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP bind address for the sync protocol.
    pub bind_address: String,
    /// UDP bind address for the verifier channel.
    pub udp_address: String,
    /// Peers to dial at startup.
    pub known_peers: Vec<String>,
    /// Peers exempt from the connection limit.
    pub trusted_peers: Vec<String>,
    /// Maximum untrusted connections.
    pub max_peers: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:30310".to_string(),
            udp_address: "0.0.0.0:30311".to_string(),
            known_peers: Vec::new(),
            trusted_peers: Vec::new(),
            max_peers: 25,
        }
    }
}

/// Verifier cohort configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerifierConfig {
    /// Signatures required on a consensus result.
    pub quorum: usize,
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        // CLI overrides
        if let Some(network_id) = args.network_id {
            config.network_id = network_id;
        }
        if let Some(ref bind) = args.bind {
            config.network.bind_address = bind.clone();
        }
        if let Some(ref udp) = args.udp_bind {
            config.network.udp_address = udp.clone();
        }
        if let Some(max_peers) = args.max_peers {
            config.network.max_peers = max_peers;
        }
        if args.fast_sync {
            config.sync_mode = "fast".to_string();
        }

        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "basalt-node".to_string(),
            network_id: 1,
            fork_block: None,
            sync_mode: default_sync_mode(),
            network: NetworkConfig::default(),
            verifier: VerifierConfig::default(),
        }
    }
}
