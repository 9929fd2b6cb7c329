//! Basalt devnet node.
//!
//! Wires an in-memory chain, transaction pool and event bus into the
//! sync protocol manager, listens for peer connections and runs the
//! UDP verifier channel until interrupted.

use anyhow::{Context, Result};
use basalt_network::{ResultVerifier, SignatureBlock, VerifierChannel};
use basalt_sync::{ManagerConfig, ProtocolManager, SyncMode};
use basalt_types::{
    BasicTxPool, BlockChain, EventBus, Hash256, Header, MemoryChain, NoopEngine, StateSink, TxPool,
};
use clap::Parser;
use num_bigint::BigUint;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::NodeConfig;

/// Basalt blockchain node.
#[derive(Parser, Debug, Default)]
#[command(name = "basalt-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "basalt-node.toml")]
    config: PathBuf,

    /// Network id
    #[arg(long)]
    network_id: Option<u64>,

    /// P2P bind address
    #[arg(long)]
    bind: Option<String>,

    /// Verifier channel UDP bind address
    #[arg(long)]
    udp_bind: Option<String>,

    /// Maximum untrusted peers
    #[arg(long)]
    max_peers: Option<usize>,

    /// Start in fast-sync mode
    #[arg(long)]
    fast_sync: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Accepts a consensus result carrying at least `quorum` signatures.
///
/// The devnet has no key registry; a production deployment substitutes
/// a cohort-aware implementation behind the same trait.
struct QuorumVerifier {
    quorum: usize,
}

impl ResultVerifier for QuorumVerifier {
    fn verify(&self, result: &SignatureBlock) -> bool {
        !result.block_hash.is_zero() && result.signatures.len() >= self.quorum
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = NodeConfig::load(&args.config, &args)?;
    info!(
        name = %config.node_name,
        network = config.network_id,
        "Starting Basalt node v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Devnet genesis: empty content, unit difficulty
    let genesis = Header::empty(0, Hash256::ZERO, BigUint::from(1u32));
    let chain = Arc::new(MemoryChain::new(genesis));
    let pool = Arc::new(BasicTxPool::new());
    let mined_events = EventBus::new();

    let sync_mode = match config.sync_mode.as_str() {
        "fast" => SyncMode::Fast,
        _ => SyncMode::Full,
    };
    let manager = ProtocolManager::new(
        ManagerConfig {
            network_id: config.network_id,
            fork_block: config.fork_block,
            sync_mode,
            max_peers: config.network.max_peers,
        },
        Arc::clone(&chain) as Arc<dyn BlockChain>,
        Arc::new(NoopEngine),
        Arc::clone(&pool) as Arc<dyn TxPool>,
        Arc::clone(&chain) as Arc<dyn StateSink>,
        Arc::clone(&mined_events),
    );
    manager.start();

    // Verifier channel
    let (verifier_channel, mut roster_rx) = VerifierChannel::new(pool as Arc<dyn TxPool>);
    let verifier_channel = Arc::new(verifier_channel);
    verifier_channel.install_verifier(Arc::new(QuorumVerifier {
        quorum: config.verifier.quorum,
    }));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let udp = UdpSocket::bind(&config.network.udp_address)
        .await
        .context("Failed to bind verifier socket")?;
    let verifier_task = {
        let channel = Arc::clone(&verifier_channel);
        tokio::spawn(async move { channel.run(udp, shutdown_rx).await })
    };
    let roster_task = tokio::spawn(async move {
        while let Some(info) = roster_rx.recv().await {
            // The miner subsystem is out of scope here; surface the
            // roster so operators can see membership changes
            info!(block = info.block_num, nodes = info.nodes.len(), "Broadcast roster updated");
        }
    });

    // Listen for peers
    let listener = TcpListener::bind(&config.network.bind_address)
        .await
        .context("Failed to bind P2P listener")?;
    info!(addr = %config.network.bind_address, "Listening for peers");

    let accept_manager = Arc::clone(&manager);
    let trusted_peers = config.network.trusted_peers.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let manager = Arc::clone(&accept_manager);
                    let trusted = trusted_peers.iter().any(|t| t == &addr.to_string());
                    tokio::spawn(async move {
                        let node_id = node_id_for(&addr.to_string());
                        if let Err(err) = manager.handle(stream, &node_id, trusted).await {
                            debug!(%addr, error = %err, "Peer session ended");
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "Accept failed");
                }
            }
        }
    });

    // Dial the configured peers
    for addr in &config.network.known_peers {
        let manager = Arc::clone(&manager);
        let addr = addr.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    let node_id = node_id_for(&addr);
                    if let Err(err) = manager.handle(stream, &node_id, false).await {
                        debug!(%addr, error = %err, "Outbound peer session ended");
                    }
                }
                Err(err) => {
                    warn!(%addr, error = %err, "Failed to dial peer");
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");

    accept_task.abort();
    let _ = shutdown_tx.send(true);
    let _ = verifier_task.await;
    roster_task.abort();
    manager.stop().await;

    info!("Basalt node stopped");
    Ok(())
}

/// Session node id derived from the remote address.
///
/// The devnet runs without discovery, so there is no cryptographic node
/// identity to use here.
fn node_id_for(addr: &str) -> Vec<u8> {
    Hash256::of(addr.as_bytes()).as_bytes().to_vec()
}
