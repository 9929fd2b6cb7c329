//! # basalt-network
//!
//! P2P networking layer for the Basalt blockchain.
//!
//! This crate provides:
//! - Length-prefixed, versioned message framing
//! - The block/transaction sync protocol messages
//! - Per-peer state, known-item tracking and async fan-out queues
//! - The thread-safe peer set
//! - Peer reputation accounting
//! - The trusted UDP verifier channel

mod codec;
mod error;
mod message;
mod peer;
mod peers;
mod reputation;
mod verifier;

pub use codec::FrameCodec;
pub use error::{DisconnectReason, NetworkError, NetworkResult};
pub use message::{
    Announcement, GetBlockHeaders, HashOrNumber, Message, MessageCode, NewBlockData, StatusData,
};
pub use peer::{BlockQueueItem, Peer, MAX_KNOWN_BLOCKS, MAX_KNOWN_TXS};
pub use peers::PeerSet;
pub use reputation::{Penalties, ReputationTable};
pub use verifier::{
    BroadcastInfo, ConsensusResult, ResultVerifier, SignatureBlock, VerifierChannel,
    VerifierDatagram, MSG_TYPE_BROADCAST_ROSTER, MSG_TYPE_CONSENSUS_TXS,
};

/// Default P2P port.
pub const DEFAULT_PORT: u16 = 30310;

/// Protocol magic bytes for the main network.
pub const MAINNET_MAGIC: [u8; 4] = [0x42, 0x53, 0x4C, 0x54];

/// Maximum size of a single protocol message.
pub const PROTOCOL_MAX_MSG_SIZE: usize = 10 * 1024 * 1024; // 10 MiB

/// Protocol versions this node speaks, preferred first.
///
/// Version 63 adds the state and receipt messages used by fast sync.
pub const PROTOCOL_VERSIONS: [u32; 2] = [63, 62];

/// Lowest version carrying `GetNodeData`/`NodeData`/`GetReceipts`/`Receipts`.
pub const MIN_FAST_VERSION: u32 = 63;

/// Time allowed for the status exchange.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
