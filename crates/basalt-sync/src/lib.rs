//! # basalt-sync
//!
//! Block and transaction synchronization for the Basalt blockchain.
//!
//! This crate provides:
//! - The protocol manager: per-peer handshake, message loop and dispatch
//! - The fetcher: announcement-driven single-block import
//! - The downloader: bulk multi-peer catch-up in full or fast mode
//! - Broadcast fan-out of mined blocks and pool transactions

mod downloader;
mod error;
mod fetcher;
mod handler;
mod sync;

pub use downloader::{Downloader, SyncMode, DOWNLOAD_REQUEST_TIMEOUT, PIVOT_DISTANCE};
pub use error::{SyncError, SyncResult};
pub use fetcher::{Fetcher, FetcherHandle};
pub use handler::{ManagerConfig, ProtocolManager};

use std::time::Duration;

/// Target maximum size of a reply carrying blocks, headers or node data.
pub const SOFT_RESPONSE_LIMIT: usize = 2 * 1024 * 1024;

/// Approximate size of an encoded block header.
pub const EST_HEADER_SIZE: usize = 500;

/// Headers to request per batch.
pub const MAX_HEADER_FETCH: usize = 192;

/// Block bodies to serve or request per message.
pub const MAX_BLOCK_FETCH: usize = 128;

/// State trie nodes to serve or request per message.
pub const MAX_STATE_FETCH: usize = 384;

/// Receipt batches to serve or request per message.
pub const MAX_RECEIPT_FETCH: usize = 256;

/// Capacity of the channel listening to pool transaction events.
///
/// Referenced from the size of the transaction pool.
pub const TX_CHANNEL_SIZE: usize = 4096;

/// Time allowance for a peer to answer the fork challenge.
pub const FORK_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between forced sync rounds.
pub const FORCE_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Peers required before reactive syncs start.
pub const MIN_SYNC_PEERS: usize = 5;

/// Target size of one initial transaction-sync pack.
pub const TX_SYNC_PACK_SIZE: usize = 100 * 1024;
