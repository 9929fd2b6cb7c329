//! Interfaces the sync subsystem consumes.
//!
//! The chain, consensus engine, transaction pool and state store are
//! external collaborators; the sync code only ever sees them through
//! these traits.

use crate::{Block, Hash256, Header, NewTxsEvent, Receipt, Subscription, Transaction};
use num_bigint::BigUint;
use thiserror::Error;

/// Errors surfaced by the chain and pool collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The parent of an inserted block is not known.
    #[error("unknown parent {0}")]
    UnknownParent(Hash256),

    /// The item is already present.
    #[error("already known")]
    AlreadyKnown,

    /// A header failed verification.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The requested item does not exist.
    #[error("not found")]
    NotFound,

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Read and write access to the local chain.
pub trait BlockChain: Send + Sync {
    /// Hash of the genesis block.
    fn genesis_hash(&self) -> Hash256;

    /// Header at the current chain head.
    fn current_header(&self) -> Header;

    /// Total difficulty accumulated at the given block.
    fn total_difficulty(&self, hash: &Hash256, number: u64) -> Option<BigUint>;

    /// Header lookup by hash.
    fn header_by_hash(&self, hash: &Hash256) -> Option<Header>;

    /// Header lookup by canonical number.
    fn header_by_number(&self, number: u64) -> Option<Header>;

    /// Whether the chain contains the given block.
    fn has_block(&self, hash: &Hash256, number: u64) -> bool;

    /// Full block lookup by hash.
    fn block_by_hash(&self, hash: &Hash256) -> Option<Block>;

    /// State trie node lookup by node hash.
    fn trie_node(&self, hash: &Hash256) -> Option<Vec<u8>>;

    /// Receipts of the given block.
    fn receipts_by_hash(&self, hash: &Hash256) -> Option<Vec<Receipt>>;

    /// Ancestor hashes of the given block, starting with its parent.
    fn ancestor_hashes(&self, hash: &Hash256, count: u64) -> Vec<Hash256>;

    /// Insert a contiguous run of blocks, executing them.
    ///
    /// Returns the number of blocks imported.
    fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize, ChainError>;

    /// Insert blocks together with their receipts, skipping execution.
    ///
    /// Used by fast sync below the pivot.
    fn insert_chain_with_receipts(
        &self,
        blocks: Vec<(Block, Vec<Receipt>)>,
    ) -> Result<usize, ChainError>;
}

/// Consensus engine hooks.
pub trait Engine: Send + Sync {
    /// Verify a header against consensus rules.
    fn verify_header(&self, header: &Header) -> Result<(), ChainError>;

    /// Verify the fork marker carried in a fork-block header's extra data.
    fn verify_fork_extra(&self, header: &Header) -> Result<(), ChainError>;
}

/// The transaction pool.
pub trait TxPool: Send + Sync {
    /// Add remotely received transactions.
    ///
    /// Returns one result per transaction; a rejection never aborts the
    /// rest of the batch.
    fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<Result<(), ChainError>>;

    /// Currently pending transactions.
    fn pending(&self) -> Vec<Transaction>;

    /// Subscribe to new-transaction events on a bounded channel.
    fn subscribe_new_txs(&self, capacity: usize) -> Subscription<NewTxsEvent>;
}

/// Sink for state trie nodes downloaded during fast sync.
pub trait StateSink: Send + Sync {
    /// Store a downloaded trie node.
    ///
    /// Returns the hashes of child nodes referenced by it that are still
    /// missing locally.
    fn inject_node(&self, data: &[u8]) -> Vec<Hash256>;

    /// Whether a node is already present.
    fn has_node(&self, hash: &Hash256) -> bool;
}
