//! # basalt-types
//!
//! Chain primitives for the Basalt node.
//!
//! This crate provides:
//! - The 32-byte hash type and Blake2b-256 helpers
//! - Headers, blocks, transactions and receipts with the chain's
//!   canonical binary encoding (VLQ integers, big-endian fixed fields)
//! - The interfaces the sync subsystem consumes: chain, engine,
//!   transaction pool and state sink
//! - A typed event bus with explicit unsubscribe
//! - In-memory reference implementations used by the devnet binary and
//!   the integration tests

pub mod encoding;

mod block;
mod chain;
mod events;
mod hash;
mod header;
mod memory;
mod receipt;
mod transaction;

pub use block::{Block, Body};
pub use chain::{BlockChain, ChainError, Engine, StateSink, TxPool};
pub use events::{EventBus, NewMinedBlockEvent, NewTxsEvent, Subscription};
pub use hash::Hash256;
pub use header::{empty_root, hash_root, Header};
pub use memory::{execution_receipts, BasicTxPool, ExtraCheckEngine, MemoryChain, NoopEngine};
pub use receipt::Receipt;
pub use transaction::Transaction;
