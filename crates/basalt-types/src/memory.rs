//! In-memory reference implementations of the collaborator interfaces.
//!
//! These back the devnet binary and the integration tests; a production
//! deployment would substitute persistent implementations behind the
//! same traits.

use crate::chain::{BlockChain, ChainError, Engine, StateSink, TxPool};
use crate::events::{EventBus, NewTxsEvent, Subscription};
use crate::{Block, Body, Hash256, Header, Receipt, Transaction};
use num_bigint::BigUint;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Deterministic receipts for an executed body.
///
/// The devnet has no real execution layer; receipts are derived from the
/// transaction list so that chain builders and the chain store agree on
/// the receipt root.
pub fn execution_receipts(body: &Body) -> Vec<Receipt> {
    body.transactions
        .iter()
        .enumerate()
        .map(|(i, _)| Receipt::new(1, 21_000 * (i as u64 + 1), Vec::new()))
        .collect()
}

struct ChainInner {
    blocks: HashMap<Hash256, Block>,
    canonical: Vec<Hash256>,
    tds: HashMap<Hash256, BigUint>,
    receipts: HashMap<Hash256, Vec<Receipt>>,
    nodes: HashMap<Hash256, Vec<u8>>,
}

/// An in-memory chain of validated blocks with total-difficulty accounting.
pub struct MemoryChain {
    genesis: Hash256,
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    /// Create a chain containing only the given genesis header.
    pub fn new(genesis: Header) -> Self {
        let genesis_block = Block::new(genesis.clone(), Body::default());
        let hash = genesis_block.hash();
        let mut blocks = HashMap::new();
        blocks.insert(hash, genesis_block);
        let mut tds = HashMap::new();
        tds.insert(hash, genesis.difficulty.clone());
        Self {
            genesis: hash,
            inner: RwLock::new(ChainInner {
                blocks,
                canonical: vec![hash],
                tds,
                receipts: HashMap::new(),
                nodes: HashMap::new(),
            }),
        }
    }

    /// Height of the chain head.
    pub fn height(&self) -> u64 {
        (self.inner.read().canonical.len() - 1) as u64
    }

    /// Total difficulty at the chain head.
    pub fn head_td(&self) -> BigUint {
        let inner = self.inner.read();
        let head = inner.canonical.last().expect("genesis always present");
        inner.tds[head].clone()
    }

    /// Seed a state trie node, for serving `GetNodeData`.
    pub fn put_trie_node(&self, data: Vec<u8>) -> Hash256 {
        let hash = Hash256::of(&data);
        self.inner.write().nodes.insert(hash, data);
        hash
    }

    fn insert_one(
        &self,
        inner: &mut ChainInner,
        block: Block,
        receipts: Vec<Receipt>,
    ) -> Result<(), ChainError> {
        let hash = block.hash();
        if inner.blocks.contains_key(&hash) {
            return Err(ChainError::AlreadyKnown);
        }
        let head = *inner.canonical.last().expect("genesis always present");
        if block.parent_hash() != head {
            return Err(ChainError::UnknownParent(block.parent_hash()));
        }
        if block.number() != inner.canonical.len() as u64 {
            return Err(ChainError::InvalidHeader(format!(
                "expected number {}, got {}",
                inner.canonical.len(),
                block.number()
            )));
        }
        let td = inner.tds[&head].clone() + block.difficulty().clone();
        inner.tds.insert(hash, td);
        inner.receipts.insert(hash, receipts);
        inner.canonical.push(hash);
        inner.blocks.insert(hash, block);
        Ok(())
    }
}

impl BlockChain for MemoryChain {
    fn genesis_hash(&self) -> Hash256 {
        self.genesis
    }

    fn current_header(&self) -> Header {
        let inner = self.inner.read();
        let head = inner.canonical.last().expect("genesis always present");
        inner.blocks[head].header.clone()
    }

    fn total_difficulty(&self, hash: &Hash256, _number: u64) -> Option<BigUint> {
        self.inner.read().tds.get(hash).cloned()
    }

    fn header_by_hash(&self, hash: &Hash256) -> Option<Header> {
        self.inner.read().blocks.get(hash).map(|b| b.header.clone())
    }

    fn header_by_number(&self, number: u64) -> Option<Header> {
        let inner = self.inner.read();
        let hash = inner.canonical.get(number as usize)?;
        Some(inner.blocks[hash].header.clone())
    }

    fn has_block(&self, hash: &Hash256, _number: u64) -> bool {
        self.inner.read().blocks.contains_key(hash)
    }

    fn block_by_hash(&self, hash: &Hash256) -> Option<Block> {
        self.inner.read().blocks.get(hash).cloned()
    }

    fn trie_node(&self, hash: &Hash256) -> Option<Vec<u8>> {
        self.inner.read().nodes.get(hash).cloned()
    }

    fn receipts_by_hash(&self, hash: &Hash256) -> Option<Vec<Receipt>> {
        self.inner.read().receipts.get(hash).cloned()
    }

    fn ancestor_hashes(&self, hash: &Hash256, count: u64) -> Vec<Hash256> {
        let inner = self.inner.read();
        let mut result = Vec::with_capacity(count as usize);
        let mut current = *hash;
        for _ in 0..count {
            let Some(block) = inner.blocks.get(&current) else {
                break;
            };
            result.push(block.parent_hash());
            current = block.parent_hash();
        }
        result
    }

    fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize, ChainError> {
        let mut inner = self.inner.write();
        let mut imported = 0;
        for block in blocks {
            let receipts = execution_receipts(&block.body);
            match self.insert_one(&mut inner, block, receipts) {
                Ok(()) => imported += 1,
                Err(ChainError::AlreadyKnown) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(imported)
    }

    fn insert_chain_with_receipts(
        &self,
        blocks: Vec<(Block, Vec<Receipt>)>,
    ) -> Result<usize, ChainError> {
        let mut inner = self.inner.write();
        let mut imported = 0;
        for (block, receipts) in blocks {
            match self.insert_one(&mut inner, block, receipts) {
                Ok(()) => imported += 1,
                Err(ChainError::AlreadyKnown) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(imported)
    }
}

impl StateSink for MemoryChain {
    fn inject_node(&self, data: &[u8]) -> Vec<Hash256> {
        let hash = Hash256::of(data);
        self.inner.write().nodes.insert(hash, data.to_vec());
        // Nodes are opaque to the in-memory store; a trie-backed store
        // would parse out unresolved child references here.
        Vec::new()
    }

    fn has_node(&self, hash: &Hash256) -> bool {
        self.inner.read().nodes.contains_key(hash)
    }
}

struct PoolInner {
    pending: Vec<Transaction>,
    known: HashSet<Hash256>,
}

/// A minimal transaction pool with subscription support.
pub struct BasicTxPool {
    inner: Mutex<PoolInner>,
    bus: Arc<EventBus<NewTxsEvent>>,
}

impl BasicTxPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                pending: Vec::new(),
                known: HashSet::new(),
            }),
            bus: EventBus::new(),
        }
    }

    /// Add a locally submitted transaction and notify subscribers.
    pub fn add_local(&self, tx: Transaction) -> Result<(), ChainError> {
        let accepted = {
            let mut inner = self.inner.lock();
            if !inner.known.insert(tx.hash()) {
                return Err(ChainError::AlreadyKnown);
            }
            inner.pending.push(tx.clone());
            tx
        };
        self.bus.publish(NewTxsEvent {
            txs: vec![accepted],
        });
        Ok(())
    }

    /// Number of pending transactions.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }
}

impl Default for BasicTxPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TxPool for BasicTxPool {
    fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<Result<(), ChainError>> {
        let mut results = Vec::with_capacity(txs.len());
        let mut accepted = Vec::new();
        {
            let mut inner = self.inner.lock();
            for tx in txs {
                if inner.known.insert(tx.hash()) {
                    inner.pending.push(tx.clone());
                    accepted.push(tx);
                    results.push(Ok(()));
                } else {
                    results.push(Err(ChainError::AlreadyKnown));
                }
            }
        }
        if !accepted.is_empty() {
            self.bus.publish(NewTxsEvent { txs: accepted });
        }
        results
    }

    fn pending(&self) -> Vec<Transaction> {
        self.inner.lock().pending.clone()
    }

    fn subscribe_new_txs(&self, capacity: usize) -> Subscription<NewTxsEvent> {
        self.bus.subscribe(capacity)
    }
}

/// Engine that accepts everything.
pub struct NoopEngine;

impl Engine for NoopEngine {
    fn verify_header(&self, _header: &Header) -> Result<(), ChainError> {
        Ok(())
    }

    fn verify_fork_extra(&self, _header: &Header) -> Result<(), ChainError> {
        Ok(())
    }
}

/// Engine that demands a fixed fork marker in the fork block's extra data.
pub struct ExtraCheckEngine {
    /// Required extra-data bytes at the fork block.
    pub fork_extra: Vec<u8>,
}

impl Engine for ExtraCheckEngine {
    fn verify_header(&self, _header: &Header) -> Result<(), ChainError> {
        Ok(())
    }

    fn verify_fork_extra(&self, header: &Header) -> Result<(), ChainError> {
        if header.extra == self.fork_extra {
            Ok(())
        } else {
            Err(ChainError::InvalidHeader(
                "fork marker mismatch".to_string(),
            ))
        }
    }
}
