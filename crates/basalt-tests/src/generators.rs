//! Test data generators.
//!
//! Chains built here commit to their content: transaction, uncle and
//! receipt roots match what the in-memory chain derives on import, so
//! served data survives the downloader's matching checks.

use basalt_types::{
    execution_receipts, hash_root, Block, BlockChain, Body, Hash256, Header, MemoryChain,
    Transaction,
};
use num_bigint::BigUint;
use std::sync::Arc;

/// The shared devnet genesis header.
pub fn genesis() -> Header {
    Header::empty(0, Hash256::ZERO, BigUint::from(1u32))
}

/// A transaction with a derived recipient and payload.
pub fn make_tx(nonce: u64) -> Transaction {
    Transaction::new(
        nonce,
        Hash256::of(&nonce.to_be_bytes()),
        nonce * 10 + 1,
        vec![nonce as u8],
    )
}

/// Build a chain of `length` blocks on top of the genesis, each with
/// `txs_per_block` transactions and a resolvable state root.
///
/// Returns the populated chain and the blocks in order.
pub fn build_chain(length: u64, txs_per_block: u64) -> (Arc<MemoryChain>, Vec<Block>) {
    let chain = Arc::new(MemoryChain::new(genesis()));
    let mut blocks = Vec::with_capacity(length as usize);
    let mut parent = chain.current_header();

    for number in 1..=length {
        let transactions: Vec<Transaction> = (0..txs_per_block)
            .map(|i| make_tx(number * 1_000 + i))
            .collect();
        let body = Body {
            transactions,
            uncles: Vec::new(),
        };
        let receipts = execution_receipts(&body);
        let receipt_hashes: Vec<Hash256> = receipts.iter().map(|r| r.hash()).collect();

        // Seed a state node so fast sync has something to resolve
        let state_root = chain.put_trie_node(number.to_be_bytes().to_vec());

        let header = Header {
            parent_hash: parent.hash(),
            uncle_hash: body.uncle_root(),
            state_root,
            tx_root: body.tx_root(),
            receipt_root: hash_root(&receipt_hashes),
            number,
            difficulty: BigUint::from(100u32),
            time: 1_700_000_000 + number * 10,
            extra: Vec::new(),
        };
        parent = header.clone();

        let block = Block::new(header, body);
        blocks.push(block.clone());
        chain
            .insert_chain(vec![block])
            .expect("generated chain is contiguous");
    }
    (chain, blocks)
}
