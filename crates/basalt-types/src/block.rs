//! Blocks and block bodies.

use crate::encoding::{vlq_decode, vlq_encode, EncodingError};
use crate::header::hash_root;
use crate::{Hash256, Header, Transaction};
use num_bigint::BigUint;
use std::time::Instant;

/// The content of a block: transactions plus uncle headers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Body {
    /// Transactions included in the block.
    pub transactions: Vec<Transaction>,
    /// Uncle headers referenced by the block.
    pub uncles: Vec<Header>,
}

impl Body {
    /// Root over the body's transactions.
    pub fn tx_root(&self) -> Hash256 {
        let hashes: Vec<Hash256> = self.transactions.iter().map(|tx| tx.hash()).collect();
        hash_root(&hashes)
    }

    /// Root over the body's uncle headers.
    pub fn uncle_root(&self) -> Hash256 {
        let hashes: Vec<Hash256> = self.uncles.iter().map(|u| u.hash()).collect();
        hash_root(&hashes)
    }

    /// Canonical binary encoding.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        vlq_encode(&mut buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            buf.extend_from_slice(&tx.serialize());
        }
        vlq_encode(&mut buf, self.uncles.len() as u64);
        for uncle in &self.uncles {
            buf.extend_from_slice(&uncle.serialize());
        }
        buf
    }

    /// Parse from canonical binary encoding.
    pub fn parse(data: &[u8], pos: usize) -> Result<(Self, usize), EncodingError> {
        let (tx_count, mut pos) = vlq_decode(data, pos)?;
        let mut transactions = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            let (tx, next) = Transaction::parse(data, pos)?;
            transactions.push(tx);
            pos = next;
        }
        let (uncle_count, mut pos) = vlq_decode(data, pos)?;
        let mut uncles = Vec::with_capacity(uncle_count as usize);
        for _ in 0..uncle_count {
            let (uncle, next) = Header::parse(data, pos)?;
            uncles.push(uncle);
            pos = next;
        }
        Ok((
            Self {
                transactions,
                uncles,
            },
            pos,
        ))
    }
}

/// A full block.
///
/// The receive metadata is stamped by the protocol manager on inbound
/// decode and never takes part in encoding or equality; the origin peer
/// is a non-owning id resolved through the peer set.
#[derive(Debug, Clone)]
pub struct Block {
    /// The block header.
    pub header: Header,
    /// The block body.
    pub body: Body,
    /// When the block arrived over the network, if it did.
    pub received_at: Option<Instant>,
    /// Id of the peer the block arrived from, if any.
    pub received_from: Option<String>,
}

impl Block {
    /// Create a block from its parts.
    pub fn new(header: Header, body: Body) -> Self {
        Self {
            header,
            body,
            received_at: None,
            received_from: None,
        }
    }

    /// Block hash (the header hash).
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Block height.
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Parent block hash.
    pub fn parent_hash(&self) -> Hash256 {
        self.header.parent_hash
    }

    /// Block difficulty.
    pub fn difficulty(&self) -> &BigUint {
        &self.header.difficulty
    }

    /// Canonical binary encoding (header followed by body).
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.header.serialize();
        buf.extend_from_slice(&self.body.serialize());
        buf
    }

    /// Parse from canonical binary encoding.
    pub fn parse(data: &[u8], pos: usize) -> Result<(Self, usize), EncodingError> {
        let (header, pos) = Header::parse(data, pos)?;
        let (body, pos) = Body::parse(data, pos)?;
        Ok((Self::new(header, body), pos))
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.body == other.body
    }
}

impl Eq for Block {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::empty_root;

    fn sample_block() -> Block {
        let body = Body {
            transactions: vec![Transaction::new(0, Hash256::of(b"to"), 10, vec![])],
            uncles: Vec::new(),
        };
        let mut header = Header::empty(5, Hash256::of(b"parent"), BigUint::from(1000u32));
        header.tx_root = body.tx_root();
        header.uncle_hash = body.uncle_root();
        Block::new(header, body)
    }

    #[test]
    fn test_block_roundtrip() {
        let block = sample_block();
        let encoded = block.serialize();
        let (decoded, pos) = Block::parse(&encoded, 0).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(pos, encoded.len());
    }

    #[test]
    fn test_receive_metadata_ignored_by_equality() {
        let block = sample_block();
        let mut stamped = block.clone();
        stamped.received_at = Some(Instant::now());
        stamped.received_from = Some("aabbccdd00112233".to_string());
        assert_eq!(block, stamped);
    }

    #[test]
    fn test_body_roots_match_content() {
        let block = sample_block();
        assert_eq!(block.body.tx_root(), block.header.tx_root);
        assert_eq!(block.body.uncle_root(), empty_root());
    }
}
