//! Block headers.

use crate::encoding::{
    get_biguint, get_bytes, get_hash, put_biguint, put_bytes, put_hash, vlq_decode, vlq_encode,
    EncodingError,
};
use crate::Hash256;
use num_bigint::BigUint;

/// Root hash of an empty item list.
///
/// Headers whose transaction, uncle or receipt root equals this value
/// commit to no content of that kind.
pub fn empty_root() -> Hash256 {
    Hash256::of(&[])
}

/// Root hash over an ordered list of item hashes.
pub fn hash_root(hashes: &[Hash256]) -> Hash256 {
    let mut data = Vec::with_capacity(hashes.len() * 32);
    for hash in hashes {
        data.extend_from_slice(hash.as_bytes());
    }
    Hash256::of(&data)
}

/// A block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Hash of the parent block.
    pub parent_hash: Hash256,
    /// Root over the uncle headers.
    pub uncle_hash: Hash256,
    /// State trie root after executing this block.
    pub state_root: Hash256,
    /// Root over the block's transactions.
    pub tx_root: Hash256,
    /// Root over the block's receipts.
    pub receipt_root: Hash256,
    /// Block height.
    pub number: u64,
    /// Block difficulty.
    pub difficulty: BigUint,
    /// Unix timestamp.
    pub time: u64,
    /// Consensus extra data (carries fork markers).
    pub extra: Vec<u8>,
}

impl Header {
    /// Compute the header hash over the canonical encoding.
    pub fn hash(&self) -> Hash256 {
        Hash256::of(&self.serialize())
    }

    /// Canonical binary encoding.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 * 32 + 32);
        put_hash(&mut buf, &self.parent_hash);
        put_hash(&mut buf, &self.uncle_hash);
        put_hash(&mut buf, &self.state_root);
        put_hash(&mut buf, &self.tx_root);
        put_hash(&mut buf, &self.receipt_root);
        vlq_encode(&mut buf, self.number);
        put_biguint(&mut buf, &self.difficulty);
        vlq_encode(&mut buf, self.time);
        put_bytes(&mut buf, &self.extra);
        buf
    }

    /// Parse from canonical binary encoding, returning the header and the
    /// new offset.
    pub fn parse(data: &[u8], pos: usize) -> Result<(Self, usize), EncodingError> {
        let (parent_hash, pos) = get_hash(data, pos)?;
        let (uncle_hash, pos) = get_hash(data, pos)?;
        let (state_root, pos) = get_hash(data, pos)?;
        let (tx_root, pos) = get_hash(data, pos)?;
        let (receipt_root, pos) = get_hash(data, pos)?;
        let (number, pos) = vlq_decode(data, pos)?;
        let (difficulty, pos) = get_biguint(data, pos)?;
        let (time, pos) = vlq_decode(data, pos)?;
        let (extra, pos) = get_bytes(data, pos)?;
        Ok((
            Self {
                parent_hash,
                uncle_hash,
                state_root,
                tx_root,
                receipt_root,
                number,
                difficulty,
                time,
                extra,
            },
            pos,
        ))
    }

    /// A header committing to empty content, useful as a building block.
    pub fn empty(number: u64, parent_hash: Hash256, difficulty: BigUint) -> Self {
        Self {
            parent_hash,
            uncle_hash: empty_root(),
            state_root: Hash256::ZERO,
            tx_root: empty_root(),
            receipt_root: empty_root(),
            number,
            difficulty,
            time: 0,
            extra: Vec::new(),
        }
    }
}
