//! Transactions.

use crate::encoding::{get_bytes, get_hash, put_bytes, put_hash, vlq_decode, vlq_encode, EncodingError};
use crate::Hash256;
use serde::{Deserialize, Serialize};

/// A transaction.
///
/// The sync subsystem never interprets transactions beyond their hash;
/// the fields exist so the canonical encoding has content to commit to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender nonce.
    pub nonce: u64,
    /// Recipient account.
    pub recipient: Hash256,
    /// Transferred amount.
    pub amount: u64,
    /// Opaque call payload.
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Create a transaction.
    pub fn new(nonce: u64, recipient: Hash256, amount: u64, payload: Vec<u8>) -> Self {
        Self {
            nonce,
            recipient,
            amount,
            payload,
        }
    }

    /// Transaction hash over the canonical encoding.
    pub fn hash(&self) -> Hash256 {
        Hash256::of(&self.serialize())
    }

    /// Canonical binary encoding.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        vlq_encode(&mut buf, self.nonce);
        put_hash(&mut buf, &self.recipient);
        vlq_encode(&mut buf, self.amount);
        put_bytes(&mut buf, &self.payload);
        buf
    }

    /// Parse from canonical binary encoding.
    pub fn parse(data: &[u8], pos: usize) -> Result<(Self, usize), EncodingError> {
        let (nonce, pos) = vlq_decode(data, pos)?;
        let (recipient, pos) = get_hash(data, pos)?;
        let (amount, pos) = vlq_decode(data, pos)?;
        let (payload, pos) = get_bytes(data, pos)?;
        Ok((
            Self {
                nonce,
                recipient,
                amount,
                payload,
            },
            pos,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_roundtrip() {
        let tx = Transaction::new(7, Hash256::of(b"alice"), 1_000, vec![1, 2, 3]);
        let encoded = tx.serialize();
        let (decoded, pos) = Transaction::parse(&encoded, 0).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(pos, encoded.len());
    }

    #[test]
    fn test_transaction_hash_is_content_addressed() {
        let a = Transaction::new(1, Hash256::of(b"a"), 5, vec![]);
        let mut b = a.clone();
        assert_eq!(a.hash(), b.hash());
        b.amount = 6;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_transaction_json() {
        let tx = Transaction::new(3, Hash256::of(b"bob"), 42, vec![0xab, 0xcd]);
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
    }
}
