//! Execution receipts.

use crate::encoding::{get_bytes, put_bytes, vlq_decode, vlq_encode, EncodingError};
use crate::Hash256;

/// The receipt of executing one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Execution status (1 = success).
    pub status: u64,
    /// Cumulative gas used in the block up to and including this receipt.
    pub cumulative_gas: u64,
    /// Opaque log data.
    pub logs: Vec<u8>,
}

impl Receipt {
    /// Create a receipt.
    pub fn new(status: u64, cumulative_gas: u64, logs: Vec<u8>) -> Self {
        Self {
            status,
            cumulative_gas,
            logs,
        }
    }

    /// Receipt hash over the canonical encoding.
    pub fn hash(&self) -> Hash256 {
        Hash256::of(&self.serialize())
    }

    /// Canonical binary encoding.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        vlq_encode(&mut buf, self.status);
        vlq_encode(&mut buf, self.cumulative_gas);
        put_bytes(&mut buf, &self.logs);
        buf
    }

    /// Parse from canonical binary encoding.
    pub fn parse(data: &[u8], pos: usize) -> Result<(Self, usize), EncodingError> {
        let (status, pos) = vlq_decode(data, pos)?;
        let (cumulative_gas, pos) = vlq_decode(data, pos)?;
        let (logs, pos) = get_bytes(data, pos)?;
        Ok((
            Self {
                status,
                cumulative_gas,
                logs,
            },
            pos,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_roundtrip() {
        let receipt = Receipt::new(1, 21_000, vec![9, 9]);
        let encoded = receipt.serialize();
        let (decoded, pos) = Receipt::parse(&encoded, 0).unwrap();
        assert_eq!(decoded, receipt);
        assert_eq!(pos, encoded.len());
    }
}
