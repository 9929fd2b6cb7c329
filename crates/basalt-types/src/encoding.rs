//! Canonical binary encoding helpers.
//!
//! All variable integers on the wire and in stored structures use VLQ
//! (variable-length quantity, 7 bits per byte, little-endian groups);
//! fixed-width fields are big-endian. Big integers are encoded as a
//! VLQ byte length followed by the big-endian magnitude.

use crate::Hash256;
use num_bigint::BigUint;
use thiserror::Error;

/// Errors produced while decoding canonical binary data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Input ended before the value was complete.
    #[error("truncated input at offset {0}")]
    Truncated(usize),

    /// A VLQ value did not fit in 64 bits.
    #[error("VLQ overflow")]
    Overflow,

    /// Structurally invalid data.
    #[error("invalid encoding: {0}")]
    Invalid(String),
}

/// VLQ encode an unsigned integer.
pub fn vlq_encode(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// VLQ decode an unsigned integer, returning the value and the new offset.
pub fn vlq_decode(data: &[u8], mut pos: usize) -> Result<(u64, usize), EncodingError> {
    let mut result: u64 = 0;
    let mut shift = 0;

    loop {
        if pos >= data.len() {
            return Err(EncodingError::Truncated(pos));
        }
        let byte = data[pos];
        pos += 1;

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            break;
        }
        shift += 7;

        if shift > 63 {
            return Err(EncodingError::Overflow);
        }
    }

    Ok((result, pos))
}

/// Append a 32-byte hash.
pub fn put_hash(buf: &mut Vec<u8>, hash: &Hash256) {
    buf.extend_from_slice(hash.as_bytes());
}

/// Read a 32-byte hash, returning it and the new offset.
pub fn get_hash(data: &[u8], pos: usize) -> Result<(Hash256, usize), EncodingError> {
    if pos + 32 > data.len() {
        return Err(EncodingError::Truncated(pos));
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&data[pos..pos + 32]);
    Ok((Hash256::from(bytes), pos + 32))
}

/// Append a big integer as VLQ length + big-endian magnitude.
pub fn put_biguint(buf: &mut Vec<u8>, value: &BigUint) {
    let bytes = value.to_bytes_be();
    vlq_encode(buf, bytes.len() as u64);
    buf.extend_from_slice(&bytes);
}

/// Read a big integer, returning it and the new offset.
pub fn get_biguint(data: &[u8], pos: usize) -> Result<(BigUint, usize), EncodingError> {
    let (len, pos) = vlq_decode(data, pos)?;
    let len = len as usize;
    if pos + len > data.len() {
        return Err(EncodingError::Truncated(pos));
    }
    Ok((BigUint::from_bytes_be(&data[pos..pos + len]), pos + len))
}

/// Append a length-prefixed byte string.
pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    vlq_encode(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Read a length-prefixed byte string, returning it and the new offset.
pub fn get_bytes(data: &[u8], pos: usize) -> Result<(Vec<u8>, usize), EncodingError> {
    let (len, pos) = vlq_decode(data, pos)?;
    let len = len as usize;
    if pos + len > data.len() {
        return Err(EncodingError::Truncated(pos));
    }
    Ok((data[pos..pos + len].to_vec(), pos + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlq_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            vlq_encode(&mut buf, value);
            let (decoded, pos) = vlq_decode(&buf, 0).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_vlq_truncated() {
        // High bit set on the last byte means "more to come"
        let data = [0x80u8];
        assert!(matches!(
            vlq_decode(&data, 0),
            Err(EncodingError::Truncated(_))
        ));
    }

    #[test]
    fn test_vlq_overflow() {
        let data = [0xFFu8; 11];
        assert_eq!(vlq_decode(&data, 0), Err(EncodingError::Overflow));
    }

    #[test]
    fn test_biguint_roundtrip() {
        let value = BigUint::from(123_456_789_012_345_678u64) * BigUint::from(1_000_000u64);
        let mut buf = Vec::new();
        put_biguint(&mut buf, &value);
        let (decoded, pos) = get_biguint(&buf, 0).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"payload");
        let (decoded, _) = get_bytes(&buf, 0).unwrap();
        assert_eq!(decoded, b"payload");
    }
}
