//! Message framing codec.
//!
//! Frames are laid out as:
//!
//! ```text
//! +----------+----------+----------+----------+
//! |  Magic   |   Code   |  Length  | Checksum |
//! | 4 bytes  | 1 byte   | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+
//! |                 Payload                   |
//! |              (Length bytes)               |
//! +-------------------------------------------+
//! ```
//!
//! - Magic: network identifier
//! - Code: message code
//! - Length: payload length in bytes (big-endian)
//! - Checksum: first 4 bytes of Blake2b-256 over the payload
//! - Payload: canonical message encoding

use crate::{Message, MessageCode, NetworkError, MAINNET_MAGIC, PROTOCOL_MAX_MSG_SIZE};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Header size: magic (4) + code (1) + length (4) + checksum (4).
const HEADER_SIZE: usize = 13;

/// Frame codec for the sync protocol.
pub struct FrameCodec {
    /// Network magic bytes.
    magic: [u8; 4],
    /// Maximum allowed payload size.
    max_size: usize,
}

impl FrameCodec {
    /// Create a codec with mainnet magic.
    pub fn new() -> Self {
        Self {
            magic: MAINNET_MAGIC,
            max_size: PROTOCOL_MAX_MSG_SIZE,
        }
    }

    /// Create a codec with custom magic bytes.
    pub fn with_magic(magic: [u8; 4]) -> Self {
        Self {
            magic,
            max_size: PROTOCOL_MAX_MSG_SIZE,
        }
    }

    /// First 4 bytes of Blake2b-256 over the payload.
    fn checksum(payload: &[u8]) -> [u8; 4] {
        let hash = Blake2b::<U32>::digest(payload);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash[0..4]);
        checksum
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Parse the header without consuming
        if src[0..4] != self.magic {
            return Err(NetworkError::InvalidMagic);
        }
        let code = src[4];
        let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        let checksum = [src[9], src[10], src[11], src[12]];

        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length);

        if Self::checksum(&payload) != checksum {
            return Err(NetworkError::ChecksumMismatch);
        }

        let code = MessageCode::try_from(code)?;
        Message::decode(code, &payload).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = NetworkError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = message.encode_payload();
        let length = payload.len();

        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        dst.reserve(HEADER_SIZE + length);
        dst.put_slice(&self.magic);
        dst.put_u8(message.code() as u8);
        dst.put_u32(length as u32);
        dst.put_slice(&Self::checksum(&payload));
        dst.put_slice(&payload);

        Ok(())
    }
}
