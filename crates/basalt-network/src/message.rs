//! Sync protocol messages.
//!
//! Message codes and payload shapes of the block/transaction sync
//! protocol. Version 63 adds the state and receipt messages; everything
//! else is shared by all supported versions.

use crate::{NetworkError, NetworkResult, MIN_FAST_VERSION};
use basalt_types::encoding::{
    get_biguint, get_bytes, get_hash, put_biguint, put_bytes, put_hash, vlq_decode, vlq_encode,
};
use basalt_types::{Block, Body, Hash256, Header, Receipt, Transaction};
use num_bigint::BigUint;

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageCode {
    /// Handshake status.
    Status = 0x00,
    /// Block availability announcements.
    NewBlockHashes = 0x01,
    /// Transaction broadcast.
    Transactions = 0x02,
    /// Header query.
    GetBlockHeaders = 0x03,
    /// Header reply.
    BlockHeaders = 0x04,
    /// Body query.
    GetBlockBodies = 0x05,
    /// Body reply.
    BlockBodies = 0x06,
    /// Full block propagation.
    NewBlock = 0x07,
    /// State trie node query (v63+).
    GetNodeData = 0x0d,
    /// State trie node reply (v63+).
    NodeData = 0x0e,
    /// Receipt query (v63+).
    GetReceipts = 0x0f,
    /// Receipt reply (v63+).
    Receipts = 0x10,
}

impl MessageCode {
    /// Lowest protocol version that understands this code.
    pub fn min_version(&self) -> u32 {
        match self {
            Self::GetNodeData | Self::NodeData | Self::GetReceipts | Self::Receipts => {
                MIN_FAST_VERSION
            }
            _ => 62,
        }
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Status),
            0x01 => Ok(Self::NewBlockHashes),
            0x02 => Ok(Self::Transactions),
            0x03 => Ok(Self::GetBlockHeaders),
            0x04 => Ok(Self::BlockHeaders),
            0x05 => Ok(Self::GetBlockBodies),
            0x06 => Ok(Self::BlockBodies),
            0x07 => Ok(Self::NewBlock),
            0x0d => Ok(Self::GetNodeData),
            0x0e => Ok(Self::NodeData),
            0x0f => Ok(Self::GetReceipts),
            0x10 => Ok(Self::Receipts),
            other => Err(NetworkError::InvalidMessageCode(other)),
        }
    }
}

/// Handshake status data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusData {
    /// Protocol version the sender speaks.
    pub protocol_version: u32,
    /// Network the sender belongs to.
    pub network_id: u64,
    /// Total difficulty at the sender's head.
    pub td: BigUint,
    /// Hash of the sender's head block.
    pub head: Hash256,
    /// Hash of the sender's genesis block.
    pub genesis: Hash256,
}

/// One block availability announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    /// Announced block hash.
    pub hash: Hash256,
    /// Announced block number.
    pub number: u64,
}

/// Query origin: either a hash or a canonical number.
///
/// On the wire both fields travel together; hash mode applies iff the
/// hash field is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    /// Start from the block with this hash.
    Hash(Hash256),
    /// Start from the canonical block at this number.
    Number(u64),
}

/// A header query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockHeaders {
    /// Block the query starts from.
    pub origin: HashOrNumber,
    /// Maximum number of headers wanted.
    pub amount: u64,
    /// Blocks to skip between consecutive headers.
    pub skip: u64,
    /// Walk towards genesis instead of the chain head.
    pub reverse: bool,
}

/// A propagated block with its claimed total difficulty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlockData {
    /// The propagated block.
    pub block: Block,
    /// Total difficulty including the block itself.
    pub td: BigUint,
}

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake status.
    Status(StatusData),
    /// Block availability announcements.
    NewBlockHashes(Vec<Announcement>),
    /// Transaction broadcast.
    Transactions(Vec<Transaction>),
    /// Header query.
    GetBlockHeaders(GetBlockHeaders),
    /// Header reply.
    BlockHeaders(Vec<Header>),
    /// Body query.
    GetBlockBodies(Vec<Hash256>),
    /// Body reply.
    BlockBodies(Vec<Body>),
    /// Full block propagation.
    NewBlock(NewBlockData),
    /// State trie node query.
    GetNodeData(Vec<Hash256>),
    /// State trie node reply.
    NodeData(Vec<Vec<u8>>),
    /// Receipt query.
    GetReceipts(Vec<Hash256>),
    /// Receipt reply, one batch per requested block.
    Receipts(Vec<Vec<Receipt>>),
}

fn put_hash_list(buf: &mut Vec<u8>, hashes: &[Hash256]) {
    vlq_encode(buf, hashes.len() as u64);
    for hash in hashes {
        put_hash(buf, hash);
    }
}

fn get_hash_list(data: &[u8], pos: usize) -> NetworkResult<(Vec<Hash256>, usize)> {
    let (count, mut pos) = vlq_decode(data, pos)?;
    let mut hashes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (hash, next) = get_hash(data, pos)?;
        hashes.push(hash);
        pos = next;
    }
    Ok((hashes, pos))
}

impl Message {
    /// The message's wire code.
    pub fn code(&self) -> MessageCode {
        match self {
            Message::Status(_) => MessageCode::Status,
            Message::NewBlockHashes(_) => MessageCode::NewBlockHashes,
            Message::Transactions(_) => MessageCode::Transactions,
            Message::GetBlockHeaders(_) => MessageCode::GetBlockHeaders,
            Message::BlockHeaders(_) => MessageCode::BlockHeaders,
            Message::GetBlockBodies(_) => MessageCode::GetBlockBodies,
            Message::BlockBodies(_) => MessageCode::BlockBodies,
            Message::NewBlock(_) => MessageCode::NewBlock,
            Message::GetNodeData(_) => MessageCode::GetNodeData,
            Message::NodeData(_) => MessageCode::NodeData,
            Message::GetReceipts(_) => MessageCode::GetReceipts,
            Message::Receipts(_) => MessageCode::Receipts,
        }
    }

    /// Encode the message payload (without the code byte).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Status(status) => {
                vlq_encode(&mut buf, status.protocol_version as u64);
                vlq_encode(&mut buf, status.network_id);
                put_biguint(&mut buf, &status.td);
                put_hash(&mut buf, &status.head);
                put_hash(&mut buf, &status.genesis);
            }
            Message::NewBlockHashes(announces) => {
                vlq_encode(&mut buf, announces.len() as u64);
                for announce in announces {
                    put_hash(&mut buf, &announce.hash);
                    vlq_encode(&mut buf, announce.number);
                }
            }
            Message::Transactions(txs) => {
                vlq_encode(&mut buf, txs.len() as u64);
                for tx in txs {
                    buf.extend_from_slice(&tx.serialize());
                }
            }
            Message::GetBlockHeaders(query) => {
                let (hash, number) = match query.origin {
                    HashOrNumber::Hash(hash) => (hash, 0),
                    HashOrNumber::Number(number) => (Hash256::ZERO, number),
                };
                put_hash(&mut buf, &hash);
                vlq_encode(&mut buf, number);
                vlq_encode(&mut buf, query.amount);
                vlq_encode(&mut buf, query.skip);
                buf.push(query.reverse as u8);
            }
            Message::BlockHeaders(headers) => {
                vlq_encode(&mut buf, headers.len() as u64);
                for header in headers {
                    buf.extend_from_slice(&header.serialize());
                }
            }
            Message::GetBlockBodies(hashes)
            | Message::GetNodeData(hashes)
            | Message::GetReceipts(hashes) => {
                put_hash_list(&mut buf, hashes);
            }
            Message::BlockBodies(bodies) => {
                vlq_encode(&mut buf, bodies.len() as u64);
                for body in bodies {
                    buf.extend_from_slice(&body.serialize());
                }
            }
            Message::NewBlock(data) => {
                buf.extend_from_slice(&data.block.serialize());
                put_biguint(&mut buf, &data.td);
            }
            Message::NodeData(nodes) => {
                vlq_encode(&mut buf, nodes.len() as u64);
                for node in nodes {
                    put_bytes(&mut buf, node);
                }
            }
            Message::Receipts(batches) => {
                vlq_encode(&mut buf, batches.len() as u64);
                for batch in batches {
                    vlq_encode(&mut buf, batch.len() as u64);
                    for receipt in batch {
                        buf.extend_from_slice(&receipt.serialize());
                    }
                }
            }
        }
        buf
    }

    /// Decode a message payload for the given code.
    pub fn decode(code: MessageCode, data: &[u8]) -> NetworkResult<Self> {
        let message = match code {
            MessageCode::Status => {
                let (protocol_version, pos) = vlq_decode(data, 0)?;
                let (network_id, pos) = vlq_decode(data, pos)?;
                let (td, pos) = get_biguint(data, pos)?;
                let (head, pos) = get_hash(data, pos)?;
                let (genesis, _) = get_hash(data, pos)?;
                Message::Status(StatusData {
                    protocol_version: protocol_version as u32,
                    network_id,
                    td,
                    head,
                    genesis,
                })
            }
            MessageCode::NewBlockHashes => {
                let (count, mut pos) = vlq_decode(data, 0)?;
                let mut announces = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (hash, next) = get_hash(data, pos)?;
                    let (number, next) = vlq_decode(data, next)?;
                    announces.push(Announcement { hash, number });
                    pos = next;
                }
                Message::NewBlockHashes(announces)
            }
            MessageCode::Transactions => {
                let (count, mut pos) = vlq_decode(data, 0)?;
                let mut txs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (tx, next) = Transaction::parse(data, pos)?;
                    txs.push(tx);
                    pos = next;
                }
                Message::Transactions(txs)
            }
            MessageCode::GetBlockHeaders => {
                let (hash, pos) = get_hash(data, 0)?;
                let (number, pos) = vlq_decode(data, pos)?;
                let (amount, pos) = vlq_decode(data, pos)?;
                let (skip, pos) = vlq_decode(data, pos)?;
                let reverse = *data
                    .get(pos)
                    .ok_or(basalt_types::encoding::EncodingError::Truncated(pos))?
                    != 0;
                let origin = if hash.is_zero() {
                    HashOrNumber::Number(number)
                } else {
                    HashOrNumber::Hash(hash)
                };
                Message::GetBlockHeaders(GetBlockHeaders {
                    origin,
                    amount,
                    skip,
                    reverse,
                })
            }
            MessageCode::BlockHeaders => {
                let (count, mut pos) = vlq_decode(data, 0)?;
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (header, next) = Header::parse(data, pos)?;
                    headers.push(header);
                    pos = next;
                }
                Message::BlockHeaders(headers)
            }
            MessageCode::GetBlockBodies => {
                let (hashes, _) = get_hash_list(data, 0)?;
                Message::GetBlockBodies(hashes)
            }
            MessageCode::BlockBodies => {
                let (count, mut pos) = vlq_decode(data, 0)?;
                let mut bodies = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (body, next) = Body::parse(data, pos)?;
                    bodies.push(body);
                    pos = next;
                }
                Message::BlockBodies(bodies)
            }
            MessageCode::NewBlock => {
                let (block, pos) = Block::parse(data, 0)?;
                let (td, _) = get_biguint(data, pos)?;
                Message::NewBlock(NewBlockData { block, td })
            }
            MessageCode::GetNodeData => {
                let (hashes, _) = get_hash_list(data, 0)?;
                Message::GetNodeData(hashes)
            }
            MessageCode::NodeData => {
                let (count, mut pos) = vlq_decode(data, 0)?;
                let mut nodes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (node, next) = get_bytes(data, pos)?;
                    nodes.push(node);
                    pos = next;
                }
                Message::NodeData(nodes)
            }
            MessageCode::GetReceipts => {
                let (hashes, _) = get_hash_list(data, 0)?;
                Message::GetReceipts(hashes)
            }
            MessageCode::Receipts => {
                let (batch_count, mut pos) = vlq_decode(data, 0)?;
                let mut batches = Vec::with_capacity(batch_count as usize);
                for _ in 0..batch_count {
                    let (count, mut inner) = vlq_decode(data, pos)?;
                    let mut batch = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let (receipt, next) = Receipt::parse(data, inner)?;
                        batch.push(receipt);
                        inner = next;
                    }
                    batches.push(batch);
                    pos = inner;
                }
                Message::Receipts(batches)
            }
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_types::{empty_root, Header};

    fn sample_header(number: u64) -> Header {
        Header::empty(number, Hash256::of(b"parent"), BigUint::from(100u32))
    }

    fn roundtrip(message: Message) {
        let code = message.code();
        let payload = message.encode_payload();
        let decoded = Message::decode(code, &payload).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_status_roundtrip() {
        roundtrip(Message::Status(StatusData {
            protocol_version: 63,
            network_id: 7,
            td: BigUint::from(123_456u64),
            head: Hash256::of(b"head"),
            genesis: Hash256::of(b"genesis"),
        }));
    }

    #[test]
    fn test_new_block_hashes_roundtrip() {
        roundtrip(Message::NewBlockHashes(vec![
            Announcement {
                hash: Hash256::of(b"a"),
                number: 1,
            },
            Announcement {
                hash: Hash256::of(b"b"),
                number: 2,
            },
        ]));
    }

    #[test]
    fn test_transactions_roundtrip() {
        roundtrip(Message::Transactions(vec![
            Transaction::new(0, Hash256::of(b"x"), 5, vec![]),
            Transaction::new(1, Hash256::of(b"y"), 6, vec![1, 2]),
        ]));
    }

    #[test]
    fn test_get_headers_hash_mode() {
        let query = GetBlockHeaders {
            origin: HashOrNumber::Hash(Hash256::of(b"origin")),
            amount: 4,
            skip: 1,
            reverse: false,
        };
        roundtrip(Message::GetBlockHeaders(query));
    }

    #[test]
    fn test_get_headers_number_mode() {
        let query = GetBlockHeaders {
            origin: HashOrNumber::Number(100),
            amount: 192,
            skip: 0,
            reverse: true,
        };
        roundtrip(Message::GetBlockHeaders(query));
    }

    #[test]
    fn test_block_headers_roundtrip() {
        roundtrip(Message::BlockHeaders(vec![
            sample_header(1),
            sample_header(2),
        ]));
    }

    #[test]
    fn test_bodies_roundtrip() {
        let body = Body {
            transactions: vec![Transaction::new(0, Hash256::of(b"to"), 1, vec![7])],
            uncles: vec![sample_header(3)],
        };
        roundtrip(Message::GetBlockBodies(vec![Hash256::of(b"h")]));
        roundtrip(Message::BlockBodies(vec![body, Body::default()]));
    }

    #[test]
    fn test_new_block_roundtrip() {
        let mut header = sample_header(9);
        header.tx_root = empty_root();
        let block = Block::new(header, Body::default());
        roundtrip(Message::NewBlock(NewBlockData {
            block,
            td: BigUint::from(999u32),
        }));
    }

    #[test]
    fn test_fast_messages_roundtrip() {
        roundtrip(Message::GetNodeData(vec![Hash256::of(b"n")]));
        roundtrip(Message::NodeData(vec![vec![1, 2, 3], vec![]]));
        roundtrip(Message::GetReceipts(vec![Hash256::of(b"r")]));
        roundtrip(Message::Receipts(vec![
            vec![Receipt::new(1, 21_000, vec![])],
            vec![],
        ]));
    }

    #[test]
    fn test_version_gating() {
        assert_eq!(MessageCode::GetNodeData.min_version(), 63);
        assert_eq!(MessageCode::Receipts.min_version(), 63);
        assert_eq!(MessageCode::NewBlock.min_version(), 62);
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(matches!(
            MessageCode::try_from(0x0cu8),
            Err(NetworkError::InvalidMessageCode(0x0c))
        ));
    }

    #[test]
    fn test_origin_discriminator_follows_hash() {
        // A zero hash on the wire selects number mode even if a number
        // is also present.
        let query = GetBlockHeaders {
            origin: HashOrNumber::Number(0),
            amount: 1,
            skip: 0,
            reverse: false,
        };
        let payload = Message::GetBlockHeaders(query).encode_payload();
        let decoded = Message::decode(MessageCode::GetBlockHeaders, &payload).unwrap();
        match decoded {
            Message::GetBlockHeaders(q) => assert_eq!(q.origin, HashOrNumber::Number(0)),
            other => panic!("unexpected message {:?}", other),
        }
    }
}
