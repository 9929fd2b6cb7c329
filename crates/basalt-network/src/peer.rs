//! Per-peer state and message plumbing.
//!
//! Each connected remote is represented by one [`Peer`]: the head
//! snapshot it last advertised, bounded sets of items it is known to
//! have, and two bounded fan-out queues drained by a per-peer broadcast
//! task. The write half of the connection is owned by a writer task fed
//! through a channel, so request/reply helpers never touch the socket
//! directly.

use crate::message::{
    Announcement, GetBlockHeaders, HashOrNumber, Message, NewBlockData, StatusData,
};
use crate::{FrameCodec, NetworkError, NetworkResult, HANDSHAKE_TIMEOUT, PROTOCOL_VERSIONS};
use basalt_types::{Block, Body, Hash256, Header, Receipt, Transaction};
use futures::{SinkExt, StreamExt};
use num_bigint::BigUint;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

/// Maximum block hashes a peer is tracked to know.
pub const MAX_KNOWN_BLOCKS: usize = 1024;

/// Maximum transaction hashes a peer is tracked to know.
pub const MAX_KNOWN_TXS: usize = 32768;

/// Capacity of the per-peer block fan-out queue.
const MAX_QUEUED_BLOCKS: usize = 4;

/// Capacity of the per-peer transaction fan-out queue (batches).
const MAX_QUEUED_TX_BATCHES: usize = 128;

/// Capacity of the channel feeding the writer task.
const OUTBOUND_CHANNEL_SIZE: usize = 64;

/// A bounded set of recently seen hashes with drop-oldest eviction.
struct KnownSet {
    set: HashSet<Hash256>,
    order: VecDeque<Hash256>,
    cap: usize,
}

impl KnownSet {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn insert(&mut self, hash: Hash256) {
        if !self.set.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.set.contains(hash)
    }
}

/// An entry in the per-peer block fan-out queue.
#[derive(Debug, Clone)]
pub enum BlockQueueItem {
    /// Send the full block with its total difficulty.
    Propagate(Block, BigUint),
    /// Send only the availability announcement.
    Announce(Hash256, u64),
}

/// A bounded queue that drops its oldest entry instead of blocking the
/// producer.
struct DropOldestQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    cap: usize,
}

impl<T> DropOldestQueue<T> {
    fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap,
        }
    }

    /// Push an item, evicting the oldest when full. Returns whether an
    /// entry was dropped.
    fn push(&self, item: T) -> bool {
        let dropped = {
            let mut queue = self.inner.lock();
            let dropped = if queue.len() >= self.cap {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Wait for and take the next item.
    async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.inner.lock().pop_front() {
                return item;
            }
            notified.await;
        }
    }
}

/// One connected remote peer.
pub struct Peer {
    id: String,
    version: u32,
    trusted: bool,
    head: RwLock<(Hash256, BigUint)>,
    known_blocks: Mutex<KnownSet>,
    known_txs: Mutex<KnownSet>,
    queued_blocks: DropOldestQueue<BlockQueueItem>,
    queued_txs: DropOldestQueue<Vec<Transaction>>,
    out: mpsc::Sender<Message>,
    fork_timer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Peer {
    /// Create a peer after a completed handshake.
    ///
    /// `node_id` is the remote's full node id; the peer id is the hex
    /// rendering of its first 8 bytes. Returns the peer and the receiver
    /// to hand to [`Peer::run_writer`].
    pub fn new(
        node_id: &[u8],
        status: &StatusData,
        trusted: bool,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (out, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        let prefix = &node_id[..node_id.len().min(8)];
        let peer = Arc::new(Self {
            id: hex::encode(prefix),
            version: status.protocol_version,
            trusted,
            head: RwLock::new((status.head, status.td.clone())),
            known_blocks: Mutex::new(KnownSet::new(MAX_KNOWN_BLOCKS)),
            known_txs: Mutex::new(KnownSet::new(MAX_KNOWN_TXS)),
            queued_blocks: DropOldestQueue::new(MAX_QUEUED_BLOCKS),
            queued_txs: DropOldestQueue::new(MAX_QUEUED_TX_BATCHES),
            out,
            fork_timer: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        (peer, out_rx)
    }

    /// The peer id (hex of the node id's first 8 bytes).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether the peer bypasses the connection limit.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Last advertised head hash and total difficulty.
    pub fn head(&self) -> (Hash256, BigUint) {
        self.head.read().clone()
    }

    /// Total difficulty the peer last advertised.
    pub fn td(&self) -> BigUint {
        self.head.read().1.clone()
    }

    /// Update the head snapshot.
    pub fn set_head(&self, hash: Hash256, td: BigUint) {
        *self.head.write() = (hash, td);
    }

    /// Record that the peer has the given block.
    pub fn mark_block(&self, hash: Hash256) {
        self.known_blocks.lock().insert(hash);
    }

    /// Record that the peer has the given transaction.
    pub fn mark_transaction(&self, hash: Hash256) {
        self.known_txs.lock().insert(hash);
    }

    /// Whether the peer is known to have the block.
    pub fn knows_block(&self, hash: &Hash256) -> bool {
        self.known_blocks.lock().contains(hash)
    }

    /// Whether the peer is known to have the transaction.
    pub fn knows_transaction(&self, hash: &Hash256) -> bool {
        self.known_txs.lock().contains(hash)
    }

    // ---- fork challenge timer ----

    /// Arm the fork-challenge timer with a task that fires on expiry.
    pub fn arm_fork_timer(&self, handle: JoinHandle<()>) {
        let mut slot = self.fork_timer.lock();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Disarm the fork-challenge timer. Returns whether it was armed.
    pub fn disarm_fork_timer(&self) -> bool {
        match self.fork_timer.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether the fork-challenge timer is armed.
    pub fn fork_timer_armed(&self) -> bool {
        self.fork_timer.lock().is_some()
    }

    // ---- lifecycle ----

    /// Signal the peer's tasks to shut down.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.disarm_fork_timer();
            self.close_notify.notify_waiters();
        }
    }

    /// Whether [`Peer::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve once the peer is closed.
    pub async fn closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let notified = self.close_notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a concurrent close cannot
            // slip between the flag test and the await
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    // ---- direct sends (replies and requests) ----

    /// Queue a message on the writer channel.
    pub async fn send(&self, message: Message) -> NetworkResult<()> {
        self.out
            .send(message)
            .await
            .map_err(|_| NetworkError::PeerGone)
    }

    /// Reply with a batch of headers.
    pub async fn send_block_headers(&self, headers: Vec<Header>) -> NetworkResult<()> {
        self.send(Message::BlockHeaders(headers)).await
    }

    /// Reply with a batch of block bodies.
    pub async fn send_block_bodies(&self, bodies: Vec<Body>) -> NetworkResult<()> {
        self.send(Message::BlockBodies(bodies)).await
    }

    /// Reply with a batch of state trie nodes.
    pub async fn send_node_data(&self, nodes: Vec<Vec<u8>>) -> NetworkResult<()> {
        self.send(Message::NodeData(nodes)).await
    }

    /// Reply with receipt batches.
    pub async fn send_receipts(&self, receipts: Vec<Vec<Receipt>>) -> NetworkResult<()> {
        self.send(Message::Receipts(receipts)).await
    }

    /// Send a transaction batch, marking each as known to the peer.
    pub async fn send_transactions(&self, txs: Vec<Transaction>) -> NetworkResult<()> {
        for tx in &txs {
            self.mark_transaction(tx.hash());
        }
        self.send(Message::Transactions(txs)).await
    }

    /// Request a single header by hash.
    pub async fn request_one_header(&self, hash: Hash256) -> NetworkResult<()> {
        trace!(peer = %self.id, hash = %hash.short(), "Fetching single header");
        self.send(Message::GetBlockHeaders(GetBlockHeaders {
            origin: HashOrNumber::Hash(hash),
            amount: 1,
            skip: 0,
            reverse: false,
        }))
        .await
    }

    /// Request a batch of headers starting from a hash.
    pub async fn request_headers_by_hash(
        &self,
        origin: Hash256,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> NetworkResult<()> {
        trace!(peer = %self.id, origin = %origin.short(), amount, skip, reverse, "Fetching headers");
        self.send(Message::GetBlockHeaders(GetBlockHeaders {
            origin: HashOrNumber::Hash(origin),
            amount,
            skip,
            reverse,
        }))
        .await
    }

    /// Request a batch of headers starting from a canonical number.
    pub async fn request_headers_by_number(
        &self,
        origin: u64,
        amount: u64,
        skip: u64,
        reverse: bool,
    ) -> NetworkResult<()> {
        trace!(peer = %self.id, origin, amount, skip, reverse, "Fetching headers");
        self.send(Message::GetBlockHeaders(GetBlockHeaders {
            origin: HashOrNumber::Number(origin),
            amount,
            skip,
            reverse,
        }))
        .await
    }

    /// Request block bodies.
    pub async fn request_bodies(&self, hashes: Vec<Hash256>) -> NetworkResult<()> {
        trace!(peer = %self.id, count = hashes.len(), "Fetching block bodies");
        self.send(Message::GetBlockBodies(hashes)).await
    }

    /// Request state trie nodes.
    pub async fn request_node_data(&self, hashes: Vec<Hash256>) -> NetworkResult<()> {
        trace!(peer = %self.id, count = hashes.len(), "Fetching state data");
        self.send(Message::GetNodeData(hashes)).await
    }

    /// Request receipts.
    pub async fn request_receipts(&self, hashes: Vec<Hash256>) -> NetworkResult<()> {
        trace!(peer = %self.id, count = hashes.len(), "Fetching receipts");
        self.send(Message::GetReceipts(hashes)).await
    }

    // ---- async fan-out ----

    /// Queue a full-block propagation, marking the block known.
    pub fn async_send_new_block(&self, block: Block, td: BigUint) {
        self.mark_block(block.hash());
        if self.queued_blocks.push(BlockQueueItem::Propagate(block, td)) {
            debug!(peer = %self.id, "Block queue full, dropped oldest entry");
        }
    }

    /// Queue a hash announcement, marking the block known.
    pub fn async_send_new_block_hash(&self, hash: Hash256, number: u64) {
        self.mark_block(hash);
        if self.queued_blocks.push(BlockQueueItem::Announce(hash, number)) {
            debug!(peer = %self.id, "Block queue full, dropped oldest entry");
        }
    }

    /// Queue a transaction batch, marking each as known.
    pub fn async_send_transactions(&self, txs: Vec<Transaction>) {
        for tx in &txs {
            self.mark_transaction(tx.hash());
        }
        if self.queued_txs.push(txs) {
            debug!(peer = %self.id, "Transaction queue full, dropped oldest batch");
        }
    }

    /// Drain the fan-out queues into the writer channel until the peer
    /// closes.
    pub async fn run_broadcast(self: Arc<Self>) {
        loop {
            let result = tokio::select! {
                item = self.queued_blocks.pop() => match item {
                    BlockQueueItem::Propagate(block, td) => {
                        self.send(Message::NewBlock(NewBlockData { block, td })).await
                    }
                    BlockQueueItem::Announce(hash, number) => {
                        self.send(Message::NewBlockHashes(vec![Announcement { hash, number }]))
                            .await
                    }
                },
                txs = self.queued_txs.pop() => {
                    self.send(Message::Transactions(txs)).await
                }
                _ = self.closed() => return,
            };
            if result.is_err() {
                return;
            }
        }
    }

    /// Drive the write half of the connection from the outbound channel.
    pub async fn run_writer<S>(
        mut rx: mpsc::Receiver<Message>,
        mut sink: futures::stream::SplitSink<Framed<S, FrameCodec>, Message>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(message) = rx.recv().await {
            if let Err(err) = sink.send(message).await {
                debug!(error = %err, "Peer write failed");
                return;
            }
        }
    }

    /// Perform the status exchange on a fresh connection.
    ///
    /// Sends our status, requires the remote's first message to be a
    /// status, and validates network id, genesis and protocol version.
    pub async fn handshake<S>(
        framed: &mut Framed<S, FrameCodec>,
        ours: StatusData,
    ) -> NetworkResult<StatusData>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = async {
            framed.send(Message::Status(ours.clone())).await?;
            match framed.next().await {
                Some(Ok(Message::Status(theirs))) => Ok(theirs),
                Some(Ok(other)) => Err(NetworkError::NoStatusMessage(other.code() as u8)),
                Some(Err(err)) => Err(err),
                None => Err(NetworkError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                ))),
            }
        };
        let theirs = tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
            .await
            .map_err(|_| NetworkError::HandshakeTimeout)??;

        if theirs.network_id != ours.network_id {
            return Err(NetworkError::NetworkIdMismatch {
                ours: ours.network_id,
                theirs: theirs.network_id,
            });
        }
        if theirs.genesis != ours.genesis {
            return Err(NetworkError::GenesisMismatch {
                ours: ours.genesis.to_string(),
                theirs: theirs.genesis.to_string(),
            });
        }
        if !PROTOCOL_VERSIONS.contains(&theirs.protocol_version) {
            return Err(NetworkError::UnsupportedVersion(theirs.protocol_version));
        }
        Ok(theirs)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (head, td) = self.head();
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("head", &head.short())
            .field("td", &td)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(td: u32) -> StatusData {
        StatusData {
            protocol_version: 63,
            network_id: 1,
            td: BigUint::from(td),
            head: Hash256::of(b"head"),
            genesis: Hash256::of(b"genesis"),
        }
    }

    fn make_peer() -> (Arc<Peer>, mpsc::Receiver<Message>) {
        Peer::new(&[1, 2, 3, 4, 5, 6, 7, 8, 9], &status(100), false)
    }

    #[test]
    fn test_peer_id_is_hex_prefix() {
        let (peer, _rx) = make_peer();
        assert_eq!(peer.id(), "0102030405060708");
    }

    #[test]
    fn test_known_set_eviction() {
        let mut known = KnownSet::new(2);
        let a = Hash256::of(b"a");
        let b = Hash256::of(b"b");
        let c = Hash256::of(b"c");

        known.insert(a);
        known.insert(b);
        known.insert(c);

        assert!(!known.contains(&a));
        assert!(known.contains(&b));
        assert!(known.contains(&c));
    }

    #[test]
    fn test_known_marking() {
        let (peer, _rx) = make_peer();
        let hash = Hash256::of(b"block");

        assert!(!peer.knows_block(&hash));
        peer.mark_block(hash);
        assert!(peer.knows_block(&hash));
    }

    #[test]
    fn test_head_update() {
        let (peer, _rx) = make_peer();
        let new_head = Hash256::of(b"better");
        peer.set_head(new_head, BigUint::from(500u32));

        let (head, td) = peer.head();
        assert_eq!(head, new_head);
        assert_eq!(td, BigUint::from(500u32));
    }

    #[tokio::test]
    async fn test_queue_drops_oldest() {
        let queue: DropOldestQueue<u32> = DropOldestQueue::new(2);
        assert!(!queue.push(1));
        assert!(!queue.push(2));
        assert!(queue.push(3)); // evicts 1

        assert_eq!(queue.pop().await, 2);
        assert_eq!(queue.pop().await, 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_wakes_waiters() {
        let (peer, _rx) = make_peer();
        let waiter = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.closed().await })
        };
        peer.close();
        peer.close();
        waiter.await.unwrap();
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_async_send_marks_known() {
        let (peer, _rx) = make_peer();
        let tx = Transaction::new(0, Hash256::of(b"to"), 1, Vec::new());
        let hash = tx.hash();

        peer.async_send_transactions(vec![tx]);
        assert!(peer.knows_transaction(&hash));
    }

    #[tokio::test]
    async fn test_handshake_rejects_network_mismatch() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client_framed = Framed::new(client, FrameCodec::new());
        let mut server_framed = Framed::new(server, FrameCodec::new());

        let server_task = tokio::spawn(async move {
            let mut theirs = status(50);
            theirs.network_id = 2;
            server_framed
                .send(Message::Status(theirs))
                .await
                .unwrap();
            // Keep the stream alive until the client finishes
            let _ = server_framed.next().await;
        });

        let result = Peer::handshake(&mut client_framed, status(100)).await;
        assert!(matches!(
            result,
            Err(NetworkError::NetworkIdMismatch { ours: 1, theirs: 2 })
        ));
        drop(client_framed);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client_framed = Framed::new(client, FrameCodec::new());
        let mut server_framed = Framed::new(server, FrameCodec::new());

        let server_task = tokio::spawn(async move {
            server_framed.send(Message::Status(status(50))).await.unwrap();
            let _ = server_framed.next().await;
        });

        let theirs = Peer::handshake(&mut client_framed, status(100)).await.unwrap();
        assert_eq!(theirs.td, BigUint::from(50u32));
        drop(client_framed);
        server_task.await.unwrap();
    }
}
