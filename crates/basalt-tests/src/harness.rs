//! Test harness.
//!
//! Drives a protocol manager over in-memory duplex pipes. A [`Remote`]
//! plays the other end of one connection with raw frames, either
//! scripted by the test or handed to [`serve_chain`] to answer requests
//! from a source chain like a live node would.

use crate::generators::genesis;
use basalt_network::{
    FrameCodec, GetBlockHeaders, HashOrNumber, Message, NetworkResult, StatusData,
    PROTOCOL_VERSIONS,
};
use basalt_sync::{ManagerConfig, ProtocolManager};
use basalt_types::{
    BasicTxPool, BlockChain, Engine, EventBus, Hash256, Header, MemoryChain, NewMinedBlockEvent,
    NoopEngine, StateSink, TxPool,
};
use futures::{SinkExt, StreamExt};
use num_bigint::BigUint;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// Default wait for scripted exchanges.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A started node under test.
pub struct TestNet {
    /// The manager under test.
    pub manager: Arc<ProtocolManager>,
    /// Its local chain.
    pub chain: Arc<MemoryChain>,
    /// Its transaction pool.
    pub pool: Arc<BasicTxPool>,
    /// Its mined-block event bus.
    pub mined_events: Arc<EventBus<NewMinedBlockEvent>>,
}

impl TestNet {
    /// Start a node with an accept-everything engine.
    pub fn start(config: ManagerConfig) -> Self {
        Self::start_with_engine(config, Arc::new(NoopEngine))
    }

    /// Start a node with a specific consensus engine.
    pub fn start_with_engine(config: ManagerConfig, engine: Arc<dyn Engine>) -> Self {
        let chain = Arc::new(MemoryChain::new(genesis()));
        Self::start_on_chain(config, engine, chain)
    }

    /// Start a node over an existing chain.
    pub fn start_on_chain(
        config: ManagerConfig,
        engine: Arc<dyn Engine>,
        chain: Arc<MemoryChain>,
    ) -> Self {
        let pool = Arc::new(BasicTxPool::new());
        let mined_events = EventBus::new();
        let manager = ProtocolManager::new(
            config,
            Arc::clone(&chain) as Arc<dyn BlockChain>,
            engine,
            Arc::clone(&pool) as Arc<dyn TxPool>,
            Arc::clone(&chain) as Arc<dyn StateSink>,
            Arc::clone(&mined_events),
        );
        manager.start();
        Self {
            manager,
            chain,
            pool,
            mined_events,
        }
    }

    /// Stop the node.
    pub async fn stop(&self) {
        self.manager.stop().await;
    }
}

/// A remote status advertising the same genesis as the test chain.
pub fn remote_status(td: u32, head: Hash256) -> StatusData {
    StatusData {
        protocol_version: PROTOCOL_VERSIONS[0],
        network_id: 1,
        td: BigUint::from(td),
        head,
        genesis: genesis().hash(),
    }
}

/// The remote end of one peer connection.
pub struct Remote {
    framed: Framed<DuplexStream, FrameCodec>,
    /// The manager-side handler task for this connection.
    pub session: JoinHandle<NetworkResult<()>>,
    /// The node's status, if the handshake got that far.
    pub node_status: Option<StatusData>,
}

impl Remote {
    /// Connect to the node, sending `status` as our handshake.
    ///
    /// Returns once the exchange settles; `node_status` is `None` when
    /// the node refused the connection before sending its status.
    pub async fn connect(net: &TestNet, seed: u8, status: StatusData, trusted: bool) -> Remote {
        let (local, remote) = tokio::io::duplex(1 << 20);
        let manager = Arc::clone(&net.manager);
        let node_id = vec![seed; 8];
        let session = tokio::spawn(async move { manager.handle(local, &node_id, trusted).await });

        let mut framed = Framed::new(remote, FrameCodec::new());
        // The node may refuse before reading anything (capacity, shut
        // down); the send failure then surfaces as a missing status
        let _ = framed.send(Message::Status(status)).await;

        let node_status = match timeout(RECV_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(Message::Status(status)))) => Some(status),
            _ => None,
        };

        Remote {
            framed,
            session,
            node_status,
        }
    }

    /// The peer id the node derived for this connection.
    pub fn peer_id(seed: u8) -> String {
        hex::encode([seed; 8])
    }

    /// Send a message to the node.
    pub async fn send(&mut self, message: Message) {
        self.framed.send(message).await.expect("send to node");
    }

    /// Receive the next message, if any arrives in time.
    pub async fn recv(&mut self) -> Option<Message> {
        match timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(message))) => Some(message),
            _ => None,
        }
    }

    /// Receive messages until one satisfies the predicate.
    pub async fn recv_until(&mut self, pred: impl Fn(&Message) -> bool) -> Option<Message> {
        loop {
            let message = self.recv().await?;
            if pred(&message) {
                return Some(message);
            }
        }
    }

    /// Tear down the remote side of the connection.
    pub fn close(self) -> JoinHandle<NetworkResult<()>> {
        drop(self.framed);
        self.session
    }
}

/// Answer the node's requests from a source chain until the connection
/// closes. Mirrors what a fully synced remote node would serve.
pub async fn serve_chain(mut remote: Remote, source: Arc<MemoryChain>) -> NetworkResult<()> {
    while let Ok(Some(frame)) = timeout(Duration::from_secs(30), remote.framed.next()).await {
        let Ok(message) = frame else { break };
        match message {
            Message::GetBlockHeaders(query) => {
                let headers = headers_for(&source, &query);
                remote.send(Message::BlockHeaders(headers)).await;
            }
            Message::GetBlockBodies(hashes) => {
                let bodies = hashes
                    .iter()
                    .filter_map(|hash| source.block_by_hash(hash).map(|b| b.body))
                    .collect();
                remote.send(Message::BlockBodies(bodies)).await;
            }
            Message::GetReceipts(hashes) => {
                let receipts = hashes
                    .iter()
                    .filter_map(|hash| source.receipts_by_hash(hash))
                    .collect();
                remote.send(Message::Receipts(receipts)).await;
            }
            Message::GetNodeData(hashes) => {
                let nodes = hashes
                    .iter()
                    .filter_map(|hash| source.trie_node(hash))
                    .collect();
                remote.send(Message::NodeData(nodes)).await;
            }
            // Propagations and announcements need no reply
            _ => {}
        }
    }
    remote.session.await.unwrap_or(Ok(()))
}

/// Serve a header query from a chain, forward or reverse with skips.
pub fn headers_for(source: &MemoryChain, query: &GetBlockHeaders) -> Vec<Header> {
    let mut headers = Vec::new();
    let mut next = match query.origin {
        HashOrNumber::Hash(hash) => source.header_by_hash(&hash).map(|h| h.number),
        HashOrNumber::Number(number) => Some(number),
    };
    while headers.len() < query.amount as usize {
        let Some(number) = next else { break };
        let Some(header) = source.header_by_number(number) else {
            break;
        };
        headers.push(header);
        next = if query.reverse {
            number.checked_sub(query.skip + 1)
        } else {
            number.checked_add(query.skip + 1)
        };
    }
    headers
}

/// Poll until the condition holds or the deadline passes.
pub async fn wait_until<F>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
