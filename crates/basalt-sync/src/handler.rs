//! The protocol manager.
//!
//! Accepts fresh connections from the transport layer, performs the
//! status handshake and the fork challenge, runs one read loop per
//! peer, dispatches inbound messages to the fetcher, downloader, chain
//! and pool, and fans mined blocks and pool transactions out to the
//! network.

use crate::downloader::{Downloader, SyncMode};
use crate::fetcher::{Broadcaster, Demoter, Fetcher, FetcherHandle, Inserter};
use crate::{
    EST_HEADER_SIZE, FORK_CHALLENGE_TIMEOUT, MAX_BLOCK_FETCH, MAX_HEADER_FETCH, MAX_RECEIPT_FETCH,
    MAX_STATE_FETCH, SOFT_RESPONSE_LIMIT, TX_CHANNEL_SIZE,
};
use basalt_network::{
    FrameCodec, HashOrNumber, Message, NetworkError, NetworkResult, Peer, PeerSet,
    ReputationTable, StatusData, PROTOCOL_VERSIONS,
};
use basalt_types::encoding::EncodingError;
use basalt_types::{
    empty_root, Block, BlockChain, Engine, EventBus, Header, NewMinedBlockEvent, NewTxsEvent,
    StateSink, Subscription, Transaction, TxPool,
};
use futures::StreamExt;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

/// Protocol manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Network the node participates in.
    pub network_id: u64,
    /// Hard-fork block whose header lineage peers must prove, if any.
    pub fork_block: Option<u64>,
    /// Initial synchronization strategy.
    pub sync_mode: SyncMode,
    /// Maximum untrusted peer count.
    pub max_peers: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            fork_block: None,
            sync_mode: SyncMode::Full,
            max_peers: 25,
        }
    }
}

/// Counts live peer handler tasks for graceful shutdown.
struct TaskGroup {
    active: AtomicUsize,
    notify: Notify,
}

impl TaskGroup {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    fn guard(&self) -> TaskGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        TaskGuard { group: self }
    }

    async fn wait(&self) {
        loop {
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so the last guard dropping
            // concurrently cannot be missed
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct TaskGuard<'a> {
    group: &'a TaskGroup,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        if self.group.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.group.notify.notify_waiters();
        }
    }
}

/// The sync protocol orchestrator.
pub struct ProtocolManager {
    pub(crate) config: ManagerConfig,
    pub(crate) chain: Arc<dyn BlockChain>,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) pool: Arc<dyn TxPool>,
    mined_events: Arc<EventBus<NewMinedBlockEvent>>,
    pub(crate) peers: Arc<PeerSet>,
    pub(crate) reputation: ReputationTable,
    pub(crate) downloader: Arc<Downloader>,
    fetcher: Mutex<Option<FetcherHandle>>,

    /// Whether fast sync is enabled; cleared once blocks exist.
    pub(crate) fast_sync: AtomicBool,
    /// Whether initial sync finished and remote transactions are accepted.
    pub(crate) accept_txs: AtomicBool,

    quit_tx: watch::Sender<bool>,
    stop_events_tx: watch::Sender<bool>,
    pub(crate) no_more_peers_tx: mpsc::Sender<()>,
    no_more_peers_rx: Mutex<Option<mpsc::Receiver<()>>>,
    pub(crate) new_peer_tx: mpsc::Sender<String>,
    new_peer_rx: Mutex<Option<mpsc::Receiver<String>>>,
    txsync_tx: mpsc::Sender<String>,
    txsync_rx: Mutex<Option<mpsc::Receiver<String>>>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    handlers: TaskGroup,
}

impl ProtocolManager {
    /// Create a protocol manager over the given collaborators.
    ///
    /// Fast sync silently degrades to full sync when the local chain
    /// already has blocks.
    pub fn new(
        config: ManagerConfig,
        chain: Arc<dyn BlockChain>,
        engine: Arc<dyn Engine>,
        pool: Arc<dyn TxPool>,
        state: Arc<dyn StateSink>,
        mined_events: Arc<EventBus<NewMinedBlockEvent>>,
    ) -> Arc<Self> {
        let mut fast_sync = config.sync_mode == SyncMode::Fast;
        if fast_sync && chain.current_header().number > 0 {
            warn!("Blockchain not empty, fast sync disabled");
            fast_sync = false;
        }

        let peers = Arc::new(PeerSet::new());
        let downloader = Arc::new(Downloader::new(
            Arc::clone(&chain),
            state,
            Arc::clone(&peers),
        ));

        let (quit_tx, _) = watch::channel(false);
        let (stop_events_tx, _) = watch::channel(false);
        let (no_more_peers_tx, no_more_peers_rx) = mpsc::channel(1);
        let (new_peer_tx, new_peer_rx) = mpsc::channel(16);
        let (txsync_tx, txsync_rx) = mpsc::channel(16);

        Arc::new(Self {
            config,
            chain,
            engine,
            pool,
            mined_events,
            peers,
            reputation: ReputationTable::new(),
            downloader,
            fetcher: Mutex::new(None),
            fast_sync: AtomicBool::new(fast_sync),
            accept_txs: AtomicBool::new(false),
            quit_tx,
            stop_events_tx,
            no_more_peers_tx,
            no_more_peers_rx: Mutex::new(Some(no_more_peers_rx)),
            new_peer_tx,
            new_peer_rx: Mutex::new(Some(new_peer_rx)),
            txsync_tx,
            txsync_rx: Mutex::new(Some(txsync_rx)),
            tasks: Mutex::new(Vec::new()),
            handlers: TaskGroup::new(),
        })
    }

    /// Launch the fetcher and the broadcast, syncer and tx-sync loops.
    pub fn start(self: &Arc<Self>) {
        info!(network = self.config.network_id, "Starting sync protocol");

        // Single-block fetcher
        let weak = Arc::downgrade(self);
        let inserter: Inserter = Arc::new(move |blocks: Vec<Block>| {
            let Some(manager) = weak.upgrade() else {
                return Err("manager stopped".to_string());
            };
            // Deny weird blocks while fast syncing
            if manager.fast_sync.load(Ordering::SeqCst) {
                if let Some(first) = blocks.first() {
                    warn!(
                        number = first.number(),
                        hash = %first.hash().short(),
                        "Discarded bad propagated block"
                    );
                }
                return Ok(0);
            }
            // Mark initial sync done on any fetcher import
            manager.accept_txs.store(true, Ordering::SeqCst);
            manager
                .chain
                .insert_chain(blocks)
                .map_err(|err| err.to_string())
        });
        let weak = Arc::downgrade(self);
        let broadcaster: Broadcaster = Arc::new(move |block: &Block, propagate: bool| {
            if let Some(manager) = weak.upgrade() {
                manager.broadcast_block(block, propagate);
            }
        });
        let weak = Arc::downgrade(self);
        let demoter: Demoter = Arc::new(move |id: &str, amount: u32| {
            if let Some(manager) = weak.upgrade() {
                manager.demote_peer(id, amount);
            }
        });

        let (handle, fetcher) = Fetcher::new(
            Arc::clone(&self.chain),
            Arc::clone(&self.engine),
            Arc::clone(&self.peers),
            inserter,
            broadcaster,
            demoter,
        );
        *self.fetcher.lock() = Some(handle);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(fetcher.run(self.quit_tx.subscribe())));

        // Broadcast transactions
        let txs_sub = self.pool.subscribe_new_txs(TX_CHANNEL_SIZE);
        tasks.push(tokio::spawn(Arc::clone(self).tx_broadcast_loop(
            txs_sub,
            self.stop_events_tx.subscribe(),
        )));

        // Broadcast mined blocks
        let mined_sub = self.mined_events.subscribe(16);
        tasks.push(tokio::spawn(Arc::clone(self).mined_broadcast_loop(
            mined_sub,
            self.stop_events_tx.subscribe(),
        )));

        // Sync handlers
        if let (Some(new_peer_rx), Some(no_more_peers_rx)) = (
            self.new_peer_rx.lock().take(),
            self.no_more_peers_rx.lock().take(),
        ) {
            tasks.push(tokio::spawn(
                Arc::clone(self).syncer_loop(new_peer_rx, no_more_peers_rx),
            ));
        }
        if let Some(txsync_rx) = self.txsync_rx.lock().take() {
            tasks.push(tokio::spawn(
                Arc::clone(self).txsync_loop(txsync_rx, self.quit_tx.subscribe()),
            ));
        }
    }

    /// Stop the protocol: unsubscribe the event sources, stop the
    /// syncer, fetcher and tx-sync, close the peer set and wait for
    /// every peer handler to come down.
    pub async fn stop(&self) {
        info!("Stopping sync protocol");

        // Quits the broadcast loops
        let _ = self.stop_events_tx.send(true);

        // Quits the syncer; after this no new peers are accepted
        let _ = self.no_more_peers_tx.send(()).await;

        // Quits the fetcher and the tx-sync loop
        let _ = self.quit_tx.send(true);
        self.downloader.cancel();

        // Disconnect existing sessions and refuse new registrations
        self.peers.close();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.handlers.wait().await;

        info!("Sync protocol stopped");
    }

    /// The peer set.
    pub fn peer_set(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    /// The downloader.
    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    /// Whether remote transactions are being accepted.
    pub fn accepts_txs(&self) -> bool {
        self.accept_txs.load(Ordering::SeqCst)
    }

    /// Force the synced flag; the miner flips this when it starts
    /// sealing on a fresh chain.
    pub fn set_accept_txs(&self, accept: bool) {
        self.accept_txs.store(accept, Ordering::SeqCst);
    }

    fn fetcher(&self) -> Option<FetcherHandle> {
        self.fetcher.lock().clone()
    }

    /// Drive one peer's lifecycle: handshake, registration, fork
    /// challenge and the message loop. Returns when the peer is gone.
    pub async fn handle<S>(
        self: Arc<Self>,
        stream: S,
        node_id: &[u8],
        trusted: bool,
    ) -> NetworkResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let _guard = self.handlers.guard();

        if self.peers.is_closed() {
            return Err(NetworkError::PeerSetClosed);
        }
        // Ignore the peer limit for trusted peers
        if self.peers.len() >= self.config.max_peers && !trusted {
            return Err(NetworkError::TooManyPeers);
        }

        let head = self.chain.current_header();
        let head_hash = head.hash();
        let td = self
            .chain
            .total_difficulty(&head_hash, head.number)
            .unwrap_or_default();
        let ours = StatusData {
            protocol_version: PROTOCOL_VERSIONS[0],
            network_id: self.config.network_id,
            td,
            head: head_hash,
            genesis: self.chain.genesis_hash(),
        };

        let mut framed = Framed::new(stream, FrameCodec::new());
        let theirs = match Peer::handshake(&mut framed, ours).await {
            Ok(theirs) => theirs,
            Err(err) => {
                debug!(error = %err, reason = %err.disconnect_reason(), "Handshake failed");
                return Err(err);
            }
        };

        let (peer, out_rx) = Peer::new(node_id, &theirs, trusted);
        let id = peer.id().to_string();
        debug!(peer = %id, version = peer.version(), "Peer connected");

        let (sink, mut messages) = framed.split();
        let writer = tokio::spawn(Peer::run_writer(out_rx, sink));

        if let Err(err) = self.peers.register(Arc::clone(&peer)) {
            debug!(peer = %id, error = %err, "Peer registration failed");
            writer.abort();
            return Err(err);
        }
        let broadcaster = tokio::spawn(Arc::clone(&peer).run_broadcast());

        // Register with the downloader and hand over the pending pool
        self.downloader.register_peer(&id);
        let _ = self.txsync_tx.try_send(id.clone());
        let _ = self.new_peer_tx.try_send(id.clone());

        // Fork challenge: one header at the fork block, on a timer
        if let Some(fork_number) = self.config.fork_block {
            match peer.request_headers_by_number(fork_number, 1, 0, false).await {
                Ok(()) => {
                    let manager = Arc::clone(&self);
                    let peer_id = id.clone();
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(FORK_CHALLENGE_TIMEOUT).await;
                        debug!(peer = %peer_id, "Timed out fork check, dropping");
                        manager.remove_peer(&peer_id);
                    });
                    peer.arm_fork_timer(timer);
                }
                Err(err) => {
                    self.remove_peer(&id);
                    writer.abort();
                    broadcaster.abort();
                    return Err(err);
                }
            }
        }

        // Main loop: handle inbound messages until something breaks
        let result = loop {
            tokio::select! {
                frame = messages.next() => match frame {
                    Some(Ok(message)) => {
                        if let Err(err) = self.handle_msg(&peer, message).await {
                            debug!(
                                peer = %id,
                                error = %err,
                                reason = %err.disconnect_reason(),
                                "Message handling failed"
                            );
                            break Err(err);
                        }
                    }
                    Some(Err(err)) => break Err(err),
                    None => break Ok(()),
                },
                _ = peer.closed() => break Err(NetworkError::PeerSetClosed),
            }
        };

        self.remove_peer(&id);
        writer.abort();
        broadcaster.abort();
        result
    }

    /// Dispatch one inbound message.
    pub(crate) async fn handle_msg(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        message: Message,
    ) -> NetworkResult<()> {
        let code = message.code();
        if code.min_version() > peer.version() {
            return Err(NetworkError::InvalidMessageCode(code as u8));
        }

        match message {
            // Status messages should never arrive after the handshake
            Message::Status(_) => Err(NetworkError::ExtraStatusMessage),

            Message::GetBlockHeaders(query) => self.serve_headers(peer, query).await,

            Message::BlockHeaders(headers) => self.accept_headers(peer, headers).await,

            Message::GetBlockBodies(hashes) => {
                let mut bodies = Vec::new();
                let mut bytes = 0usize;
                for hash in hashes {
                    if bytes >= SOFT_RESPONSE_LIMIT || bodies.len() >= MAX_BLOCK_FETCH {
                        break;
                    }
                    if let Some(block) = self.chain.block_by_hash(&hash) {
                        bytes += block.body.serialize().len();
                        bodies.push(block.body);
                    }
                }
                peer.send_block_bodies(bodies).await
            }

            Message::BlockBodies(bodies) => {
                let mut bodies = bodies;
                let filter = !bodies.is_empty();
                if filter {
                    if let Some(fetcher) = self.fetcher() {
                        bodies = fetcher.filter_bodies(peer.id(), bodies).await;
                    }
                }
                if !bodies.is_empty() || !filter {
                    self.downloader.deliver_bodies(peer.id(), bodies);
                }
                Ok(())
            }

            Message::GetNodeData(hashes) => {
                let mut data = Vec::new();
                let mut bytes = 0usize;
                for hash in hashes {
                    if bytes >= SOFT_RESPONSE_LIMIT || data.len() >= MAX_STATE_FETCH {
                        break;
                    }
                    if let Some(entry) = self.chain.trie_node(&hash) {
                        bytes += entry.len();
                        data.push(entry);
                    }
                }
                peer.send_node_data(data).await
            }

            Message::NodeData(nodes) => {
                self.downloader.deliver_node_data(peer.id(), nodes);
                Ok(())
            }

            Message::GetReceipts(hashes) => {
                let mut receipts = Vec::new();
                let mut bytes = 0usize;
                for hash in hashes {
                    if bytes >= SOFT_RESPONSE_LIMIT || receipts.len() >= MAX_RECEIPT_FETCH {
                        break;
                    }
                    // Skip unknown blocks, but serve the empty batch for
                    // blocks that provably have no receipts
                    let results = match self.chain.receipts_by_hash(&hash) {
                        Some(results) => results,
                        None => match self.chain.header_by_hash(&hash) {
                            Some(header) if header.receipt_root == empty_root() => Vec::new(),
                            _ => continue,
                        },
                    };
                    bytes += results.iter().map(|r| r.serialize().len()).sum::<usize>();
                    receipts.push(results);
                }
                peer.send_receipts(receipts).await
            }

            Message::Receipts(receipts) => {
                self.downloader.deliver_receipts(peer.id(), receipts);
                Ok(())
            }

            Message::NewBlockHashes(announces) => {
                // Mark the hashes as present at the remote node
                for announce in &announces {
                    peer.mark_block(announce.hash);
                }
                // Schedule all the unknown hashes for retrieval
                if let Some(fetcher) = self.fetcher() {
                    for announce in announces {
                        if !self.chain.has_block(&announce.hash, announce.number) {
                            fetcher.notify(peer.id(), announce.hash, announce.number).await;
                        }
                    }
                }
                Ok(())
            }

            Message::NewBlock(data) => self.accept_new_block(peer, data).await,

            Message::Transactions(txs) => {
                // Drop silently until the initial sync completes
                if !self.accept_txs.load(Ordering::SeqCst) {
                    return Ok(());
                }
                for tx in &txs {
                    peer.mark_transaction(tx.hash());
                }
                for (index, result) in self.pool.add_remotes(txs).into_iter().enumerate() {
                    if let Err(err) = result {
                        trace!(peer = %peer.id(), index, error = %err, "Pool rejected transaction");
                    }
                }
                Ok(())
            }
        }
    }

    /// Serve a header query, walking the chain in the requested mode.
    async fn serve_headers(
        &self,
        peer: &Arc<Peer>,
        mut query: basalt_network::GetBlockHeaders,
    ) -> NetworkResult<()> {
        let limit = (query.amount as usize).min(MAX_HEADER_FETCH);
        let mut headers = Vec::new();
        let mut bytes = 0usize;
        let mut unknown = false;

        while !unknown && headers.len() < limit && bytes < SOFT_RESPONSE_LIMIT {
            // Retrieve the next header satisfying the query
            let origin = match query.origin {
                HashOrNumber::Hash(hash) => self.chain.header_by_hash(&hash),
                HashOrNumber::Number(number) => self.chain.header_by_number(number),
            };
            let Some(origin) = origin else { break };
            let number = origin.number;
            let origin_hash = origin.hash();
            headers.push(origin);
            bytes += EST_HEADER_SIZE;

            // Advance to the next header of the query
            match (query.origin, query.reverse) {
                (HashOrNumber::Hash(_), true) => {
                    // Hash based traversal towards the genesis block
                    let mut hash = origin_hash;
                    let mut found = true;
                    for _ in 0..=query.skip {
                        match self.chain.header_by_hash(&hash) {
                            Some(header) => hash = header.parent_hash,
                            None => {
                                found = false;
                                break;
                            }
                        }
                    }
                    if found {
                        query.origin = HashOrNumber::Hash(hash);
                    } else {
                        unknown = true;
                    }
                }
                (HashOrNumber::Hash(_), false) => {
                    // Hash based traversal towards the leaf block; the
                    // advertised next header must hash back to the origin
                    match next_number(number, query.skip) {
                        Some(next) => match self.chain.header_by_number(next) {
                            Some(next_header) => {
                                let next_hash = next_header.hash();
                                let ancestors = self
                                    .chain
                                    .ancestor_hashes(&next_hash, query.skip.saturating_add(1));
                                if ancestors.get(query.skip as usize) == Some(&origin_hash) {
                                    query.origin = HashOrNumber::Hash(next_hash);
                                } else {
                                    unknown = true;
                                }
                            }
                            None => unknown = true,
                        },
                        None => unknown = true,
                    }
                }
                (HashOrNumber::Number(_), true) => {
                    // Number based traversal towards the genesis block
                    match query.skip.checked_add(1) {
                        Some(step) if number >= step => {
                            query.origin = HashOrNumber::Number(number - step);
                        }
                        _ => unknown = true,
                    }
                }
                (HashOrNumber::Number(_), false) => {
                    // Number based traversal towards the leaf block
                    match next_number(number, query.skip) {
                        Some(next) => query.origin = HashOrNumber::Number(next),
                        None => {
                            warn!(
                                peer = %peer.id(),
                                current = number,
                                skip = query.skip,
                                "GetBlockHeaders skip overflow attack"
                            );
                            unknown = true;
                        }
                    }
                }
            }
        }
        peer.send_block_headers(headers).await
    }

    /// Route a header reply: fork challenge first, then the fetcher,
    /// residue to the downloader.
    async fn accept_headers(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        headers: Vec<Header>,
    ) -> NetworkResult<()> {
        let mut headers = headers;

        // An empty reply may still answer the fork challenge, if the
        // peer is allowed not to have the fork block at all
        if headers.is_empty() && peer.fork_timer_armed() {
            let mut verify = true;
            if let Some(fork_number) = self.config.fork_block {
                if let Some(fork_header) = self.chain.header_by_number(fork_number) {
                    let local_td = self
                        .chain
                        .total_difficulty(&fork_header.hash(), fork_number)
                        .unwrap_or_default();
                    let (_, peer_td) = peer.head();
                    // A peer ahead of the fork must be able to answer
                    if peer_td >= local_td {
                        verify = false;
                    }
                }
            }
            if verify {
                debug!(peer = %peer.id(), "Seems to be on the same side of the fork");
                peer.disarm_fork_timer();
                return Ok(());
            }
        }

        let filter = headers.len() == 1;
        if filter {
            // A single header while the challenge is armed is the reply
            if let Some(fork_number) = self.config.fork_block {
                if peer.fork_timer_armed() && headers[0].number == fork_number {
                    peer.disarm_fork_timer();
                    return match self.engine.verify_fork_extra(&headers[0]) {
                        Ok(()) => {
                            debug!(peer = %peer.id(), "Verified to be on the same side of the fork");
                            Ok(())
                        }
                        Err(err) => {
                            debug!(peer = %peer.id(), "Verified to be on the other side of the fork, dropping");
                            Err(NetworkError::ForkCheckFailed(err.to_string()))
                        }
                    };
                }
            }
            // Irrelevant of the fork checks, offer the header to the
            // fetcher just in case
            if let Some(fetcher) = self.fetcher() {
                headers = fetcher.filter_headers(peer.id(), headers).await;
            }
        }
        if !headers.is_empty() || !filter {
            self.downloader.deliver_headers(peer.id(), headers);
        }
        Ok(())
    }

    /// Accept a propagated block: stamp, enqueue, and re-evaluate the
    /// peer's head.
    async fn accept_new_block(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        data: basalt_network::NewBlockData,
    ) -> NetworkResult<()> {
        let mut block = data.block;
        block.received_at = Some(Instant::now());
        block.received_from = Some(peer.id().to_string());

        let hash = block.hash();
        peer.mark_block(hash);

        let difficulty = block.difficulty().clone();
        if data.td < difficulty {
            return Err(EncodingError::Invalid(
                "propagated TD below block difficulty".to_string(),
            )
            .into());
        }
        // The head the peer truly must have, assuming the block imports
        let true_head = block.parent_hash();
        let true_td = data.td - difficulty;

        if let Some(fetcher) = self.fetcher() {
            fetcher.enqueue(peer.id(), block).await;
        }

        // Update the peer's total difficulty if better than the previous
        if true_td > peer.td() {
            peer.set_head(true_head, true_td.clone());

            let head = self.chain.current_header();
            let local_td = self
                .chain
                .total_difficulty(&head.hash(), head.number)
                .unwrap_or_default();
            if true_td > local_td {
                let manager = Arc::clone(self);
                let id = peer.id().to_string();
                tokio::spawn(async move {
                    manager.synchronise_with(&id).await;
                });
            }
        }
        Ok(())
    }

    /// Either propagate a block to a subset of peers, or only announce
    /// its availability.
    pub fn broadcast_block(&self, block: &Block, propagate: bool) {
        let hash = block.hash();
        let peers = self.peers.peers_without_block(&hash);

        if propagate {
            // The block is not imported yet, so its TD is derived from
            // the parent
            let parent_td = self
                .chain
                .total_difficulty(&block.parent_hash(), block.number().saturating_sub(1));
            let Some(parent_td) = parent_td else {
                error!(number = block.number(), hash = %hash.short(), "Propagating dangling block");
                return;
            };
            let td = parent_td + block.difficulty().clone();

            // Send the block to a square root of our peers
            let count = (peers.len() as f64).sqrt() as usize;
            let transfer = peers.choose_multiple(&mut rand::thread_rng(), count);
            for peer in transfer {
                peer.async_send_new_block(block.clone(), td.clone());
            }
            trace!(hash = %hash.short(), recipients = count, "Propagated block");
            return;
        }
        // Otherwise, if the block is indeed in our own chain, announce it
        if self.chain.has_block(&hash, block.number()) {
            for peer in &peers {
                peer.async_send_new_block_hash(hash, block.number());
            }
            trace!(hash = %hash.short(), recipients = peers.len(), "Announced block");
        }
    }

    /// Propagate a transaction batch to the peers that lack each one.
    pub fn broadcast_txs(&self, txs: Vec<Transaction>) {
        let mut txset: HashMap<String, (Arc<Peer>, Vec<Transaction>)> = HashMap::new();

        for tx in txs {
            let hash = tx.hash();
            let receivers = self.peers.peers_without_tx(&hash);
            trace!(hash = %hash.short(), recipients = receivers.len(), "Broadcast transaction");
            for peer in receivers {
                let entry = txset
                    .entry(peer.id().to_string())
                    .or_insert_with(|| (Arc::clone(&peer), Vec::new()));
                entry.1.push(tx.clone());
            }
        }
        for (_, (peer, txs)) in txset {
            peer.async_send_transactions(txs);
        }
    }

    /// Remove a peer from every registry and disconnect it. Removing an
    /// unknown peer is a no-op.
    pub fn remove_peer(&self, id: &str) {
        if self.peers.peer(id).is_none() {
            return;
        }
        debug!(peer = %id, "Removing peer");
        self.downloader.unregister_peer(id);
        self.reputation.clear(id);
        self.peers.unregister(id);
    }

    /// Add demerits to a peer, dropping it when the threshold is
    /// crossed.
    pub(crate) fn demote_peer(&self, id: &str, amount: u32) {
        if self.reputation.penalize(id, amount) {
            warn!(
                peer = %id,
                demerits = self.reputation.demerits(id),
                "Peer crossed the demerit threshold, dropping"
            );
            self.remove_peer(id);
        }
    }

    async fn mined_broadcast_loop(
        self: Arc<Self>,
        mut sub: Subscription<NewMinedBlockEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = sub.recv() => match event {
                    Some(event) => {
                        // First propagate the block, only then announce
                        self.broadcast_block(&event.block, true);
                        self.broadcast_block(&event.block, false);
                    }
                    None => return,
                },
                _ = stop.changed() => {
                    if *stop.borrow() {
                        sub.unsubscribe();
                        return;
                    }
                }
            }
        }
    }

    async fn tx_broadcast_loop(
        self: Arc<Self>,
        mut sub: Subscription<NewTxsEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = sub.recv() => match event {
                    Some(event) => self.broadcast_txs(event.txs),
                    None => return,
                },
                _ = stop.changed() => {
                    if *stop.borrow() {
                        sub.unsubscribe();
                        return;
                    }
                }
            }
        }
    }

}

fn next_number(number: u64, skip: u64) -> Option<u64> {
    let step = skip.checked_add(1)?;
    let next = number.checked_add(step)?;
    if next <= number {
        return None;
    }
    Some(next)
}
