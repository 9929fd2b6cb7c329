//! Bulk multi-peer synchronization.
//!
//! One sync round runs at a time against the master peer (the peer
//! advertising the highest total difficulty). Headers stream from the
//! master in batches with contiguity checks; each batch's bodies and,
//! in fast mode, receipts are pulled in parallel from every registered
//! peer through per-kind work queues. Fast mode finishes by walking the
//! pivot block's state trie through the state sink. A round is
//! cancelled when the master unregisters, when a hard protocol error
//! surfaces, or when the manager shuts down.

use crate::{SyncError, SyncResult, MAX_HEADER_FETCH, MAX_STATE_FETCH};
use basalt_network::{Peer, PeerSet};
use basalt_types::{
    empty_root, hash_root, Block, BlockChain, Body, Hash256, Header, Receipt, StateSink,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Deadline for any single download request.
pub const DOWNLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Distance below the remote head where fast sync places its pivot;
/// blocks past the pivot are executed in full.
pub const PIVOT_DISTANCE: u64 = 64;

/// Attempts per work item before the round is declared stalled.
const MAX_RETRIES: u32 = 3;

/// Bodies requested from one peer at a time.
const BODY_REQUEST_SIZE: usize = 16;

/// Receipt batches requested from one peer at a time.
const RECEIPT_REQUEST_SIZE: usize = 16;

/// Capacity of each delivery channel.
const DELIVERY_CHANNEL_SIZE: usize = 64;

/// Cadence of the in-flight timeout sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive idle sweeps tolerated before a window is declared stuck.
const MAX_IDLE_SWEEPS: u32 = 30;

/// Synchronization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Download headers and bodies, execute every block.
    Full,
    /// Download headers, bodies, receipts and the pivot state snapshot;
    /// execute only past the pivot.
    Fast,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Fast => write!(f, "fast"),
        }
    }
}

struct Delivery<T> {
    peer: String,
    items: T,
}

struct Channels {
    headers: mpsc::Receiver<Delivery<Vec<Header>>>,
    bodies: mpsc::Receiver<Delivery<Vec<Body>>>,
    nodes: mpsc::Receiver<Delivery<Vec<Vec<u8>>>>,
    receipts: mpsc::Receiver<Delivery<Vec<Vec<Receipt>>>>,
}

struct WindowTask {
    header: Header,
    body: Option<Body>,
    receipts: Option<Vec<Receipt>>,
    retries: u32,
}

struct Assignment {
    tasks: Vec<usize>,
    at: Instant,
}

/// The bulk synchronizer.
pub struct Downloader {
    chain: Arc<dyn BlockChain>,
    state: Arc<dyn StateSink>,
    peers: Arc<PeerSet>,
    registered: RwLock<HashSet<String>>,
    synchronising: AtomicBool,
    master: Mutex<Option<String>>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    headers_tx: mpsc::Sender<Delivery<Vec<Header>>>,
    bodies_tx: mpsc::Sender<Delivery<Vec<Body>>>,
    nodes_tx: mpsc::Sender<Delivery<Vec<Vec<u8>>>>,
    receipts_tx: mpsc::Sender<Delivery<Vec<Vec<Receipt>>>>,
    channels: AsyncMutex<Channels>,
}

impl Downloader {
    /// Create a downloader over the given collaborators.
    pub fn new(
        chain: Arc<dyn BlockChain>,
        state: Arc<dyn StateSink>,
        peers: Arc<PeerSet>,
    ) -> Self {
        let (headers_tx, headers_rx) = mpsc::channel(DELIVERY_CHANNEL_SIZE);
        let (bodies_tx, bodies_rx) = mpsc::channel(DELIVERY_CHANNEL_SIZE);
        let (nodes_tx, nodes_rx) = mpsc::channel(DELIVERY_CHANNEL_SIZE);
        let (receipts_tx, receipts_rx) = mpsc::channel(DELIVERY_CHANNEL_SIZE);
        Self {
            chain,
            state,
            peers,
            registered: RwLock::new(HashSet::new()),
            synchronising: AtomicBool::new(false),
            master: Mutex::new(None),
            cancel: Mutex::new(None),
            headers_tx,
            bodies_tx,
            nodes_tx,
            receipts_tx,
            channels: AsyncMutex::new(Channels {
                headers: headers_rx,
                bodies: bodies_rx,
                nodes: nodes_rx,
                receipts: receipts_rx,
            }),
        }
    }

    /// Register a peer for download scheduling.
    pub fn register_peer(&self, id: &str) {
        self.registered.write().insert(id.to_string());
    }

    /// Remove a peer; cancels the round if it was the master.
    pub fn unregister_peer(&self, id: &str) {
        self.registered.write().remove(id);
        if self.master.lock().as_deref() == Some(id) {
            debug!(peer = %id, "Master peer lost, cancelling sync");
            self.cancel_round();
        }
    }

    /// Whether a sync round is running.
    pub fn is_syncing(&self) -> bool {
        self.synchronising.load(Ordering::SeqCst)
    }

    /// Cancel the running round, if any.
    pub fn cancel(&self) {
        self.cancel_round();
    }

    fn cancel_round(&self) {
        if let Some(tx) = self.cancel.lock().as_ref() {
            let _ = tx.send(true);
        }
    }

    // ---- deliveries, fed by the protocol manager ----

    /// Deliver a header reply.
    pub fn deliver_headers(&self, peer: &str, headers: Vec<Header>) {
        Self::deliver(&self.headers_tx, peer, headers, "headers");
    }

    /// Deliver a body reply.
    pub fn deliver_bodies(&self, peer: &str, bodies: Vec<Body>) {
        Self::deliver(&self.bodies_tx, peer, bodies, "bodies");
    }

    /// Deliver a state node reply.
    pub fn deliver_node_data(&self, peer: &str, nodes: Vec<Vec<u8>>) {
        Self::deliver(&self.nodes_tx, peer, nodes, "node data");
    }

    /// Deliver a receipts reply.
    pub fn deliver_receipts(&self, peer: &str, receipts: Vec<Vec<Receipt>>) {
        Self::deliver(&self.receipts_tx, peer, receipts, "receipts");
    }

    fn deliver<T>(tx: &mpsc::Sender<Delivery<T>>, peer: &str, items: T, kind: &str) {
        let delivery = Delivery {
            peer: peer.to_string(),
            items,
        };
        if let Err(err) = tx.try_send(delivery) {
            debug!(peer = %peer, kind, error = %err, "Failed to deliver to downloader");
        }
    }

    /// Run one synchronization round against the given master peer.
    ///
    /// `remove_peer` is invoked for the master on hard protocol errors.
    pub async fn synchronise(
        &self,
        id: &str,
        mode: SyncMode,
        remove_peer: &(dyn Fn(&str) + Sync),
    ) -> SyncResult<()> {
        if self.synchronising.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Busy);
        }
        info!(peer = %id, %mode, "Synchronising with the network");

        let result = self.run_round(id, mode).await;

        *self.master.lock() = None;
        *self.cancel.lock() = None;
        self.synchronising.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => info!(peer = %id, "Synchronisation completed"),
            Err(SyncError::Busy) | Err(SyncError::Cancelled) => {}
            Err(SyncError::InvalidChain(reason)) => {
                warn!(peer = %id, reason, "Master delivered an invalid chain, dropping");
                remove_peer(id);
            }
            Err(SyncError::Timeout) | Err(SyncError::Stalled(_)) => {
                warn!(peer = %id, "Sync made no progress, dropping master");
                remove_peer(id);
            }
            Err(err) => debug!(peer = %id, error = %err, "Synchronisation failed"),
        }
        result
    }

    async fn run_round(&self, id: &str, mode: SyncMode) -> SyncResult<()> {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        *self.cancel.lock() = Some(cancel_tx);
        *self.master.lock() = Some(id.to_string());

        let master = self.peers.peer(id).ok_or(SyncError::NoPeers)?;

        let mut guard = self.channels.lock().await;
        let channels = &mut *guard;
        Self::drain(channels);

        // Remote height, from the header behind the advertised head hash
        let (head_hash, _) = master.head();
        master.request_headers_by_hash(head_hash, 1, 0, false).await?;
        let latest = Self::await_headers(channels, id, &mut cancel_rx).await?;
        let latest = latest
            .first()
            .ok_or_else(|| SyncError::Stalled("empty head reply".to_string()))?
            .clone();
        let remote_height = latest.number;

        // Common ancestor
        let ancestor = self
            .find_ancestor(&master, id, remote_height, channels, &mut cancel_rx)
            .await?;
        debug!(peer = %id, remote_height, ancestor, "Starting header download");

        let pivot = match mode {
            SyncMode::Fast => remote_height.saturating_sub(PIVOT_DISTANCE),
            SyncMode::Full => 0,
        };

        let mut next = ancestor + 1;
        let mut last_hash = self
            .chain
            .header_by_number(ancestor)
            .ok_or_else(|| SyncError::Stalled("ancestor vanished locally".to_string()))?
            .hash();
        let mut pivot_root = None;

        while next <= remote_height {
            if *cancel_rx.borrow() {
                return Err(SyncError::Cancelled);
            }

            master
                .request_headers_by_number(next, MAX_HEADER_FETCH as u64, 0, false)
                .await?;
            let headers = Self::await_headers(channels, id, &mut cancel_rx).await?;
            if headers.is_empty() {
                return Err(SyncError::Stalled("empty header batch".to_string()));
            }
            if headers.len() > MAX_HEADER_FETCH {
                return Err(SyncError::InvalidChain("oversized header batch".to_string()));
            }
            for (i, header) in headers.iter().enumerate() {
                let expected = next + i as u64;
                if header.number != expected {
                    return Err(SyncError::InvalidChain(format!(
                        "non-contiguous numbers: expected {expected}, got {}",
                        header.number
                    )));
                }
                if header.parent_hash != last_hash {
                    return Err(SyncError::InvalidChain(format!(
                        "broken parent linkage at {}",
                        header.number
                    )));
                }
                last_hash = header.hash();
                if header.number == pivot {
                    pivot_root = Some(header.state_root);
                }
            }

            let window = self
                .fetch_window(&headers, mode, pivot, channels, &mut cancel_rx)
                .await?;
            self.import_window(window, mode, pivot)?;
            next += headers.len() as u64;
        }

        // Fast sync finishes with the pivot state snapshot
        if mode == SyncMode::Fast {
            if let Some(root) = pivot_root {
                self.state_sync(root, channels, &mut cancel_rx).await?;
            }
        }

        Ok(())
    }

    async fn find_ancestor(
        &self,
        master: &Arc<Peer>,
        id: &str,
        remote_height: u64,
        channels: &mut Channels,
        cancel: &mut watch::Receiver<bool>,
    ) -> SyncResult<u64> {
        let local_height = self.chain.current_header().number;
        if local_height == 0 {
            return Ok(0);
        }
        let scan_top = local_height.min(remote_height);
        let from = scan_top.saturating_sub(MAX_HEADER_FETCH as u64 - 1);

        master
            .request_headers_by_number(from, MAX_HEADER_FETCH as u64, 0, false)
            .await?;
        let headers = Self::await_headers(channels, id, cancel).await?;

        for header in headers.iter().rev() {
            if header.number > scan_top {
                continue;
            }
            let known = self
                .chain
                .header_by_number(header.number)
                .map(|local| local.hash() == header.hash())
                .unwrap_or(false);
            if known {
                return Ok(header.number);
            }
        }
        // The handshake pinned a common genesis
        Ok(0)
    }

    /// Fetch bodies (and receipts in fast mode) for one header batch,
    /// spreading requests over all registered peers.
    async fn fetch_window(
        &self,
        headers: &[Header],
        mode: SyncMode,
        pivot: u64,
        channels: &mut Channels,
        cancel: &mut watch::Receiver<bool>,
    ) -> SyncResult<Vec<(Block, Vec<Receipt>)>> {
        let mut tasks: Vec<WindowTask> = headers
            .iter()
            .map(|header| {
                let body_needed =
                    header.tx_root != empty_root() || header.uncle_hash != empty_root();
                let receipts_needed = mode == SyncMode::Fast
                    && header.number <= pivot
                    && header.receipt_root != empty_root();
                WindowTask {
                    header: header.clone(),
                    body: if body_needed {
                        None
                    } else {
                        Some(Body::default())
                    },
                    receipts: if receipts_needed { None } else { Some(Vec::new()) },
                    retries: 0,
                }
            })
            .collect();

        let mut assignments: HashMap<String, Assignment> = HashMap::new();
        let mut idle_sweeps = 0u32;

        while !tasks
            .iter()
            .all(|t| t.body.is_some() && t.receipts.is_some())
        {
            self.dispatch_window_requests(&mut tasks, &mut assignments)
                .await;

            if assignments.is_empty() && self.registered.read().is_empty() {
                return Err(SyncError::NoPeers);
            }

            tokio::select! {
                delivery = channels.bodies.recv() => {
                    let Some(delivery) = delivery else {
                        return Err(SyncError::Cancelled);
                    };
                    idle_sweeps = 0;
                    if let Some(assignment) = assignments.remove(&delivery.peer) {
                        for body in delivery.items {
                            let tx_root = body.tx_root();
                            let uncle_root = body.uncle_root();
                            let slot = assignment.tasks.iter().copied().find(|&i| {
                                tasks[i].body.is_none()
                                    && tasks[i].header.tx_root == tx_root
                                    && tasks[i].header.uncle_hash == uncle_root
                            });
                            if let Some(i) = slot {
                                tasks[i].body = Some(body);
                            }
                        }
                        bump_unfilled(&mut tasks, &assignment.tasks)?;
                    }
                }
                delivery = channels.receipts.recv() => {
                    let Some(delivery) = delivery else {
                        return Err(SyncError::Cancelled);
                    };
                    idle_sweeps = 0;
                    if let Some(assignment) = assignments.remove(&delivery.peer) {
                        for batch in delivery.items {
                            let hashes: Vec<Hash256> =
                                batch.iter().map(|r| r.hash()).collect();
                            let root = hash_root(&hashes);
                            let slot = assignment.tasks.iter().copied().find(|&i| {
                                tasks[i].receipts.is_none()
                                    && tasks[i].header.receipt_root == root
                            });
                            if let Some(i) = slot {
                                tasks[i].receipts = Some(batch);
                            }
                        }
                        bump_unfilled(&mut tasks, &assignment.tasks)?;
                    }
                }
                _ = sleep(SWEEP_INTERVAL) => {
                    let now = Instant::now();
                    let expired: Vec<String> = assignments
                        .iter()
                        .filter(|(_, a)| now.duration_since(a.at) > DOWNLOAD_REQUEST_TIMEOUT)
                        .map(|(peer, _)| peer.clone())
                        .collect();
                    for peer in expired {
                        if let Some(assignment) = assignments.remove(&peer) {
                            debug!(peer = %peer, "Download request timed out, reassigning");
                            bump_unfilled(&mut tasks, &assignment.tasks)?;
                        }
                    }
                    if assignments.is_empty() {
                        idle_sweeps += 1;
                        if idle_sweeps > MAX_IDLE_SWEEPS {
                            return Err(SyncError::Stalled(
                                "no peer can serve the window".to_string(),
                            ));
                        }
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Err(SyncError::Cancelled);
                    }
                }
            }
        }

        // Every task is filled; assemble in header order
        Ok(tasks
            .into_iter()
            .map(|task| {
                let body = task.body.unwrap_or_default();
                let receipts = task.receipts.unwrap_or_default();
                (Block::new(task.header, body), receipts)
            })
            .collect())
    }

    /// Hand unassigned window work to idle registered peers.
    async fn dispatch_window_requests(
        &self,
        tasks: &mut [WindowTask],
        assignments: &mut HashMap<String, Assignment>,
    ) {
        let registered: Vec<String> = self.registered.read().iter().cloned().collect();
        for peer_id in registered {
            if assignments.contains_key(&peer_id) {
                continue;
            }
            let Some(peer) = self.peers.peer(&peer_id) else {
                continue;
            };

            let body_idxs: Vec<usize> = tasks
                .iter()
                .enumerate()
                .filter(|(i, t)| t.body.is_none() && !is_assigned(assignments, *i))
                .map(|(i, _)| i)
                .take(BODY_REQUEST_SIZE)
                .collect();
            if !body_idxs.is_empty() {
                let hashes: Vec<Hash256> =
                    body_idxs.iter().map(|&i| tasks[i].header.hash()).collect();
                if peer.request_bodies(hashes).await.is_ok() {
                    assignments.insert(
                        peer_id.clone(),
                        Assignment {
                            tasks: body_idxs,
                            at: Instant::now(),
                        },
                    );
                }
                continue;
            }

            let receipt_idxs: Vec<usize> = tasks
                .iter()
                .enumerate()
                .filter(|(i, t)| t.receipts.is_none() && !is_assigned(assignments, *i))
                .map(|(i, _)| i)
                .take(RECEIPT_REQUEST_SIZE)
                .collect();
            if !receipt_idxs.is_empty() {
                let hashes: Vec<Hash256> = receipt_idxs
                    .iter()
                    .map(|&i| tasks[i].header.hash())
                    .collect();
                if peer.request_receipts(hashes).await.is_ok() {
                    assignments.insert(
                        peer_id.clone(),
                        Assignment {
                            tasks: receipt_idxs,
                            at: Instant::now(),
                        },
                    );
                }
            }
        }
    }

    fn import_window(
        &self,
        window: Vec<(Block, Vec<Receipt>)>,
        mode: SyncMode,
        pivot: u64,
    ) -> SyncResult<()> {
        match mode {
            SyncMode::Full => {
                let blocks: Vec<Block> = window.into_iter().map(|(block, _)| block).collect();
                self.chain.insert_chain(blocks)?;
            }
            SyncMode::Fast => {
                let (fast, full): (Vec<_>, Vec<_>) = window
                    .into_iter()
                    .partition(|(block, _)| block.number() <= pivot);
                if !fast.is_empty() {
                    self.chain.insert_chain_with_receipts(fast)?;
                }
                if !full.is_empty() {
                    self.chain
                        .insert_chain(full.into_iter().map(|(block, _)| block).collect())?;
                }
            }
        }
        Ok(())
    }

    /// Walk the state trie below `root`, requesting missing nodes until
    /// the frontier is exhausted.
    async fn state_sync(
        &self,
        root: Hash256,
        channels: &mut Channels,
        cancel: &mut watch::Receiver<bool>,
    ) -> SyncResult<()> {
        let mut queue: VecDeque<Hash256> = VecDeque::new();
        if !root.is_zero() && !self.state.has_node(&root) {
            queue.push_back(root);
        }

        let mut in_flight: Option<(String, HashSet<Hash256>, Instant)> = None;
        let mut retries = 0u32;
        let mut rotation = 0usize;

        while !queue.is_empty() || in_flight.is_some() {
            if in_flight.is_none() {
                let mut batch = Vec::new();
                while batch.len() < MAX_STATE_FETCH {
                    let Some(hash) = queue.pop_front() else { break };
                    if !self.state.has_node(&hash) {
                        batch.push(hash);
                    }
                }
                if batch.is_empty() {
                    break;
                }

                let registered: Vec<String> = self.registered.read().iter().cloned().collect();
                if registered.is_empty() {
                    return Err(SyncError::NoPeers);
                }
                let peer_id = registered[rotation % registered.len()].clone();
                rotation += 1;
                let Some(peer) = self.peers.peer(&peer_id) else {
                    queue.extend(batch);
                    continue;
                };
                debug!(peer = %peer_id, count = batch.len(), "Fetching state nodes");
                peer.request_node_data(batch.clone()).await?;
                in_flight = Some((peer_id, batch.into_iter().collect(), Instant::now()));
            }

            tokio::select! {
                delivery = channels.nodes.recv() => {
                    let Some(delivery) = delivery else {
                        return Err(SyncError::Cancelled);
                    };
                    let Some((peer_id, mut wanted, at)) = in_flight.take() else {
                        continue;
                    };
                    if delivery.peer != peer_id {
                        in_flight = Some((peer_id, wanted, at));
                        continue;
                    }
                    for data in delivery.items {
                        let hash = Hash256::of(&data);
                        if wanted.remove(&hash) {
                            for child in self.state.inject_node(&data) {
                                if !self.state.has_node(&child) {
                                    queue.push_back(child);
                                }
                            }
                        }
                    }
                    // Anything the peer skipped goes back on the queue
                    queue.extend(wanted.into_iter());
                }
                _ = sleep(SWEEP_INTERVAL) => {
                    if let Some((peer_id, wanted, at)) = in_flight.take() {
                        if Instant::now().duration_since(at) > DOWNLOAD_REQUEST_TIMEOUT {
                            debug!(peer = %peer_id, "State request timed out, reassigning");
                            retries += 1;
                            if retries > MAX_RETRIES {
                                return Err(SyncError::Stalled("state sync stalled".to_string()));
                            }
                            queue.extend(wanted.into_iter());
                        } else {
                            in_flight = Some((peer_id, wanted, at));
                        }
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Err(SyncError::Cancelled);
                    }
                }
            }
        }
        Ok(())
    }

    async fn await_headers(
        channels: &mut Channels,
        from: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> SyncResult<Vec<Header>> {
        let deadline = tokio::time::Instant::now() + DOWNLOAD_REQUEST_TIMEOUT;
        loop {
            tokio::select! {
                delivery = channels.headers.recv() => {
                    match delivery {
                        Some(delivery) if delivery.peer == from => return Ok(delivery.items),
                        Some(_) => continue, // stray delivery from another peer
                        None => return Err(SyncError::Cancelled),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Err(SyncError::Timeout),
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Err(SyncError::Cancelled);
                    }
                }
            }
        }
    }

    fn drain(channels: &mut Channels) {
        while channels.headers.try_recv().is_ok() {}
        while channels.bodies.try_recv().is_ok() {}
        while channels.nodes.try_recv().is_ok() {}
        while channels.receipts.try_recv().is_ok() {}
    }
}

fn is_assigned(assignments: &HashMap<String, Assignment>, idx: usize) -> bool {
    assignments.values().any(|a| a.tasks.contains(&idx))
}

fn bump_unfilled(tasks: &mut [WindowTask], idxs: &[usize]) -> SyncResult<()> {
    for &i in idxs {
        let task = &mut tasks[i];
        if task.body.is_none() || task.receipts.is_none() {
            task.retries += 1;
            if task.retries > MAX_RETRIES {
                return Err(SyncError::Stalled(format!(
                    "block {} undeliverable",
                    task.header.number
                )));
            }
        }
    }
    Ok(())
}
