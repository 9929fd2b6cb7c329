//! Announcement-driven single-block import.
//!
//! The fetcher tracks blocks announced by remote peers through three
//! stages: announced (waiting for the arrival grace period), fetching
//! (header request in flight) and completing (body request in flight).
//! Assembled blocks gather in a number-ordered queue and import as soon
//! as the chain head allows. Peers that let requests time out are
//! demoted through the manager's reputation table rather than dropped
//! outright.

use basalt_network::{Penalties, PeerSet};
use basalt_types::{empty_root, Block, BlockChain, Body, Engine, Hash256, Header};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

/// Grace period after the first announcement before the header fetch.
const ARRIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Slack added to batch header fetches of near-simultaneous announces.
const GATHER_SLACK: Duration = Duration::from_millis(100);

/// Deadline for a header or body request to be answered.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// How far below the chain head an announcement is still interesting.
const MAX_UNCLE_DIST: u64 = 7;

/// How far above the chain head an announcement is still interesting.
const MAX_QUEUE_DIST: u64 = 32;

/// Outstanding announcements allowed per peer.
const HASH_LIMIT: usize = 256;

/// Queued propagated blocks allowed per peer.
const BLOCK_LIMIT: usize = 64;

/// Cadence of the scheduling and timeout sweep.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Imports assembled blocks into the chain.
pub type Inserter = Arc<dyn Fn(Vec<Block>) -> Result<usize, String> + Send + Sync>;

/// Propagates or announces a freshly imported block.
pub type Broadcaster = Arc<dyn Fn(&Block, bool) + Send + Sync>;

/// Feeds the negative signal for misbehaving peers.
pub type Demoter = Arc<dyn Fn(&str, u32) + Send + Sync>;

/// One tracked announcement.
#[derive(Debug, Clone)]
struct Announce {
    hash: Hash256,
    number: u64,
    origin: String,
    /// When the announcement arrived.
    time: Instant,
    /// When the current stage's request went out.
    requested: Option<Instant>,
    /// Header received for this announcement, once fetched.
    header: Option<Header>,
}

struct QueuedBlock {
    peer: String,
    block: Block,
}

enum FetcherMessage {
    Notify {
        peer: String,
        hash: Hash256,
        number: u64,
    },
    Enqueue {
        peer: String,
        block: Block,
    },
    FilterHeaders {
        peer: String,
        headers: Vec<Header>,
        reply: oneshot::Sender<Vec<Header>>,
    },
    FilterBodies {
        peer: String,
        bodies: Vec<Body>,
        reply: oneshot::Sender<Vec<Body>>,
    },
}

/// Handle for feeding the fetcher from the message handlers.
#[derive(Clone)]
pub struct FetcherHandle {
    tx: mpsc::Sender<FetcherMessage>,
}

impl FetcherHandle {
    /// Announce a block available at a peer.
    pub async fn notify(&self, peer: &str, hash: Hash256, number: u64) {
        let _ = self
            .tx
            .send(FetcherMessage::Notify {
                peer: peer.to_string(),
                hash,
                number,
            })
            .await;
    }

    /// Queue a propagated block for import.
    pub async fn enqueue(&self, peer: &str, block: Block) {
        let _ = self
            .tx
            .send(FetcherMessage::Enqueue {
                peer: peer.to_string(),
                block,
            })
            .await;
    }

    /// Offer a header reply to the fetcher; returns the headers it did
    /// not claim.
    pub async fn filter_headers(&self, peer: &str, headers: Vec<Header>) -> Vec<Header> {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(FetcherMessage::FilterHeaders {
                peer: peer.to_string(),
                headers: headers.clone(),
                reply,
            })
            .await;
        if sent.is_err() {
            return headers;
        }
        rx.await.unwrap_or(headers)
    }

    /// Offer a body reply to the fetcher; returns the bodies it did not
    /// claim.
    pub async fn filter_bodies(&self, peer: &str, bodies: Vec<Body>) -> Vec<Body> {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(FetcherMessage::FilterBodies {
                peer: peer.to_string(),
                bodies: bodies.clone(),
                reply,
            })
            .await;
        if sent.is_err() {
            return bodies;
        }
        rx.await.unwrap_or(bodies)
    }
}

/// The fetcher task state.
pub struct Fetcher {
    rx: mpsc::Receiver<FetcherMessage>,
    chain: Arc<dyn BlockChain>,
    engine: Arc<dyn Engine>,
    peers: Arc<PeerSet>,
    inserter: Inserter,
    broadcast: Broadcaster,
    demote: Demoter,

    /// Per-peer count of tracked announcements.
    announces: HashMap<String, usize>,
    /// Announced blocks waiting out the arrival grace period.
    announced: HashMap<Hash256, Vec<Announce>>,
    /// Header requests in flight.
    fetching: HashMap<Hash256, Announce>,
    /// Headers received, body fetch not yet dispatched.
    fetched: HashMap<Hash256, Announce>,
    /// Body requests in flight.
    completing: HashMap<Hash256, Announce>,
    /// Assembled blocks by number, waiting for the chain to catch up.
    queue: BTreeMap<u64, Vec<QueuedBlock>>,
    queued_set: HashSet<Hash256>,
    /// Per-peer count of queued propagated blocks.
    queues: HashMap<String, usize>,
}

impl Fetcher {
    /// Create a fetcher and its handle.
    pub fn new(
        chain: Arc<dyn BlockChain>,
        engine: Arc<dyn Engine>,
        peers: Arc<PeerSet>,
        inserter: Inserter,
        broadcast: Broadcaster,
        demote: Demoter,
    ) -> (FetcherHandle, Fetcher) {
        let (tx, rx) = mpsc::channel(256);
        (
            FetcherHandle { tx },
            Fetcher {
                rx,
                chain,
                engine,
                peers,
                inserter,
                broadcast,
                demote,
                announces: HashMap::new(),
                announced: HashMap::new(),
                fetching: HashMap::new(),
                fetched: HashMap::new(),
                completing: HashMap::new(),
                queue: BTreeMap::new(),
                queued_set: HashSet::new(),
                queues: HashMap::new(),
            },
        )
    }

    /// Run until the quit signal fires or every handle is gone.
    pub async fn run(mut self, mut quit: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message),
                    None => return,
                },
                _ = sweep.tick() => {
                    self.schedule_fetches().await;
                    self.sweep_timeouts();
                }
                _ = quit.changed() => {
                    if *quit.borrow() {
                        debug!("Fetcher shutting down");
                        return;
                    }
                }
            }
            self.import_ready();
        }
    }

    fn handle(&mut self, message: FetcherMessage) {
        match message {
            FetcherMessage::Notify { peer, hash, number } => self.on_notify(peer, hash, number),
            FetcherMessage::Enqueue { peer, block } => self.on_enqueue(peer, block),
            FetcherMessage::FilterHeaders {
                peer,
                headers,
                reply,
            } => {
                let unknown = self.on_headers(&peer, headers);
                let _ = reply.send(unknown);
            }
            FetcherMessage::FilterBodies {
                peer,
                bodies,
                reply,
            } => {
                let unclaimed = self.on_bodies(&peer, bodies);
                let _ = reply.send(unclaimed);
            }
        }
    }

    fn on_notify(&mut self, peer: String, hash: Hash256, number: u64) {
        let count = self.announces.get(&peer).copied().unwrap_or(0);
        if count >= HASH_LIMIT {
            debug!(peer = %peer, limit = HASH_LIMIT, "Peer exceeded outstanding announces");
            (self.demote)(&peer, Penalties::ANNOUNCE_FLOOD);
            return;
        }
        let height = self.chain.current_header().number;
        if number > 0 && !in_announce_window(number, height) {
            trace!(peer = %peer, number, height, "Discarded announcement outside window");
            return;
        }
        if self.fetching.contains_key(&hash)
            || self.fetched.contains_key(&hash)
            || self.completing.contains_key(&hash)
            || self.queued_set.contains(&hash)
        {
            return;
        }
        let pending = self.announced.entry(hash).or_default();
        // Duplicate announcements from the same peer coalesce
        if pending.iter().any(|a| a.origin == peer) {
            return;
        }
        pending.push(Announce {
            hash,
            number,
            origin: peer.clone(),
            time: Instant::now(),
            requested: None,
            header: None,
        });
        *self.announces.entry(peer).or_insert(0) += 1;
    }

    fn on_enqueue(&mut self, peer: String, block: Block) {
        let hash = block.hash();
        let number = block.number();

        let count = self.queues.get(&peer).copied().unwrap_or(0) + 1;
        if count > BLOCK_LIMIT {
            debug!(peer = %peer, limit = BLOCK_LIMIT, "Discarded block, exceeded allowance");
            return;
        }
        let height = self.chain.current_header().number;
        if !in_announce_window(number, height) {
            trace!(peer = %peer, number, height, "Discarded propagated block outside window");
            return;
        }
        if self.queued_set.contains(&hash) || self.chain.has_block(&hash, number) {
            return;
        }

        self.queues.insert(peer.clone(), count);
        self.queued_set.insert(hash);
        self.queue
            .entry(number)
            .or_default()
            .push(QueuedBlock { peer, block });
    }

    fn on_headers(&mut self, peer: &str, headers: Vec<Header>) -> Vec<Header> {
        let mut unknown = Vec::new();
        for header in headers {
            let hash = header.hash();

            let claimed = match self.fetching.get(&hash) {
                Some(announce) => announce.origin == peer,
                None => false,
            };
            if !claimed {
                unknown.push(header);
                continue;
            }
            let Some(mut announce) = self.fetching.remove(&hash) else {
                unknown.push(header);
                continue;
            };
            self.dec_announce(&announce.origin);

            // The delivered header must match the announced number
            if header.number != announce.number {
                debug!(
                    peer = %peer,
                    hash = %hash.short(),
                    announced = announce.number,
                    delivered = header.number,
                    "Announced number mismatch, dropping entry"
                );
                (self.demote)(peer, Penalties::INVALID_ANNOUNCE);
                continue;
            }
            if self.chain.has_block(&hash, header.number) {
                continue;
            }

            if header.tx_root == empty_root() && header.uncle_hash == empty_root() {
                // Header-only block, complete without a body fetch
                trace!(peer = %peer, hash = %hash.short(), "Block empty, skipping body retrieval");
                let mut block = Block::new(header, Body::default());
                block.received_at = Some(announce.time);
                block.received_from = Some(announce.origin.clone());
                self.queue_assembled(announce.origin.clone(), block);
            } else {
                announce.header = Some(header);
                announce.requested = None;
                *self.announces.entry(announce.origin.clone()).or_insert(0) += 1;
                self.fetched.insert(hash, announce);
            }
        }
        unknown
    }

    fn on_bodies(&mut self, peer: &str, bodies: Vec<Body>) -> Vec<Body> {
        let mut unclaimed = Vec::new();
        for body in bodies {
            let tx_root = body.tx_root();
            let uncle_root = body.uncle_root();

            let matched = self.completing.iter().find_map(|(hash, announce)| {
                if announce.origin != peer {
                    return None;
                }
                let header = announce.header.as_ref()?;
                if header.tx_root == tx_root && header.uncle_hash == uncle_root {
                    Some(*hash)
                } else {
                    None
                }
            });

            match matched {
                Some(hash) => {
                    let Some(announce) = self.completing.remove(&hash) else {
                        unclaimed.push(body);
                        continue;
                    };
                    self.dec_announce(&announce.origin);
                    let Some(header) = announce.header else {
                        unclaimed.push(body);
                        continue;
                    };
                    let mut block = Block::new(header, body);
                    block.received_at = Some(announce.time);
                    block.received_from = Some(announce.origin.clone());
                    self.queue_assembled(announce.origin, block);
                }
                None => unclaimed.push(body),
            }
        }
        unclaimed
    }

    /// Dispatch header fetches for matured announcements and body
    /// fetches for delivered headers.
    async fn schedule_fetches(&mut self) {
        let now = Instant::now();
        let height = self.chain.current_header().number;

        // Header fetches: pick one announcing peer per hash at random
        let matured: Vec<Hash256> = self
            .announced
            .iter()
            .filter(|(_, announces)| {
                announces
                    .first()
                    .map(|a| now.duration_since(a.time) >= ARRIVE_TIMEOUT - GATHER_SLACK)
                    .unwrap_or(false)
            })
            .map(|(hash, _)| *hash)
            .collect();

        for hash in matured {
            let Some(mut announces) = self.announced.remove(&hash) else {
                continue;
            };
            let number = announces.first().map(|a| a.number).unwrap_or(0);
            // The chain may have caught up past the announcement
            if number <= height && self.chain.has_block(&hash, number) {
                for announce in &announces {
                    self.dec_announce(&announce.origin);
                }
                continue;
            }
            announces.shuffle(&mut rand::thread_rng());
            let Some(mut pick) = announces.pop() else {
                continue;
            };
            for dropped in &announces {
                self.dec_announce(&dropped.origin);
            }

            match self.peers.peer(&pick.origin) {
                Some(peer) => {
                    trace!(peer = %pick.origin, hash = %hash.short(), "Fetching scheduled header");
                    pick.requested = Some(now);
                    let origin = pick.origin.clone();
                    self.fetching.insert(hash, pick);
                    if peer.request_one_header(hash).await.is_err() {
                        debug!(peer = %origin, "Header request failed, peer gone");
                        self.forget_hash(&hash);
                    }
                }
                None => {
                    self.dec_announce(&pick.origin);
                }
            }
        }

        // Body fetches: batch per origin peer
        let mut per_peer: HashMap<String, Vec<Hash256>> = HashMap::new();
        for (hash, announce) in &self.fetched {
            per_peer
                .entry(announce.origin.clone())
                .or_default()
                .push(*hash);
        }
        for (origin, hashes) in per_peer {
            let Some(peer) = self.peers.peer(&origin) else {
                for hash in &hashes {
                    self.forget_hash(hash);
                }
                continue;
            };
            trace!(peer = %origin, count = hashes.len(), "Fetching scheduled bodies");
            for hash in &hashes {
                if let Some(mut announce) = self.fetched.remove(hash) {
                    announce.requested = Some(now);
                    self.completing.insert(*hash, announce);
                }
            }
            if peer.request_bodies(hashes.clone()).await.is_err() {
                debug!(peer = %origin, "Body request failed, peer gone");
                for hash in &hashes {
                    self.forget_hash(hash);
                }
            }
        }
    }

    /// Expire in-flight requests and demote the unresponsive peers.
    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<(Hash256, String)> = self
            .fetching
            .iter()
            .chain(self.completing.iter())
            .filter(|(_, a)| {
                a.requested
                    .map(|at| now.duration_since(at) > FETCH_TIMEOUT)
                    .unwrap_or(false)
            })
            .map(|(hash, a)| (*hash, a.origin.clone()))
            .collect();

        for (hash, origin) in expired {
            debug!(peer = %origin, hash = %hash.short(), "Fetch timed out, demoting peer");
            self.forget_hash(&hash);
            (self.demote)(&origin, Penalties::MISSING_RESPONSE);
        }
    }

    fn queue_assembled(&mut self, peer: String, block: Block) {
        let hash = block.hash();
        let number = block.number();
        if self.queued_set.contains(&hash) || self.chain.has_block(&hash, number) {
            return;
        }
        self.queued_set.insert(hash);
        self.queue
            .entry(number)
            .or_default()
            .push(QueuedBlock { peer, block });
    }

    /// Import every queued block the chain head permits, in order.
    fn import_ready(&mut self) {
        loop {
            let height = self.chain.current_header().number;
            let Some((&number, _)) = self.queue.iter().next() else {
                return;
            };
            if number > height + 1 {
                return;
            }
            let Some(batch) = self.queue.remove(&number) else {
                return;
            };
            for queued in batch {
                self.import_one(queued, height);
            }
        }
    }

    fn import_one(&mut self, queued: QueuedBlock, height: u64) {
        let block = queued.block;
        let hash = block.hash();
        let number = block.number();

        self.queued_set.remove(&hash);
        if let Some(count) = self.queues.get_mut(&queued.peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.queues.remove(&queued.peer);
            }
        }

        if number <= height && self.chain.has_block(&hash, number) {
            return;
        }
        if !self
            .chain
            .has_block(&block.parent_hash(), number.saturating_sub(1))
        {
            debug!(
                peer = %queued.peer,
                hash = %hash.short(),
                number,
                "Unknown parent of propagated block, discarding"
            );
            return;
        }
        if let Err(err) = self.engine.verify_header(&block.header) {
            warn!(
                peer = %queued.peer,
                hash = %hash.short(),
                error = %err,
                "Propagated block failed verification"
            );
            (self.demote)(&queued.peer, Penalties::BAD_DELIVERY);
            return;
        }

        // Propagate early, then import, then announce availability
        (self.broadcast)(&block, true);
        match (self.inserter)(vec![block.clone()]) {
            Ok(_) => {
                (self.broadcast)(&block, false);
                trace!(hash = %hash.short(), number, "Imported propagated block");
            }
            Err(err) => {
                // The block is dropped; repeated failures feed demotion
                // through the delivery checks, not here
                warn!(hash = %hash.short(), number, error = %err, "Block import failed");
            }
        }
    }

    fn dec_announce(&mut self, peer: &str) {
        if let Some(count) = self.announces.get_mut(peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.announces.remove(peer);
            }
        }
    }

    fn forget_hash(&mut self, hash: &Hash256) {
        if let Some(announces) = self.announced.remove(hash) {
            for announce in &announces {
                self.dec_announce(&announce.origin);
            }
        }
        if let Some(announce) = self.fetching.remove(hash) {
            self.dec_announce(&announce.origin);
        }
        if let Some(announce) = self.fetched.remove(hash) {
            self.dec_announce(&announce.origin);
        }
        if let Some(announce) = self.completing.remove(hash) {
            self.dec_announce(&announce.origin);
        }
    }
}

/// Whether an announced number is close enough to the chain head.
fn in_announce_window(number: u64, height: u64) -> bool {
    let low = height.saturating_sub(MAX_UNCLE_DIST);
    number >= low && number <= height + MAX_QUEUE_DIST
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_types::{MemoryChain, NoopEngine};
    use num_bigint::BigUint;
    use parking_lot::Mutex;

    fn genesis() -> Header {
        Header::empty(0, Hash256::ZERO, BigUint::from(1u32))
    }

    fn child_of(parent: &Header) -> Block {
        let header = Header::empty(
            parent.number + 1,
            parent.hash(),
            BigUint::from(100u32),
        );
        Block::new(header, Body::default())
    }

    struct Fixture {
        fetcher: Fetcher,
        chain: Arc<MemoryChain>,
        imported: Arc<Mutex<Vec<Hash256>>>,
        demoted: Arc<Mutex<Vec<(String, u32)>>>,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(MemoryChain::new(genesis()));
        let peers = Arc::new(PeerSet::new());
        let imported = Arc::new(Mutex::new(Vec::new()));
        let demoted = Arc::new(Mutex::new(Vec::new()));

        let insert_chain = Arc::clone(&chain);
        let insert_log = Arc::clone(&imported);
        let inserter: Inserter = Arc::new(move |blocks: Vec<Block>| {
            for block in &blocks {
                insert_log.lock().push(block.hash());
            }
            insert_chain
                .insert_chain(blocks)
                .map_err(|err| err.to_string())
        });

        let broadcast: Broadcaster = Arc::new(|_, _| {});
        let demote_log = Arc::clone(&demoted);
        let demote: Demoter = Arc::new(move |peer, amount| {
            demote_log.lock().push((peer.to_string(), amount));
        });

        let (_handle, fetcher) = Fetcher::new(
            Arc::clone(&chain) as Arc<dyn BlockChain>,
            Arc::new(NoopEngine),
            peers,
            inserter,
            broadcast,
            demote,
        );
        Fixture {
            fetcher,
            chain,
            imported,
            demoted,
        }
    }

    #[tokio::test]
    async fn test_enqueue_imports_next_block() {
        let mut fx = fixture();
        let block = child_of(&fx.chain.current_header());
        let hash = block.hash();

        fx.fetcher.on_enqueue("peer-a".to_string(), block);
        fx.fetcher.import_ready();

        assert_eq!(fx.imported.lock().as_slice(), &[hash]);
        assert_eq!(fx.chain.height(), 1);
        assert!(fx.fetcher.queued_set.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_waits_for_parent() {
        let mut fx = fixture();
        let b1 = child_of(&fx.chain.current_header());
        let b2 = child_of(&b1.header);

        // Future block first: stays queued until the gap closes
        fx.fetcher.on_enqueue("peer-a".to_string(), b2);
        fx.fetcher.import_ready();
        assert_eq!(fx.chain.height(), 0);

        fx.fetcher.on_enqueue("peer-a".to_string(), b1);
        fx.fetcher.import_ready();
        assert_eq!(fx.chain.height(), 2);
    }

    #[tokio::test]
    async fn test_announce_below_head_is_dropped() {
        let mut fx = fixture();
        // Raise the head well past the announce window
        let mut parent = fx.chain.current_header();
        for _ in 0..10 {
            let block = child_of(&parent);
            parent = block.header.clone();
            fx.chain.insert_chain(vec![block]).unwrap();
        }

        fx.fetcher
            .on_notify("peer-a".to_string(), Hash256::of(b"old"), 1);
        assert!(fx.fetcher.announced.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_announces_coalesce() {
        let mut fx = fixture();
        let hash = Hash256::of(b"future");

        fx.fetcher.on_notify("peer-a".to_string(), hash, 1);
        fx.fetcher.on_notify("peer-a".to_string(), hash, 1);
        fx.fetcher.on_notify("peer-b".to_string(), hash, 1);

        assert_eq!(fx.fetcher.announced.get(&hash).map(Vec::len), Some(2));
        assert_eq!(fx.fetcher.announces.get("peer-a"), Some(&1));
    }

    #[tokio::test]
    async fn test_header_number_mismatch_demotes() {
        let mut fx = fixture();
        let block = child_of(&fx.chain.current_header());
        let hash = block.hash();

        fx.fetcher.fetching.insert(
            hash,
            Announce {
                hash,
                number: 5, // announced as 5, header says 1
                origin: "peer-a".to_string(),
                time: Instant::now(),
                requested: Some(Instant::now()),
                header: None,
            },
        );

        let unknown = fx.fetcher.on_headers("peer-a", vec![block.header.clone()]);
        assert!(unknown.is_empty());
        assert!(fx.fetcher.fetching.is_empty());
        assert!(fx.fetcher.fetched.is_empty());
        assert_eq!(
            fx.demoted.lock().as_slice(),
            &[("peer-a".to_string(), Penalties::INVALID_ANNOUNCE)]
        );
    }

    #[tokio::test]
    async fn test_empty_header_completes_without_body() {
        let mut fx = fixture();
        let block = child_of(&fx.chain.current_header());
        let hash = block.hash();

        fx.fetcher.fetching.insert(
            hash,
            Announce {
                hash,
                number: 1,
                origin: "peer-a".to_string(),
                time: Instant::now(),
                requested: Some(Instant::now()),
                header: None,
            },
        );

        let unknown = fx.fetcher.on_headers("peer-a", vec![block.header.clone()]);
        assert!(unknown.is_empty());
        fx.fetcher.import_ready();
        assert_eq!(fx.chain.height(), 1);
    }

    #[tokio::test]
    async fn test_unclaimed_headers_pass_through() {
        let mut fx = fixture();
        let header = child_of(&fx.chain.current_header()).header;

        let unknown = fx.fetcher.on_headers("peer-a", vec![header.clone()]);
        assert_eq!(unknown, vec![header]);
    }

    #[tokio::test]
    async fn test_body_matched_by_roots() {
        let mut fx = fixture();
        let tx = basalt_types::Transaction::new(0, Hash256::of(b"to"), 1, Vec::new());
        let body = Body {
            transactions: vec![tx],
            uncles: Vec::new(),
        };
        let mut header = Header::empty(
            1,
            fx.chain.current_header().hash(),
            BigUint::from(100u32),
        );
        header.tx_root = body.tx_root();
        header.uncle_hash = body.uncle_root();
        let hash = header.hash();

        fx.fetcher.completing.insert(
            hash,
            Announce {
                hash,
                number: 1,
                origin: "peer-a".to_string(),
                time: Instant::now(),
                requested: Some(Instant::now()),
                header: Some(header),
            },
        );

        let unclaimed = fx.fetcher.on_bodies("peer-a", vec![body]);
        assert!(unclaimed.is_empty());
        fx.fetcher.import_ready();
        assert_eq!(fx.chain.height(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_body_stays_unclaimed() {
        let mut fx = fixture();
        let mut header = Header::empty(
            1,
            fx.chain.current_header().hash(),
            BigUint::from(100u32),
        );
        header.tx_root = Hash256::of(b"some other root");
        let hash = header.hash();

        fx.fetcher.completing.insert(
            hash,
            Announce {
                hash,
                number: 1,
                origin: "peer-a".to_string(),
                time: Instant::now(),
                requested: Some(Instant::now()),
                header: Some(header),
            },
        );

        let stray = Body::default();
        let unclaimed = fx.fetcher.on_bodies("peer-a", vec![stray.clone()]);
        assert_eq!(unclaimed, vec![stray]);
        assert_eq!(fx.fetcher.completing.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_demotes_peer() {
        let mut fx = fixture();
        let hash = Hash256::of(b"slow");

        fx.fetcher.fetching.insert(
            hash,
            Announce {
                hash,
                number: 1,
                origin: "peer-a".to_string(),
                time: Instant::now() - FETCH_TIMEOUT * 2,
                requested: Some(Instant::now() - FETCH_TIMEOUT * 2),
                header: None,
            },
        );

        fx.fetcher.sweep_timeouts();
        assert!(fx.fetcher.fetching.is_empty());
        assert_eq!(
            fx.demoted.lock().as_slice(),
            &[("peer-a".to_string(), Penalties::MISSING_RESPONSE)]
        );
    }

    #[tokio::test]
    async fn test_announce_flood_demotes() {
        let mut fx = fixture();
        for i in 0..HASH_LIMIT {
            fx.fetcher
                .on_notify("peer-a".to_string(), Hash256::of(&[(i / 256) as u8, (i % 256) as u8]), 1);
        }
        assert!(fx.demoted.lock().is_empty());

        fx.fetcher
            .on_notify("peer-a".to_string(), Hash256::of(b"one too many"), 1);
        assert_eq!(
            fx.demoted.lock().as_slice(),
            &[("peer-a".to_string(), Penalties::ANNOUNCE_FLOOD)]
        );
    }
}
