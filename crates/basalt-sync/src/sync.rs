//! The syncer and transaction-sync loops.
//!
//! The syncer periodically (and on new-peer registrations) picks the
//! best-TD peer and runs a downloader round against it. The tx-sync
//! loop hands the pending pool content to freshly connected peers, one
//! bounded pack to one randomly chosen scheduled peer at a time.

use crate::downloader::SyncMode;
use crate::{ProtocolManager, SyncError, FORCE_SYNC_INTERVAL, MIN_SYNC_PEERS, TX_SYNC_PACK_SIZE};
use basalt_types::Transaction;
use rand::seq::SliceRandom;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

impl ProtocolManager {
    /// Synchronise the chain with the given peer if it advertises a
    /// heavier chain than ours.
    pub(crate) async fn synchronise_with(self: &Arc<Self>, id: &str) {
        let Some(peer) = self.peers.peer(id) else {
            return;
        };
        // Short circuit if the peer has nothing better to offer
        let head = self.chain.current_header();
        let local_td = self
            .chain
            .total_difficulty(&head.hash(), head.number)
            .unwrap_or_default();
        if peer.td() <= local_td {
            return;
        }

        let mode = if self.fast_sync.load(Ordering::SeqCst) {
            SyncMode::Fast
        } else {
            SyncMode::Full
        };

        let weak = Arc::downgrade(self);
        let remove = move |peer_id: &str| {
            if let Some(manager) = weak.upgrade() {
                manager.remove_peer(peer_id);
            }
        };

        match self.downloader.synchronise(id, mode, &remove).await {
            Ok(()) => {
                // The initial sync is done; transactions are welcome now
                self.accept_txs.store(true, Ordering::SeqCst);
                if self.chain.current_header().number > 0 {
                    // Pivot passed, no point in keeping fast sync armed
                    self.fast_sync.store(false, Ordering::SeqCst);
                }
                // Announce the fresh head so stragglers find us
                let head = self.chain.current_header();
                if head.number > 0 {
                    if let Some(block) = self.chain.block_by_hash(&head.hash()) {
                        self.broadcast_block(&block, false);
                    }
                }
            }
            Err(SyncError::Busy) => {}
            Err(err) => debug!(peer = %id, error = %err, "Sync round failed"),
        }
    }

    /// React to new peers and the force-sync tick until the
    /// no-more-peers signal arrives.
    pub(crate) async fn syncer_loop(
        self: Arc<Self>,
        mut new_peer_rx: mpsc::Receiver<String>,
        mut no_more_peers_rx: mpsc::Receiver<()>,
    ) {
        let mut force = tokio::time::interval(FORCE_SYNC_INTERVAL);
        force.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                peer = new_peer_rx.recv() => match peer {
                    Some(_) => {
                        // Wait for a quorum before reacting to arrivals
                        if self.peers.len() >= MIN_SYNC_PEERS {
                            self.sync_with_best().await;
                        }
                    }
                    None => return,
                },
                _ = force.tick() => {
                    self.sync_with_best().await;
                }
                _ = no_more_peers_rx.recv() => return,
            }
        }
    }

    async fn sync_with_best(self: &Arc<Self>) {
        let Some(best) = self.peers.best_peer() else {
            return;
        };
        let id = best.id().to_string();
        self.synchronise_with(&id).await;
    }

    /// Hand the pending pool to newly connected peers.
    pub(crate) async fn txsync_loop(
        self: Arc<Self>,
        mut txsync_rx: mpsc::Receiver<String>,
        mut quit: watch::Receiver<bool>,
    ) {
        let mut pending: HashMap<String, VecDeque<Transaction>> = HashMap::new();

        loop {
            tokio::select! {
                peer = txsync_rx.recv() => match peer {
                    Some(id) => {
                        let txs = self.pool.pending();
                        if !txs.is_empty() {
                            pending.insert(id, txs.into());
                        }
                    }
                    None => return,
                },
                _ = quit.changed() => {
                    if *quit.borrow() {
                        return;
                    }
                }
            }
            self.drive_tx_syncs(&mut pending).await;
        }
    }

    /// Send queued pool transactions, one pack to one random scheduled
    /// peer at a time.
    async fn drive_tx_syncs(&self, pending: &mut HashMap<String, VecDeque<Transaction>>) {
        while !pending.is_empty() {
            let ids: Vec<String> = pending.keys().cloned().collect();
            let Some(id) = ids.choose(&mut rand::thread_rng()).cloned() else {
                return;
            };
            let Some(queue) = pending.get_mut(&id) else {
                pending.remove(&id);
                continue;
            };

            let mut pack = Vec::new();
            let mut size = 0usize;
            while let Some(tx) = queue.pop_front() {
                size += tx.serialize().len();
                pack.push(tx);
                if size >= TX_SYNC_PACK_SIZE {
                    break;
                }
            }
            if queue.is_empty() {
                pending.remove(&id);
            }

            let Some(peer) = self.peers.peer(&id) else {
                pending.remove(&id);
                continue;
            };
            trace!(peer = %id, count = pack.len(), bytes = size, "Sending pooled transactions");
            if peer.send_transactions(pack).await.is_err() {
                pending.remove(&id);
            }
        }
    }
}
