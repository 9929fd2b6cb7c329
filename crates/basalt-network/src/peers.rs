//! The peer set.
//!
//! Thread-safe registry of handshaked peers. All mutation goes through
//! one readers-writer lock; after [`PeerSet::close`] no registration
//! ever succeeds again.

use crate::{NetworkError, NetworkResult, Peer};
use basalt_types::Hash256;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct PeerSetInner {
    peers: HashMap<String, Arc<Peer>>,
    closed: bool,
}

/// Registry of currently connected peers, keyed by peer id.
pub struct PeerSet {
    inner: RwLock<PeerSetInner>,
}

impl PeerSet {
    /// Create an empty peer set.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PeerSetInner {
                peers: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register a handshaked peer.
    pub fn register(&self, peer: Arc<Peer>) -> NetworkResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(NetworkError::PeerSetClosed);
        }
        if inner.peers.contains_key(peer.id()) {
            return Err(NetworkError::AlreadyRegistered);
        }
        debug!(peer = %peer.id(), "Registering peer");
        inner.peers.insert(peer.id().to_string(), peer);
        Ok(())
    }

    /// Remove a peer from the set. Removing an absent id is a no-op.
    pub fn unregister(&self, id: &str) -> Option<Arc<Peer>> {
        let removed = self.inner.write().peers.remove(id);
        if let Some(peer) = &removed {
            debug!(peer = %id, "Unregistered peer");
            peer.close();
        }
        removed
    }

    /// Look up a peer by id.
    pub fn peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.inner.read().peers.get(id).cloned()
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }

    /// Whether [`PeerSet::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// All registered peers.
    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.inner.read().peers.values().cloned().collect()
    }

    /// Peers not known to have the given block.
    pub fn peers_without_block(&self, hash: &Hash256) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| !p.knows_block(hash))
            .cloned()
            .collect()
    }

    /// Peers not known to have the given transaction.
    pub fn peers_without_tx(&self, hash: &Hash256) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| !p.knows_transaction(hash))
            .cloned()
            .collect()
    }

    /// The peer advertising the highest total difficulty.
    pub fn best_peer(&self) -> Option<Arc<Peer>> {
        self.inner
            .read()
            .peers
            .values()
            .max_by_key(|p| p.td())
            .cloned()
    }

    /// Close the set: disconnect every peer and refuse new registrations.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) {
        let peers: Vec<Arc<Peer>> = {
            let mut inner = self.inner.write();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.peers.values().cloned().collect()
        };
        for peer in peers {
            peer.close();
        }
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}
