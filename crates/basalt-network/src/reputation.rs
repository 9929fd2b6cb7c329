//! Peer demerit accounting.
//!
//! Misbehaving peers are not dropped on the first offence; demerits
//! accumulate per peer id and only crossing the threshold warrants a
//! disconnect. The table is the negative-signal sink for fetcher
//! timeouts and bad deliveries.

use dashmap::DashMap;

/// Demerit amounts for peer misbehaviors.
pub struct Penalties;

impl Penalties {
    /// No response to a request before its deadline.
    pub const MISSING_RESPONSE: u32 = 25;

    /// Announced data that did not match what was delivered.
    pub const INVALID_ANNOUNCE: u32 = 40;

    /// Delivered data that failed validation.
    pub const BAD_DELIVERY: u32 = 50;

    /// Flooded the announce table.
    pub const ANNOUNCE_FLOOD: u32 = 60;

    /// Demerit total that gets a peer dropped.
    pub const DROP_THRESHOLD: u32 = 100;
}

/// Per-peer demerit table.
pub struct ReputationTable {
    demerits: DashMap<String, u32>,
}

impl ReputationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            demerits: DashMap::new(),
        }
    }

    /// Add demerits to a peer.
    ///
    /// Returns `true` when the peer's total crosses the drop threshold.
    pub fn penalize(&self, id: &str, amount: u32) -> bool {
        let mut entry = self.demerits.entry(id.to_string()).or_insert(0);
        *entry = entry.saturating_add(amount);
        *entry >= Penalties::DROP_THRESHOLD
    }

    /// Current demerit total for a peer.
    pub fn demerits(&self, id: &str) -> u32 {
        self.demerits.get(id).map(|v| *v).unwrap_or(0)
    }

    /// Forget a peer, typically on unregister.
    pub fn clear(&self, id: &str) {
        self.demerits.remove(id);
    }
}

impl Default for ReputationTable {
    fn default() -> Self {
        Self::new()
    }
}
