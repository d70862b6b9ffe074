//! Replay/dedup tracking for the orchestrator.
//!
//! Keyed by `(sender, nonce)`; entries expire after the configured message
//! TTL and are swept lazily on each insert, so the table never needs its
//! own timer.

use std::collections::HashMap;

use protocol::NodeId;

#[derive(Debug)]
pub struct DedupCache {
    ttl_ms: u64,
    first_seen: HashMap<(NodeId, String), u64>,
}

impl DedupCache {
    pub fn new(ttl_ms: u64) -> Self {
        DedupCache {
            ttl_ms,
            first_seen: HashMap::new(),
        }
    }

    /// Record a `(sender, nonce)` pair.
    ///
    /// Returns `false` when the pair was already present, i.e. the message
    /// is a replay or gossip duplicate. Expired entries are swept first.
    pub fn insert(&mut self, sender: NodeId, nonce: String, now_ms: u64) -> bool {
        self.sweep(now_ms);

        let key = (sender, nonce);
        if self.first_seen.contains_key(&key) {
            return false;
        }
        self.first_seen.insert(key, now_ms);
        true
    }

    pub fn contains(&self, sender: &NodeId, nonce: &str) -> bool {
        self.first_seen
            .contains_key(&(sender.clone(), nonce.to_owned()))
    }

    fn sweep(&mut self, now_ms: u64) {
        let ttl = self.ttl_ms;
        self.first_seen
            .retain(|_, first_seen| now_ms.saturating_sub(*first_seen) <= ttl);
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }
}
