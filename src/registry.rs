//! In-memory set of peers currently reachable for drops.
//!
//! The registry is pure state: it is owned by the coordinator task, which is
//! the only writer, and it never talks to the network. Readers get cloned
//! snapshots.

use std::{collections::HashMap, time::Duration};

use arkdrop_entities::{PeerId, PeerMetadata};
use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerMetadata>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a peer.
    ///
    /// `last_seen` only moves forward. Returns `true` when a subscriber would
    /// see a difference: a new peer, a renamed peer or changed addresses.
    pub fn upsert(&mut self, metadata: PeerMetadata) -> bool {
        match self.peers.get_mut(&metadata.peer_id) {
            Some(existing) => {
                let changed = existing.display_name != metadata.display_name
                    || existing.addresses != metadata.addresses;
                existing.display_name = metadata.display_name;
                existing.addresses = metadata.addresses;
                existing.last_seen = existing.last_seen.max(metadata.last_seen);
                changed
            }
            None => {
                self.peers.insert(metadata.peer_id.clone(), metadata);
                true
            }
        }
    }

    /// Removes a peer. Transfers already in flight with it are unaffected.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerMetadata> {
        self.peers.remove(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerMetadata> {
        self.peers.get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Snapshot ordered by `last_seen`, most recent first. Ties are broken
    /// by peer id so the order is stable.
    pub fn list(&self) -> Vec<PeerMetadata> {
        let mut peers: Vec<PeerMetadata> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        peers
    }

    /// Drops every peer not seen within `max_age`.
    pub fn evict_stale(&mut self, max_age: Duration) -> Vec<PeerId> {
        self.evict_stale_at(Utc::now(), max_age)
    }

    pub fn evict_stale_at(
        &mut self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Vec<PeerId> {
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or(chrono::Duration::MAX);
        let mut evicted: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| now.signed_duration_since(p.last_seen) > max_age)
            .map(|p| p.peer_id.clone())
            .collect();
        evicted.sort();
        for peer_id in &evicted {
            self.peers.remove(peer_id);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
