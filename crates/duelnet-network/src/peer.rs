//! Explicit peer table owned by the swarm task.
//!
//! Single-writer discipline: only the swarm loop mutates the store, as a
//! reaction to exactly one event at a time.

use std::collections::HashMap;

use libp2p::{Multiaddr, PeerId};

/// What is known about one remote peer.
///
/// `connected` is derived from live connection events and never mutated
/// independently; addresses are retained across disconnects and dropped
/// only on an explicit remove-peer broadcast.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Known addresses, in learned order, deduped.
    pub addresses: Vec<Multiaddr>,
    pub connected: bool,
    /// Last time anything was learned about the peer (unix ms).
    pub last_seen_ms: i64,
}

/// Peer table: peer id → record.
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address for a peer, creating the record if needed.
    /// Returns true when this created a new record (first discovery).
    pub fn add_address(&mut self, peer_id: PeerId, addr: Multiaddr, now_ms: i64) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(record) => {
                if !record.addresses.contains(&addr) {
                    record.addresses.push(addr);
                }
                record.last_seen_ms = now_ms;
                false
            }
            None => {
                self.peers.insert(
                    peer_id,
                    PeerRecord {
                        peer_id,
                        addresses: vec![addr],
                        connected: false,
                        last_seen_ms: now_ms,
                    },
                );
                true
            }
        }
    }

    /// Flip the derived connected flag. Creates no record: a connection
    /// to an unknown peer is tracked once an address is learned.
    pub fn set_connected(&mut self, peer_id: &PeerId, connected: bool) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.connected = connected;
        }
    }

    /// Remove a peer entirely (explicit remove-peer broadcast).
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Known addresses for a peer, in learned order.
    pub fn addresses(&self, peer_id: &PeerId) -> Vec<Multiaddr> {
        self.peers
            .get(peer_id)
            .map(|r| r.addresses.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerRecord)> {
        self.peers.iter()
    }
}
