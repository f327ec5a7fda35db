//! Discovery-topic payloads.
//!
//! Two payload shapes travel on the discovery topic: a JSON presence
//! announcement, and the literal string `remove-peer:<peerId>` published
//! by the relay when a member's connection closes.

use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Prefix of the remove-peer broadcast.
pub const REMOVE_PEER_PREFIX: &str = "remove-peer:";

/// Presence announcement published on the discovery topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAnnounce {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub addresses: Vec<String>,
}

/// A decoded discovery-topic payload.
#[derive(Debug, Clone)]
pub enum DiscoveryPayload {
    Announce { peer_id: PeerId, addresses: Vec<Multiaddr> },
    RemovePeer(PeerId),
}

/// Encode a presence announcement.
pub fn encode_announce(peer_id: &PeerId, addresses: &[Multiaddr]) -> Vec<u8> {
    let announce = PeerAnnounce {
        peer_id: peer_id.to_string(),
        addresses: addresses.iter().map(|a| a.to_string()).collect(),
    };
    serde_json::to_vec(&announce).unwrap_or_default()
}

/// Encode a remove-peer broadcast.
pub fn encode_remove_peer(peer_id: &PeerId) -> Vec<u8> {
    format!("{REMOVE_PEER_PREFIX}{peer_id}").into_bytes()
}

/// Decode a discovery payload. Unparseable payloads yield `None` and a
/// debug log — discovery is best-effort.
pub fn parse(data: &[u8]) -> Option<DiscoveryPayload> {
    let text = std::str::from_utf8(data).ok()?;

    if let Some(id) = text.strip_prefix(REMOVE_PEER_PREFIX) {
        return match id.parse::<PeerId>() {
            Ok(peer_id) => Some(DiscoveryPayload::RemovePeer(peer_id)),
            Err(e) => {
                debug!(error = %e, "Malformed remove-peer broadcast");
                None
            }
        };
    }

    let announce: PeerAnnounce = match serde_json::from_str(text) {
        Ok(a) => a,
        Err(e) => {
            debug!(error = %e, "Unrecognized discovery payload");
            return None;
        }
    };
    let peer_id = announce.peer_id.parse::<PeerId>().ok()?;
    let addresses = announce
        .addresses
        .iter()
        .filter_map(|a| a.parse::<Multiaddr>().ok())
        .collect();
    Some(DiscoveryPayload::Announce { peer_id, addresses })
}
