//! Narrow interface to the overlay library — typed commands and events,
//! node configuration, protocol/topic constants, and multiaddr helpers.

use std::time::Duration;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use tokio::sync::oneshot;

/// Discovery topic every participant joins for presence rendezvous.
pub const DISCOVERY_TOPIC: &str = "duelnet/discovery/1";

/// Point-to-point messaging protocol. Frames are length-prefixed raw
/// byte buffers, UTF-8 text by convention.
pub const MESSAGE_PROTOCOL: StreamProtocol = StreamProtocol::new("/duelnet/msg/1.0.0");

/// Hard per-attempt dial timeout. Exceeding it abandons only that
/// attempt, never the enclosing fallback operation.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between presence announcements on the discovery topic.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on a single point-to-point frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Commands sent from the [`crate::node::PeerNode`] handle to the swarm
/// task. Commands that have an outcome carry a oneshot reply; dropping
/// the reply sender is how the swarm reports failure it cannot name.
#[derive(Debug)]
pub enum NetworkCommand {
    /// Dial an address. Replies once the connection is established or
    /// the attempt failed.
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<PeerId, String>>,
    },
    /// Is there a live connection whose remote address embeds this peer
    /// as its terminal identity (not merely a relay hop)?
    IsConnected {
        peer_id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    /// Known addresses for a peer, in learned order.
    KnownAddresses {
        peer_id: PeerId,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Join a pub/sub topic.
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Publish to a joined topic. Zero current subscribers is a logged
    /// no-op, not an error.
    Publish { topic: String, data: Vec<u8> },
    /// Addresses the swarm is currently listening on (external
    /// addresses included).
    ListenAddresses {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// Events emitted by the swarm task to the node's consumer.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A peer became known (first address learned).
    PeerDiscovered { peer_id: PeerId },
    /// A peer was removed via an explicit remove-peer broadcast.
    PeerRemoved { peer_id: PeerId },
    /// First live connection to a peer opened.
    ConnectionOpened { peer_id: PeerId },
    /// Last live connection to a peer closed. Addresses are retained.
    ConnectionClosed { peer_id: PeerId },
    /// A message arrived on a joined topic (non-discovery payloads).
    TopicMessage {
        topic: String,
        data: Vec<u8>,
        source: Option<PeerId>,
    },
    /// An inbound point-to-point frame.
    InboundMessage { peer_id: PeerId, data: Vec<u8> },
}

/// Peer connectivity node configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bootstrap/relay address, embedding the relay's peer id.
    pub bootstrap: Option<Multiaddr>,
    /// Listen addresses for direct reachability.
    pub listen_addrs: Vec<Multiaddr>,
    /// Discovery topic name.
    pub discovery_topic: String,
    /// Presence announce interval.
    pub announce_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bootstrap: None,
            listen_addrs: vec![
                "/ip4/0.0.0.0/tcp/0".parse().expect("valid multiaddr"),
                "/ip4/0.0.0.0/udp/0/quic-v1".parse().expect("valid multiaddr"),
            ],
            discovery_topic: DISCOVERY_TOPIC.to_string(),
            announce_interval: ANNOUNCE_INTERVAL,
        }
    }
}

/// The peer id embedded at the end of an address, if any. For a relayed
/// address `/…/p2p/<relay>/p2p-circuit/p2p/<dst>` this is the
/// destination, not the relay hop.
pub fn terminal_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer_id)) => Some(peer_id),
        _ => None,
    }
}

/// Whether the address identifies `peer_id` as its terminal identity.
pub fn addr_embeds_peer(addr: &Multiaddr, peer_id: &PeerId) -> bool {
    terminal_peer_id(addr).as_ref() == Some(peer_id)
}

/// A raw relay-circuit address with no destination suffix
/// (`/…/p2p-circuit` not followed by `/p2p/<dst>`). Such addresses
/// cannot be dialed directly.
pub fn is_bare_circuit(addr: &Multiaddr) -> bool {
    let mut bare = false;
    for protocol in addr.iter() {
        match protocol {
            Protocol::P2pCircuit => bare = true,
            Protocol::P2p(_) if bare => bare = false,
            _ => {}
        }
    }
    bare
}

/// Ensure the address carries the peer identity as its terminal
/// component, appending it when absent so the dial verifies identity.
pub fn with_peer_id(addr: Multiaddr, peer_id: PeerId) -> Multiaddr {
    if addr_embeds_peer(&addr, &peer_id) {
        addr
    } else {
        addr.with(Protocol::P2p(peer_id))
    }
}
