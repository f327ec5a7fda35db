//! End-to-end connectivity tests: a relay/bootstrap node plus two peer
//! nodes on loopback, exercising discovery, fallback connect, and
//! point-to-point messaging — and the failure paths that must degrade
//! to `false` instead of erroring.

use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tokio::time::timeout;

use duelnet_network::transport::{self, NetworkConfig};
use duelnet_network::{NetworkEvent, PeerNode, RelayConfig, RelayNode};

const LONG: Duration = Duration::from_secs(60);

fn peer_config(bootstrap: Option<Multiaddr>) -> NetworkConfig {
    NetworkConfig {
        bootstrap,
        listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
        announce_interval: Duration::from_secs(2),
        ..NetworkConfig::default()
    }
}

/// Start a relay on an OS-assigned port and return the node handle
/// task plus its bootstrap address (with embedded peer id).
async fn start_relay() -> Multiaddr {
    let keypair = libp2p::identity::Keypair::generate_ed25519();
    let config = RelayConfig {
        listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
        ..RelayConfig::default()
    };
    let mut relay = RelayNode::new(keypair, config).await.expect("relay init");
    relay.startup().expect("relay startup");
    let peer_id = relay.local_peer_id();
    let addr = relay.next_listen_addr().await;
    tokio::spawn(async move { relay.run().await });
    transport::with_peer_id(addr, peer_id)
}

async fn wait_for_event<F>(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<NetworkEvent>,
    mut predicate: F,
) -> NetworkEvent
where
    F: FnMut(&NetworkEvent) -> bool,
{
    timeout(LONG, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn fallback_with_no_addresses_returns_false() {
    let node = PeerNode::startup(peer_config(None)).await.expect("startup");

    // Unknown peer, no known addresses, no fallback addresses.
    let connected = node
        .connect_to_peer_with_fallback(PeerId::random(), &[])
        .await;
    assert!(!connected);
}

#[tokio::test]
async fn fallback_with_bad_addresses_returns_false() {
    let node = PeerNode::startup(peer_config(None)).await.expect("startup");

    // One malformed address (skipped with a log) and one well-formed
    // but unreachable address (dial refused). Neither may escape as an
    // error.
    let connected = node
        .connect_to_peer_with_fallback(
            PeerId::random(),
            &["/invalid/addr".to_string(), "/ip4/127.0.0.1/tcp/1".to_string()],
        )
        .await;
    assert!(!connected);
}

#[tokio::test]
async fn publish_with_zero_subscribers_is_a_noop() {
    let node = PeerNode::startup(peer_config(None)).await.expect("startup");

    node.subscribe_topic("lonely-topic").await.expect("subscribe");
    // Nobody else subscribed: short-circuits inside the swarm task.
    node.message_topic("lonely-topic", b"anyone there?".to_vec());

    // The node stays usable afterwards.
    node.subscribe_topic("another-topic").await.expect("subscribe");
}

#[tokio::test]
async fn relay_discovery_connect_and_messaging() {
    let bootstrap = start_relay().await;

    let mut node_a = PeerNode::startup(peer_config(Some(bootstrap.clone())))
        .await
        .expect("node a startup");
    let mut node_b = PeerNode::startup(peer_config(Some(bootstrap)))
        .await
        .expect("node b startup");

    let id_a = node_a.local_peer_id();
    let id_b = node_b.local_peer_id();
    let mut events_a = node_a.take_events().expect("events");
    let mut events_b = node_b.take_events().expect("events");

    // Presence announcements flow through the relay's discovery topic.
    wait_for_event(&mut events_a, |e| {
        matches!(e, NetworkEvent::PeerDiscovered { peer_id } if *peer_id == id_b)
    })
    .await;

    // Known addresses from the announcement are enough — no fallback
    // addresses supplied.
    assert!(node_a.connect_to_peer_with_fallback(id_b, &[]).await);

    // A second call short-circuits on the live verified connection.
    assert!(node_a.connect_to_peer_with_fallback(id_b, &[]).await);

    // Point-to-point frame, addressed by b's listen address.
    let addr_b = node_b
        .listen_addresses()
        .await
        .into_iter()
        .find(|a| !transport::is_bare_circuit(a))
        .expect("b has a dialable address");
    let addr_b = transport::with_peer_id(addr_b, id_b);

    assert!(node_a.send_msg_to_peer(&addr_b, b"hello from a").await);

    let event = wait_for_event(&mut events_b, |e| {
        matches!(e, NetworkEvent::InboundMessage { peer_id, .. } if *peer_id == id_a)
    })
    .await;
    match event {
        NetworkEvent::InboundMessage { data, .. } => assert_eq!(data, b"hello from a"),
        _ => unreachable!(),
    }

    // When b goes away its relay connection closes and the relay
    // broadcasts remove-peer to the remaining subscriber.
    drop(node_b);
    wait_for_event(&mut events_a, |e| {
        matches!(e, NetworkEvent::PeerRemoved { peer_id } if *peer_id == id_b)
    })
    .await;
}
