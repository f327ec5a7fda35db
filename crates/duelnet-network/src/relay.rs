//! Relay / bootstrap node — the permanently reachable overlay member.
//!
//! Offers circuit-relay forwarding (unbounded concurrent reservations,
//! each capped at 24 hours), and a permissive pub/sub service used
//! purely for discovery rendezvous, never game data. Heterogeneous
//! clients reach it over plain TCP, QUIC, or WebSocket.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use libp2p::futures::StreamExt;
use libp2p::swarm::SwarmEvent;
use libp2p::{
    gossipsub, identify, identity, noise, ping, relay, tcp, yamux, Multiaddr, PeerId, Swarm,
    SwarmBuilder,
};
use tracing::{debug, info, warn};

use crate::discovery;
use crate::transport::DISCOVERY_TOPIC;

/// Every circuit reservation expires after 24 hours.
pub const RESERVATION_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Behaviour for the relay node: circuit relay service, discovery
/// pub/sub, identity exchange, keepalive.
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct RelayBehaviour {
    pub relay: relay::Behaviour,
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

/// Relay node configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen addresses. Defaults cover a plain socket, its
    /// hole-punchable QUIC variant, and a browser-reachable WebSocket.
    pub listen_addrs: Vec<Multiaddr>,
    /// Discovery topic to join and police.
    pub discovery_topic: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![
                "/ip4/0.0.0.0/tcp/4401".parse().expect("valid multiaddr"),
                "/ip4/0.0.0.0/udp/4401/quic-v1"
                    .parse()
                    .expect("valid multiaddr"),
                "/ip4/0.0.0.0/tcp/4402/ws".parse().expect("valid multiaddr"),
            ],
            discovery_topic: DISCOVERY_TOPIC.to_string(),
        }
    }
}

/// The always-on relay/bootstrap node.
pub struct RelayNode {
    swarm: Swarm<RelayBehaviour>,
    discovery_topic: gossipsub::IdentTopic,
    /// Remote members currently subscribed to the discovery topic.
    subscribers: HashSet<PeerId>,
    listen_addrs: Vec<Multiaddr>,
    config: RelayConfig,
}

impl RelayNode {
    pub async fn new(keypair: identity::Keypair, config: RelayConfig) -> anyhow::Result<Self> {
        let local_peer_id = PeerId::from(keypair.public());
        info!(peer_id = %local_peer_id, "Initializing relay node");

        let swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_quic()
            .with_dns()?
            .with_websocket(noise::Config::new, yamux::Config::default)
            .await?
            .with_behaviour(|key| {
                // Unbounded concurrent reservations, 24h cap each.
                let mut relay_config = relay::Config::default();
                relay_config.max_reservations = usize::MAX;
                relay_config.reservation_duration = RESERVATION_DURATION;

                // Permissive pub/sub: flood on a sparse mesh so two
                // clients behind one relay still hear each other.
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .validation_mode(gossipsub::ValidationMode::Permissive)
                    .flood_publish(true)
                    .build()
                    .map_err(|e| anyhow::anyhow!("gossipsub config: {e}"))?;
                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )?;

                Ok(RelayBehaviour {
                    relay: relay::Behaviour::new(key.public().to_peer_id(), relay_config),
                    gossipsub,
                    identify: identify::Behaviour::new(identify::Config::new(
                        "/duelnet/1.0.0".to_string(),
                        key.public(),
                    )),
                    ping: ping::Behaviour::default(),
                })
            })
            .map_err(|e| anyhow::anyhow!("behaviour setup: {e}"))?
            .with_swarm_config(|cfg| {
                cfg.with_idle_connection_timeout(Duration::from_secs(120))
            })
            .build();

        let discovery_topic = gossipsub::IdentTopic::new(config.discovery_topic.clone());

        Ok(Self {
            swarm,
            discovery_topic,
            subscribers: HashSet::new(),
            listen_addrs: Vec::new(),
            config,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// Start listening on every configured transport and join the
    /// discovery topic as a forwarding member.
    pub fn startup(&mut self) -> anyhow::Result<()> {
        for addr in self.config.listen_addrs.clone() {
            self.swarm
                .listen_on(addr.clone())
                .with_context(|| format!("listen on {addr}"))?;
        }
        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&self.discovery_topic)
            .context("join discovery topic")?;
        Ok(())
    }

    /// Drive the swarm until the first listen address is bound and
    /// return it. Useful when listening on an OS-assigned port.
    pub async fn next_listen_addr(&mut self) -> Multiaddr {
        loop {
            let event = self.swarm.select_next_some().await;
            if let SwarmEvent::NewListenAddr { ref address, .. } = event {
                let address = address.clone();
                self.handle_event(event);
                return address;
            }
            self.handle_event(event);
        }
    }

    /// Main event loop; runs until the process stops.
    pub async fn run(&mut self) {
        loop {
            let event = self.swarm.select_next_some().await;
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<RelayBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(RelayBehaviourEvent::Gossipsub(
                gossipsub::Event::Subscribed { peer_id, topic },
            )) => {
                if topic == self.discovery_topic.hash() {
                    debug!(peer = %peer_id, "Discovery subscriber joined");
                    self.subscribers.insert(peer_id);
                }
            }

            SwarmEvent::Behaviour(RelayBehaviourEvent::Gossipsub(
                gossipsub::Event::Unsubscribed { peer_id, topic },
            )) => {
                if topic == self.discovery_topic.hash() {
                    self.subscribers.remove(&peer_id);
                }
            }

            SwarmEvent::Behaviour(RelayBehaviourEvent::Relay(event)) => {
                debug!(event = ?event, "Relay service event");
            }

            SwarmEvent::Behaviour(_) => {}

            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!(peer = %peer_id, "Member connected");
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.subscribers.remove(&peer_id);
                    self.broadcast_remove_peer(peer_id);
                }
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "Relay listening on address");
                if !self.listen_addrs.contains(&address) {
                    self.listen_addrs.push(address);
                }
            }

            _ => {}
        }
    }

    /// Tell remaining discovery subscribers that a member is gone.
    /// Zero subscribers is a no-op, not an error, and publish failures
    /// are logged and swallowed — discovery is best-effort and never
    /// blocks the relay.
    fn broadcast_remove_peer(&mut self, peer_id: PeerId) {
        if self.subscribers.is_empty() {
            debug!(peer = %peer_id, "No discovery subscribers, skipping remove-peer");
            return;
        }
        let payload = discovery::encode_remove_peer(&peer_id);
        match self
            .swarm
            .behaviour_mut()
            .gossipsub
            .publish(self.discovery_topic.clone(), payload)
        {
            Ok(_) => info!(peer = %peer_id, "Published remove-peer"),
            Err(e) => warn!(peer = %peer_id, error = %e, "remove-peer publish failed"),
        }
    }
}
