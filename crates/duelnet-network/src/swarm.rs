//! Swarm event loop for a peer connectivity node.
//!
//! One task owns the libp2p swarm, the peer store, and all in-flight
//! dial bookkeeping; it reacts to exactly one event at a time, so no
//! locks guard any of this state. Everything else talks to it through
//! the [`NetworkCommand`] / [`NetworkEvent`] channels.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use libp2p::futures::StreamExt;
use libp2p::gossipsub::TopicHash;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{
    dcutr, gossipsub, identify, identity, noise, ping, relay,
    multiaddr::Protocol, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::discovery::{self, DiscoveryPayload};
use crate::peer::PeerStore;
use crate::transport::{NetworkCommand, NetworkConfig, NetworkEvent};

/// Composite behaviour for a peer connectivity node: pub/sub discovery,
/// identity exchange, keepalive, relayed reachability, hole punching,
/// and the point-to-point message protocol.
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct MeshBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

/// The swarm task. Constructed via [`MeshSwarm::new`], then driven by
/// [`MeshSwarm::run`] on its own task.
pub struct MeshSwarm {
    swarm: Swarm<MeshBehaviour>,
    peer_store: PeerStore,
    /// In-flight dials awaiting confirmation, by connection id.
    pending_dials: HashMap<ConnectionId, oneshot::Sender<Result<PeerId, String>>>,
    /// Live connections per peer, with the remote address of each.
    connections: HashMap<PeerId, HashMap<ConnectionId, Multiaddr>>,
    /// Remote subscribers per topic, tracked from gossipsub
    /// subscription events.
    topic_subscribers: HashMap<TopicHash, HashSet<PeerId>>,
    listen_addrs: Vec<Multiaddr>,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    command_rx: mpsc::UnboundedReceiver<NetworkCommand>,
    announce_interval: tokio::time::Interval,
    discovery_topic: gossipsub::IdentTopic,
    config: NetworkConfig,
}

/// Permissive gossipsub tuned for a sparse mesh: flood publishing so a
/// handful of peers behind one relay still see every announcement.
fn gossipsub_config() -> anyhow::Result<gossipsub::Config> {
    gossipsub::ConfigBuilder::default()
        .validation_mode(gossipsub::ValidationMode::Permissive)
        .flood_publish(true)
        .build()
        .map_err(|e| anyhow::anyhow!("gossipsub config: {e}"))
}

impl MeshSwarm {
    /// Build the swarm with every configured transport enabled: TCP,
    /// QUIC, DNS resolution, relayed connections, and dcutr hole
    /// punching over the relay.
    pub fn new(
        keypair: identity::Keypair,
        config: NetworkConfig,
        event_tx: mpsc::UnboundedSender<NetworkEvent>,
    ) -> anyhow::Result<(
        Self,
        mpsc::UnboundedSender<NetworkCommand>,
        libp2p_stream::Control,
    )> {
        let local_peer_id = PeerId::from(keypair.public());
        info!(peer_id = %local_peer_id, "Initializing mesh swarm");

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_quic()
            .with_dns()?
            .with_relay_client(noise::Config::new, yamux::Config::default)?
            .with_behaviour(|key, relay_client| {
                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config()?,
                )?;
                Ok(MeshBehaviour {
                    gossipsub,
                    identify: identify::Behaviour::new(identify::Config::new(
                        "/duelnet/1.0.0".to_string(),
                        key.public(),
                    )),
                    ping: ping::Behaviour::default(),
                    relay_client,
                    dcutr: dcutr::Behaviour::new(key.public().to_peer_id()),
                    stream: libp2p_stream::Behaviour::new(),
                })
            })
            .map_err(|e| anyhow::anyhow!("behaviour setup: {e}"))?
            .with_swarm_config(|cfg| {
                cfg.with_idle_connection_timeout(std::time::Duration::from_secs(120))
            })
            .build();

        let control = swarm.behaviour_mut().stream.new_control();

        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let mut announce_interval = tokio::time::interval(config.announce_interval);
        announce_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let discovery_topic = gossipsub::IdentTopic::new(config.discovery_topic.clone());

        let swarm_task = Self {
            swarm,
            peer_store: PeerStore::new(),
            pending_dials: HashMap::new(),
            connections: HashMap::new(),
            topic_subscribers: HashMap::new(),
            listen_addrs: Vec::new(),
            event_tx,
            command_rx,
            announce_interval,
            discovery_topic,
            config,
        };

        Ok((swarm_task, command_tx, control))
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// Start listening, join the discovery topic, and reach out to the
    /// bootstrap relay: dial it and request a circuit reservation so
    /// mutually unreachable peers can still connect through it.
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

        if let Some(bootstrap) = self.config.bootstrap.clone() {
            if let Err(e) = self.swarm.dial(bootstrap.clone()) {
                warn!(addr = %bootstrap, error = %e, "Failed to dial bootstrap relay");
            }
            let circuit = bootstrap.with(Protocol::P2pCircuit);
            if let Err(e) = self.swarm.listen_on(circuit.clone()) {
                warn!(addr = %circuit, error = %e, "Failed to request relay reservation");
            }
        }

        Ok(())
    }

    /// Main event loop.
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(cmd) => self.handle_command(cmd),
                        // All handles dropped: the node is gone.
                        None => break,
                    }
                }

                _ = self.announce_interval.tick() => {
                    self.announce_self();
                }
            }
        }
        debug!("Mesh swarm loop stopped");
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(event)) => {
                self.handle_gossipsub_event(event);
            }

            SwarmEvent::Behaviour(MeshBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(peer = %peer_id, agent = %info.agent_version, "Identified peer");
                for addr in info.listen_addrs {
                    self.learn_address(peer_id, addr);
                }
            }

            SwarmEvent::Behaviour(MeshBehaviourEvent::Dcutr(event)) => {
                debug!(remote = %event.remote_peer_id, result = ?event.result, "Hole punch attempt finished");
            }

            SwarmEvent::Behaviour(MeshBehaviourEvent::RelayClient(event)) => {
                if let relay::client::Event::ReservationReqAccepted { relay_peer_id, .. } = event {
                    info!(relay = %relay_peer_id, "Relay reservation accepted");
                }
            }

            SwarmEvent::Behaviour(_) => {}

            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                let remote = endpoint.get_remote_address().clone();
                debug!(peer = %peer_id, addr = %remote, "Connection established");

                self.connections
                    .entry(peer_id)
                    .or_default()
                    .insert(connection_id, remote.clone());
                // Only the dialed address is worth remembering; an
                // inbound remote is an ephemeral port.
                if endpoint.is_dialer() {
                    self.learn_address(peer_id, remote);
                }
                self.peer_store.set_connected(&peer_id, true);

                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(peer_id));
                }
                if num_established.get() == 1 {
                    let _ = self
                        .event_tx
                        .send(NetworkEvent::ConnectionOpened { peer_id });
                }
            }

            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                debug!(peer = ?peer_id, error = %error, "Outgoing connection failed");
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(error.to_string()));
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                num_established,
                cause,
                ..
            } => {
                debug!(peer = %peer_id, cause = ?cause, "Connection closed");
                if let Some(conns) = self.connections.get_mut(&peer_id) {
                    conns.remove(&connection_id);
                    if conns.is_empty() {
                        self.connections.remove(&peer_id);
                    }
                }
                if num_established == 0 {
                    self.peer_store.set_connected(&peer_id, false);
                    for subscribers in self.topic_subscribers.values_mut() {
                        subscribers.remove(&peer_id);
                    }
                    let _ = self
                        .event_tx
                        .send(NetworkEvent::ConnectionClosed { peer_id });
                }
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "Listening on address");
                if !self.listen_addrs.contains(&address) {
                    self.listen_addrs.push(address);
                }
            }

            SwarmEvent::ExternalAddrConfirmed { address } => {
                info!(addr = %address, "External address confirmed");
            }

            _ => {}
        }
    }

    fn handle_gossipsub_event(&mut self, event: gossipsub::Event) {
        match event {
            gossipsub::Event::Message { message, .. } => {
                if message.topic == self.discovery_topic.hash() {
                    self.handle_discovery_payload(&message.data);
                } else {
                    let _ = self.event_tx.send(NetworkEvent::TopicMessage {
                        topic: message.topic.to_string(),
                        data: message.data,
                        source: message.source,
                    });
                }
            }
            gossipsub::Event::Subscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "Peer subscribed");
                self.topic_subscribers
                    .entry(topic)
                    .or_default()
                    .insert(peer_id);
            }
            gossipsub::Event::Unsubscribed { peer_id, topic } => {
                if let Some(subscribers) = self.topic_subscribers.get_mut(&topic) {
                    subscribers.remove(&peer_id);
                }
            }
            _ => {}
        }
    }

    fn handle_discovery_payload(&mut self, data: &[u8]) {
        match discovery::parse(data) {
            Some(DiscoveryPayload::Announce { peer_id, addresses }) => {
                if peer_id == self.local_peer_id() {
                    return;
                }
                for addr in addresses {
                    self.learn_address(peer_id, addr);
                }
            }
            Some(DiscoveryPayload::RemovePeer(peer_id)) => {
                if self.peer_store.remove(&peer_id).is_some() {
                    info!(peer = %peer_id, "Peer removed via discovery broadcast");
                    let _ = self.event_tx.send(NetworkEvent::PeerRemoved { peer_id });
                }
            }
            None => {}
        }
    }

    /// Record a learned address; first address for a peer emits
    /// `PeerDiscovered`.
    fn learn_address(&mut self, peer_id: PeerId, addr: Multiaddr) {
        if peer_id == self.local_peer_id() {
            return;
        }
        if self.peer_store.add_address(peer_id, addr, Self::now_ms()) {
            debug!(peer = %peer_id, "Discovered peer");
            let _ = self.event_tx.send(NetworkEvent::PeerDiscovered { peer_id });
        }
    }

    fn handle_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::Dial { addr, reply } => self.start_dial(addr, reply),

            NetworkCommand::IsConnected { peer_id, reply } => {
                let verified = self
                    .connections
                    .get(&peer_id)
                    .map(|conns| {
                        conns
                            .values()
                            .any(|addr| crate::transport::addr_embeds_peer(addr, &peer_id))
                    })
                    .unwrap_or(false);
                let _ = reply.send(verified);
            }

            NetworkCommand::KnownAddresses { peer_id, reply } => {
                let _ = reply.send(self.peer_store.addresses(&peer_id));
            }

            NetworkCommand::Subscribe { topic, reply } => {
                let topic = gossipsub::IdentTopic::new(topic);
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&topic)
                    .map(|_| ())
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }

            NetworkCommand::Publish { topic, data } => {
                let topic = gossipsub::IdentTopic::new(topic);
                self.publish(topic, data);
            }

            NetworkCommand::ListenAddresses { reply } => {
                let mut addrs = self.listen_addrs.clone();
                for addr in self.swarm.external_addresses() {
                    if !addrs.contains(addr) {
                        addrs.push(addr.clone());
                    }
                }
                let _ = reply.send(addrs);
            }
        }
    }

    /// Issue a dial and register the reply under the attempt's
    /// connection id so the swarm events can resolve it later.
    fn start_dial(&mut self, addr: Multiaddr, reply: oneshot::Sender<Result<PeerId, String>>) {
        let opts = match crate::transport::terminal_peer_id(&addr) {
            Some(peer_id) => DialOpts::peer_id(peer_id)
                .addresses(vec![addr])
                .condition(PeerCondition::Always)
                .build(),
            None => DialOpts::unknown_peer_id().address(addr).build(),
        };
        let connection_id = opts.connection_id();

        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.insert(connection_id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e.to_string()));
            }
        }
    }

    /// Publish with the zero-subscriber short circuit: no current
    /// remote subscriber means no network send at all.
    fn publish(&mut self, topic: gossipsub::IdentTopic, data: Vec<u8>) {
        let has_subscribers = self
            .topic_subscribers
            .get(&topic.hash())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !has_subscribers {
            debug!(topic = %topic, "No subscribers on topic, skipping publish");
            return;
        }
        if let Err(e) = self.swarm.behaviour_mut().gossipsub.publish(topic, data) {
            // Best-effort broadcast: log and move on.
            debug!(error = %e, "Publish failed");
        }
    }

    /// Announce local presence on the discovery topic.
    fn announce_self(&mut self) {
        let mut addrs = self.listen_addrs.clone();
        for addr in self.swarm.external_addresses() {
            if !addrs.contains(addr) {
                addrs.push(addr.clone());
            }
        }
        if addrs.is_empty() {
            return;
        }
        let payload = discovery::encode_announce(&self.local_peer_id(), &addrs);
        self.publish(self.discovery_topic.clone(), payload);
    }
}
