//! Public handle for one participant's overlay presence.
//!
//! [`PeerNode`] owns the command side of the swarm task plus the
//! outbound stream cache. Every network operation degrades to a
//! false/not-delivered result rather than failing the caller; retry is
//! caller-driven.

use std::collections::HashMap;

use anyhow::{Context, Result};
use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use libp2p::swarm::Stream;
use libp2p::{identity, Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::swarm::MeshSwarm;
use crate::transport::{
    self, NetworkCommand, NetworkConfig, NetworkEvent, DIAL_TIMEOUT, MAX_FRAME_SIZE,
    MESSAGE_PROTOCOL,
};

/// A peer connectivity node. Exclusively owns its outbound stream
/// cache; at most one live stream per destination is retained.
pub struct PeerNode {
    local_peer_id: PeerId,
    commands: mpsc::UnboundedSender<NetworkCommand>,
    control: libp2p_stream::Control,
    streams: HashMap<Multiaddr, Stream>,
    events: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
}

impl PeerNode {
    /// Join the overlay: enable all configured transports, join the
    /// discovery topic, dial the bootstrap relay and request a circuit
    /// reservation, and register the point-to-point protocol handler.
    pub async fn startup(config: NetworkConfig) -> Result<Self> {
        Self::startup_with_keypair(identity::Keypair::generate_ed25519(), config).await
    }

    pub async fn startup_with_keypair(
        keypair: identity::Keypair,
        config: NetworkConfig,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (mut swarm, commands, control) =
            MeshSwarm::new(keypair, config, event_tx.clone())?;
        let local_peer_id = swarm.local_peer_id();

        swarm.startup()?;
        tokio::spawn(async move { swarm.run().await });

        // Inbound point-to-point frames: log and surface on the event
        // channel.
        let mut incoming = control
            .clone()
            .accept(MESSAGE_PROTOCOL)
            .context("register message protocol handler")?;
        tokio::spawn(async move {
            while let Some((peer_id, stream)) = incoming.next().await {
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    read_frames(peer_id, stream, event_tx).await;
                });
            }
        });

        info!(peer_id = %local_peer_id, "Peer node started");
        Ok(Self {
            local_peer_id,
            commands,
            control,
            streams: HashMap::new(),
            events: Some(event_rx),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Take the node's event receiver. Yields `Some` exactly once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<NetworkEvent>> {
        self.events.take()
    }

    /// Addresses the node is reachable on (listen + confirmed external,
    /// including relayed circuit addresses once a reservation holds).
    pub async fn listen_addresses(&self) -> Vec<Multiaddr> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(NetworkCommand::ListenAddresses { reply: tx })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Multi-strategy connect. Tries, in order: an existing verified
    /// connection, every known address from the local store, then the
    /// caller-supplied fallback addresses. Short-circuits on first
    /// success; returns false when everything is exhausted. Never
    /// fails the caller — each attempt's error is caught and logged.
    pub async fn connect_to_peer_with_fallback(
        &self,
        peer_id: PeerId,
        fallback_addresses: &[String],
    ) -> bool {
        // A connection may already exist, but only count it when the
        // remote address embeds the peer itself, not merely a relay
        // hop. State may have shifted while we were suspended; this is
        // the re-validation point.
        if self.is_connected(peer_id).await {
            debug!(peer = %peer_id, "Already connected");
            return true;
        }

        for addr in self.known_addresses(peer_id).await {
            if transport::is_bare_circuit(&addr) {
                debug!(addr = %addr, "Skipping bare relay-circuit address");
                continue;
            }
            let addr = transport::with_peer_id(addr, peer_id);
            if self.dial_with_timeout(addr).await {
                return true;
            }
        }

        for raw in fallback_addresses {
            let addr: Multiaddr = match raw.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(addr = %raw, error = %e, "Skipping malformed fallback address");
                    continue;
                }
            };
            if transport::is_bare_circuit(&addr) {
                debug!(addr = %addr, "Skipping bare relay-circuit address");
                continue;
            }
            let addr = transport::with_peer_id(addr, peer_id);
            if self.dial_with_timeout(addr).await {
                return true;
            }
        }

        debug!(peer = %peer_id, "All connection strategies exhausted");
        false
    }

    /// Push a serialized message down the cached stream for this
    /// destination, dialing and opening a fresh stream when absent. On
    /// stream error the cache entry is evicted so the next send
    /// re-dials.
    pub async fn send_msg_to_peer(&mut self, addr: &Multiaddr, message: &[u8]) -> bool {
        let Some(peer_id) = transport::terminal_peer_id(addr) else {
            warn!(addr = %addr, "Destination address has no peer identity");
            return false;
        };

        if let Some(stream) = self.streams.get_mut(addr) {
            match write_frame(stream, message).await {
                Ok(()) => {
                    debug!(peer = %peer_id, bytes = message.len(), "Sent message on cached stream");
                    return true;
                }
                Err(e) => {
                    debug!(peer = %peer_id, error = %e, "Cached stream failed, evicting");
                    self.streams.remove(addr);
                    return false;
                }
            }
        }

        if !self.is_connected(peer_id).await && !self.dial_with_timeout(addr.clone()).await {
            return false;
        }

        let mut stream = match self.control.open_stream(peer_id, MESSAGE_PROTOCOL).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(peer = %peer_id, error = %e, "Failed to open message stream");
                return false;
            }
        };

        match write_frame(&mut stream, message).await {
            Ok(()) => {
                debug!(peer = %peer_id, bytes = message.len(), "Sent message on new stream");
                self.streams.insert(addr.clone(), stream);
                true
            }
            Err(e) => {
                debug!(peer = %peer_id, error = %e, "Send on new stream failed");
                false
            }
        }
    }

    /// Join a pub/sub topic.
    pub async fn subscribe_topic(&self, topic: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(NetworkCommand::Subscribe {
                topic: topic.to_string(),
                reply: tx,
            })
            .map_err(|_| anyhow::anyhow!("network task stopped"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("network task stopped"))?
            .map_err(|e| anyhow::anyhow!("subscribe {topic}: {e}"))
    }

    /// Publish to a topic. Zero current subscribers is a logged no-op
    /// inside the swarm task; failures never reach the caller.
    pub fn message_topic(&self, topic: &str, message: Vec<u8>) {
        let _ = self.commands.send(NetworkCommand::Publish {
            topic: topic.to_string(),
            data: message,
        });
    }

    async fn is_connected(&self, peer_id: PeerId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(NetworkCommand::IsConnected { peer_id, reply: tx })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    async fn known_addresses(&self, peer_id: PeerId) -> Vec<Multiaddr> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(NetworkCommand::KnownAddresses { peer_id, reply: tx })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// One dial attempt with the fixed per-attempt timeout. A timeout
    /// abandons this attempt only — the caller advances to the next
    /// candidate.
    async fn dial_with_timeout(&self, addr: Multiaddr) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(NetworkCommand::Dial {
                addr: addr.clone(),
                reply: tx,
            })
            .is_err()
        {
            return false;
        }
        match tokio::time::timeout(DIAL_TIMEOUT, rx).await {
            Ok(Ok(Ok(peer_id))) => {
                debug!(peer = %peer_id, addr = %addr, "Dial succeeded");
                true
            }
            Ok(Ok(Err(e))) => {
                debug!(addr = %addr, error = %e, "Dial attempt failed");
                false
            }
            Ok(Err(_)) => false,
            Err(_) => {
                debug!(addr = %addr, "Dial attempt timed out");
                false
            }
        }
    }
}

/// Write one length-prefixed frame.
async fn write_frame(stream: &mut Stream, payload: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Read frames off an inbound stream until it closes, logging each and
/// surfacing it on the event channel.
async fn read_frames(
    peer_id: PeerId,
    mut stream: Stream,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
) {
    loop {
        let mut len_bytes = [0u8; 4];
        if stream.read_exact(&mut len_bytes).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            warn!(peer = %peer_id, len, "Oversized inbound frame, dropping stream");
            break;
        }
        let mut payload = vec![0u8; len];
        if stream.read_exact(&mut payload).await.is_err() {
            break;
        }
        debug!(
            peer = %peer_id,
            bytes = payload.len(),
            text = %String::from_utf8_lossy(&payload),
            "Inbound message"
        );
        if event_tx
            .send(NetworkEvent::InboundMessage {
                peer_id,
                data: payload,
            })
            .is_err()
        {
            break;
        }
    }
    debug!(peer = %peer_id, "Inbound message stream closed");
}
