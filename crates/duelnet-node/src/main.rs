//! Duelnet node — runs one of three roles:
//!
//! - `relay`: the always-on bootstrap/relay overlay member
//! - `peer`: a peer connectivity node joining via a bootstrap address
//! - `lobby`: the matchmaking/lobby server browser clients talk to

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use libp2p::{identity, Multiaddr, PeerId};
use tracing::{info, warn};

use duelnet_lobby::{HttpCardSource, LobbyManager, PassthroughEngine};
use duelnet_network::transport::{self, NetworkConfig, DISCOVERY_TOPIC};
use duelnet_network::{PeerNode, RelayConfig, RelayNode};

enum Role {
    Relay {
        listen_addrs: Vec<Multiaddr>,
        identity_path: Option<PathBuf>,
        topic: String,
    },
    Peer {
        bootstrap: Option<Multiaddr>,
        identity_path: Option<PathBuf>,
        topic: String,
        connect: Option<PeerId>,
        fallback: Vec<String>,
    },
    Lobby {
        bind: String,
        cards_url: String,
    },
}

fn usage() -> ! {
    eprintln!("Duelnet Node");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  duelnet-node relay [-l|--listen <MULTIADDR>]... [-i|--identity <PATH>] [--topic <NAME>]");
    eprintln!("  duelnet-node peer  -b|--bootstrap <MULTIADDR> [-i|--identity <PATH>] [--topic <NAME>]");
    eprintln!("                     [--connect <PEER_ID>] [--fallback <MULTIADDR>]...");
    eprintln!("  duelnet-node lobby [--bind <ADDR:PORT>] [--cards-url <URL>]");
    std::process::exit(1);
}

fn parse_args() -> Role {
    let mut args = std::env::args().skip(1);
    let role = args.next().unwrap_or_else(|| usage());

    match role.as_str() {
        "relay" => {
            let mut listen_addrs = Vec::new();
            let mut identity_path = None;
            let mut topic = DISCOVERY_TOPIC.to_string();
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--listen" | "-l" => {
                        if let Some(addr) = args.next() {
                            match addr.parse() {
                                Ok(addr) => listen_addrs.push(addr),
                                Err(e) => {
                                    eprintln!("Invalid listen address {addr}: {e}");
                                    std::process::exit(1);
                                }
                            }
                        }
                    }
                    "--identity" | "-i" => identity_path = args.next().map(PathBuf::from),
                    "--topic" => {
                        if let Some(name) = args.next() {
                            topic = name;
                        }
                    }
                    _ => usage(),
                }
            }
            Role::Relay {
                listen_addrs,
                identity_path,
                topic,
            }
        }

        "peer" => {
            let mut bootstrap = None;
            let mut identity_path = None;
            let mut topic = DISCOVERY_TOPIC.to_string();
            let mut connect = None;
            let mut fallback = Vec::new();
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--bootstrap" | "-b" => {
                        bootstrap = args.next().and_then(|a| a.parse().ok());
                    }
                    "--identity" | "-i" => identity_path = args.next().map(PathBuf::from),
                    "--topic" => {
                        if let Some(name) = args.next() {
                            topic = name;
                        }
                    }
                    "--connect" => {
                        connect = args.next().and_then(|p| p.parse().ok());
                    }
                    "--fallback" => {
                        if let Some(addr) = args.next() {
                            fallback.push(addr);
                        }
                    }
                    _ => usage(),
                }
            }
            Role::Peer {
                bootstrap,
                identity_path,
                topic,
                connect,
                fallback,
            }
        }

        "lobby" => {
            let mut bind = "0.0.0.0:8080".to_string();
            let mut cards_url = "http://127.0.0.1:3000/cards/batch".to_string();
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--bind" => {
                        if let Some(addr) = args.next() {
                            bind = addr;
                        }
                    }
                    "--cards-url" => {
                        if let Some(url) = args.next() {
                            cards_url = url;
                        }
                    }
                    _ => usage(),
                }
            }
            Role::Lobby { bind, cards_url }
        }

        _ => usage(),
    }
}

/// Load a 32-byte Ed25519 seed from disk, or generate and persist one
/// (mode 0600 on Unix) so the node identity is stable across restarts.
fn load_or_create_identity(path: Option<&PathBuf>) -> Result<identity::Keypair> {
    let Some(path) = path else {
        let keypair = identity::Keypair::generate_ed25519();
        info!(peer_id = %PeerId::from(keypair.public()), "Generated ephemeral identity (use --identity to persist)");
        return Ok(keypair);
    };

    if path.exists() {
        let mut seed: [u8; 32] = std::fs::read(path)
            .with_context(|| format!("read identity from {}", path.display()))?
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity file must be exactly 32 bytes"))?;
        let keypair = identity::Keypair::ed25519_from_bytes(&mut seed)?;
        info!(peer_id = %PeerId::from(keypair.public()), path = %path.display(), "Loaded identity");
        Ok(keypair)
    } else {
        let mut seed = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut seed);
        std::fs::write(path, seed)
            .with_context(|| format!("write identity to {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("set permissions on {}", path.display()))?;
        }
        let keypair = identity::Keypair::ed25519_from_bytes(&mut seed)?;
        info!(peer_id = %PeerId::from(keypair.public()), path = %path.display(), "Generated new identity");
        Ok(keypair)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,duelnet=debug".into()),
        )
        .init();

    match parse_args() {
        Role::Relay {
            listen_addrs,
            identity_path,
            topic,
        } => run_relay(listen_addrs, identity_path, topic).await,
        Role::Peer {
            bootstrap,
            identity_path,
            topic,
            connect,
            fallback,
        } => run_peer(bootstrap, identity_path, topic, connect, fallback).await,
        Role::Lobby { bind, cards_url } => run_lobby(bind, cards_url).await,
    }
}

async fn run_relay(
    listen_addrs: Vec<Multiaddr>,
    identity_path: Option<PathBuf>,
    topic: String,
) -> Result<()> {
    let keypair = load_or_create_identity(identity_path.as_ref())?;
    let mut config = RelayConfig {
        discovery_topic: topic,
        ..RelayConfig::default()
    };
    if !listen_addrs.is_empty() {
        config.listen_addrs = listen_addrs;
    }

    let mut relay = RelayNode::new(keypair, config).await?;
    relay.startup()?;
    let peer_id = relay.local_peer_id();
    let addr = relay.next_listen_addr().await;
    info!(bootstrap = %transport::with_peer_id(addr, peer_id), "Relay bootstrap address");

    tokio::select! {
        _ = relay.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down relay"),
    }
    Ok(())
}

async fn run_peer(
    bootstrap: Option<Multiaddr>,
    identity_path: Option<PathBuf>,
    topic: String,
    connect: Option<PeerId>,
    fallback: Vec<String>,
) -> Result<()> {
    let keypair = load_or_create_identity(identity_path.as_ref())?;
    let config = NetworkConfig {
        bootstrap,
        discovery_topic: topic,
        ..NetworkConfig::default()
    };

    let mut node = PeerNode::startup_with_keypair(keypair, config).await?;
    let mut events = node.take_events().expect("fresh node");

    if let Some(peer_id) = connect {
        let connected = node.connect_to_peer_with_fallback(peer_id, &fallback).await;
        if connected {
            info!(peer = %peer_id, "Connected");
        } else {
            warn!(peer = %peer_id, "All connection strategies exhausted");
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => info!(event = ?event, "Network event"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down peer node");
                break;
            }
        }
    }
    Ok(())
}

async fn run_lobby(bind: String, cards_url: String) -> Result<()> {
    let (manager, handle) = LobbyManager::new(
        Arc::new(HttpCardSource::new(cards_url)),
        Arc::new(PassthroughEngine),
    );
    tokio::spawn(manager.run());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind lobby server on {bind}"))?;

    tokio::select! {
        result = duelnet_lobby::server::serve(listener, handle) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down lobby"),
    }
    Ok(())
}
