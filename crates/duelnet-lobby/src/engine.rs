//! Match engine seam.
//!
//! The duel rule engine is an external collaborator: it receives the
//! hydrated two-player roster plus one transport bridge per player and
//! is opaque from then on. [`PassthroughEngine`] is the default wiring
//! used by the node binary — it forwards either player's events to the
//! other verbatim.

use anyhow::{bail, Result};
use serde_json::Value;
use tracing::info;

use duelnet_core::types::{ConnectionId, HydratedDeck};

use crate::bridge::TransportBridge;

/// One entry of the resolved roster handed to the engine.
pub struct MatchPlayer {
    pub connection_id: ConnectionId,
    /// Deck with card ids replaced by full records.
    pub deck: HydratedDeck,
}

/// Handle to a running match, stored on the room. Lifecycle is
/// start → running → externally ended; nothing is persisted here.
pub trait MatchHandle: Send {
    /// Opaque match state, embedded in the playing-rooms listing.
    fn state(&self) -> Value;
}

/// Factory seam for the external rule engine.
pub trait MatchEngine: Send + Sync {
    fn start(
        &self,
        players: Vec<MatchPlayer>,
        bridges: Vec<TransportBridge>,
    ) -> Result<Box<dyn MatchHandle>>;
}

/// Default engine: relays every event from one player's bridge to the
/// other, and announces when the opponent's channel closes.
pub struct PassthroughEngine;

struct PassthroughHandle {
    players: Vec<ConnectionId>,
    started_at_ms: i64,
}

impl MatchHandle for PassthroughHandle {
    fn state(&self) -> Value {
        serde_json::json!({
            "engine": "passthrough",
            "players": self.players,
            "startedAt": self.started_at_ms,
        })
    }
}

impl MatchEngine for PassthroughEngine {
    fn start(
        &self,
        players: Vec<MatchPlayer>,
        bridges: Vec<TransportBridge>,
    ) -> Result<Box<dyn MatchHandle>> {
        if players.len() != 2 || bridges.len() != 2 {
            bail!("passthrough engine needs exactly two players");
        }

        for (own, other) in [(0usize, 1usize), (1, 0)] {
            let peer = bridges[other].clone();
            bridges[own].on_message(move |event, data| {
                peer.send(event, data.clone());
            });

            let peer = bridges[other].clone();
            bridges[own].on_disconnect(move || {
                peer.send("opponentLeft", Value::Null);
            });
        }

        let roster: Vec<ConnectionId> = players.iter().map(|p| p.connection_id).collect();
        info!(players = ?roster, "Match started");

        Ok(Box::new(PassthroughHandle {
            players: roster,
            started_at_ms: chrono::Utc::now().timestamp_millis(),
        }))
    }
}
