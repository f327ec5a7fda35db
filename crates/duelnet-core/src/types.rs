//! Domain types shared between the lobby server and its clients.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Room identifier — UUID v4, allocated by the lobby on create.
pub type RoomId = String;

/// Lobby connection identifier, allocated per accepted client connection.
pub type ConnectionId = u64;

/// Numeric card identifier as referenced by decks.
pub type CardId = u64;

/// A full card record as returned by the card-resolution service.
/// Opaque to this layer — only the `id` field is interpreted.
pub type Card = Value;

/// A deck as submitted by a player: named lists of card ids
/// (e.g. "main" / "extra" / "side"). No legality validation happens here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Deck(pub BTreeMap<String, Vec<CardId>>);

impl Deck {
    /// Union of every card id referenced by any list in the deck.
    pub fn card_ids(&self) -> BTreeSet<CardId> {
        self.0.values().flatten().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|list| list.is_empty())
    }
}

/// A deck with ids replaced by full card records, in list order.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct HydratedDeck(pub BTreeMap<String, Vec<Card>>);

/// Per-player state as exposed to clients. Deck contents are never
/// exposed — only whether a deck has been submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerView {
    pub ready: bool,
    #[serde(rename = "hasDeck")]
    pub has_deck: bool,
}

/// Room state as broadcast to clients and returned by the REST surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomView {
    pub id: RoomId,
    pub players: Vec<PlayerView>,
    pub full: bool,
}

/// Protocol/state errors surfaced to the originating connection only.
#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    #[error("room {0} is full")]
    RoomFull(RoomId),
    #[error("room {0} does not exist")]
    RoomNotFound(RoomId),
    #[error("connection is not a player in room {0}")]
    NotInRoom(RoomId),
}

/// Lobby protocol constants.
pub mod constants {
    /// A room holds at most two players.
    pub const MAX_PLAYERS_PER_ROOM: usize = 2;
}
