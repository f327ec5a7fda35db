//! Core types for duelnet — ids, decks, room views, lobby wire messages.

pub mod message;
pub mod types;

pub use message::{ClientEvent, RawEvent, ServerEvent};
pub use types::{
    Card, CardId, ConnectionId, Deck, HydratedDeck, LobbyError, PlayerView, RoomId, RoomView,
};
