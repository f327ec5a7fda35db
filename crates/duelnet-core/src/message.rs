//! Lobby realtime wire messages.
//!
//! Every frame on the lobby WebSocket is a JSON object `{event, data}`.
//! Known lobby events are parsed into [`ClientEvent`]; anything else is
//! match-engine traffic and travels as an opaque [`RawEvent`], forwarded
//! verbatim through the transport bridge once a match has started.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Deck, RoomId, RoomView};

/// An undecoded `{event, data}` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl RawEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Client→server lobby events.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// `joinLobby(roomId)`
    JoinLobby(RoomId),
    /// `sendDeck({roomId, deck})`
    SendDeck { room_id: RoomId, deck: Deck },
    /// `player-ready(roomId)`
    PlayerReady(RoomId),
}

#[derive(Debug, Deserialize)]
struct SendDeckPayload {
    #[serde(rename = "roomId")]
    room_id: RoomId,
    deck: Deck,
}

impl ClientEvent {
    /// Decode a known lobby event from a raw frame. Returns `None` for
    /// unknown event names (match traffic) or malformed payloads.
    pub fn from_frame(frame: &RawEvent) -> Option<Self> {
        match frame.event.as_str() {
            "joinLobby" => {
                let room_id: RoomId = serde_json::from_value(frame.data.clone()).ok()?;
                Some(ClientEvent::JoinLobby(room_id))
            }
            "sendDeck" => {
                let payload: SendDeckPayload = serde_json::from_value(frame.data.clone()).ok()?;
                Some(ClientEvent::SendDeck {
                    room_id: payload.room_id,
                    deck: payload.deck,
                })
            }
            "player-ready" => {
                let room_id: RoomId = serde_json::from_value(frame.data.clone()).ok()?;
                Some(ClientEvent::PlayerReady(room_id))
            }
            _ => None,
        }
    }
}

/// Server→client lobby events.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    LobbyUpdate(RoomView),
    LobbyListUpdate(Vec<RoomView>),
    Error(String),
    GameStarted { lobby_id: RoomId },
    /// Opaque match-engine traffic, forwarded verbatim.
    Raw(RawEvent),
}

impl ServerEvent {
    /// Render as the `{event, data}` wire frame.
    pub fn into_frame(self) -> RawEvent {
        match self {
            ServerEvent::LobbyUpdate(view) => RawEvent::new(
                "lobbyUpdate",
                serde_json::to_value(view).unwrap_or(Value::Null),
            ),
            ServerEvent::LobbyListUpdate(views) => RawEvent::new(
                "lobbyListUpdate",
                serde_json::to_value(views).unwrap_or(Value::Null),
            ),
            ServerEvent::Error(message) => {
                RawEvent::new("error", Value::String(message))
            }
            ServerEvent::GameStarted { lobby_id } => {
                RawEvent::new("gameStarted", serde_json::json!({ "lobbyId": lobby_id }))
            }
            ServerEvent::Raw(frame) => frame,
        }
    }
}
