//! Room registry — the matchmaking/readiness state machine.
//!
//! Pure synchronous state, owned by the manager task (single-writer).
//! The start decision is computed inside the same mutation that flips
//! the last ready flag, and a `starting` latch guarantees the match
//! handle transitions unset→set at most once even when ready signals
//! race within one tick.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use duelnet_core::types::{
    constants::MAX_PLAYERS_PER_ROOM, ConnectionId, Deck, LobbyError, PlayerView, RoomId, RoomView,
};

use crate::engine::MatchHandle;

/// One player slot. The deck is attached by submit-deck, the ready
/// flag by the ready message; neither resets after match start.
pub struct PlayerSlot {
    pub connection_id: ConnectionId,
    pub deck: Option<Deck>,
    pub ready: bool,
}

/// A room: at most two ordered player slots plus, once running, the
/// match handle.
pub struct Room {
    pub id: RoomId,
    players: Vec<PlayerSlot>,
    match_handle: Option<Box<dyn MatchHandle>>,
    /// Latched when a start has been triggered and not aborted.
    starting: bool,
}

impl Room {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            players: Vec::new(),
            match_handle: None,
            starting: false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= MAX_PLAYERS_PER_ROOM
    }

    pub fn has_match(&self) -> bool {
        self.match_handle.is_some()
    }

    pub fn players(&self) -> &[PlayerSlot] {
        &self.players
    }

    fn slot_mut(&mut self, connection_id: ConnectionId) -> Option<&mut PlayerSlot> {
        self.players
            .iter_mut()
            .find(|slot| slot.connection_id == connection_id)
    }

    fn contains(&self, connection_id: ConnectionId) -> bool {
        self.players
            .iter()
            .any(|slot| slot.connection_id == connection_id)
    }

    /// Client-facing view. Deck contents are never exposed.
    pub fn view(&self) -> RoomView {
        RoomView {
            id: self.id.clone(),
            players: self
                .players
                .iter()
                .map(|slot| PlayerView {
                    ready: slot.ready,
                    has_deck: slot.deck.is_some(),
                })
                .collect(),
            full: self.is_full(),
        }
    }

    /// View with the embedded opaque match state, for rooms with an
    /// active match.
    pub fn playing_view(&self) -> Option<Value> {
        let handle = self.match_handle.as_ref()?;
        let mut view = serde_json::to_value(self.view()).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = view {
            map.insert("match".to_string(), handle.state());
        }
        Some(view)
    }
}

/// roomId → Room table. Owned by the lobby manager task; mutation is
/// serialized through its command channel.
#[derive(Default)]
pub struct Rooms {
    rooms: BTreeMap<RoomId, Room>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an empty room and return its id.
    pub fn create_room(&mut self) -> RoomId {
        let id = uuid::Uuid::new_v4().to_string();
        self.rooms.insert(id.clone(), Room::new(id.clone()));
        debug!(room = %id, "Room created");
        id
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    fn get_mut(&mut self, room_id: &str) -> Result<&mut Room, LobbyError> {
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))
    }

    /// Append a player slot. A full room is left unmutated. Joining a
    /// room the connection is already in is a no-op.
    pub fn join(&mut self, room_id: &str, connection_id: ConnectionId) -> Result<(), LobbyError> {
        let room = self.get_mut(room_id)?;
        if room.contains(connection_id) {
            return Ok(());
        }
        if room.is_full() {
            return Err(LobbyError::RoomFull(room_id.to_string()));
        }
        room.players.push(PlayerSlot {
            connection_id,
            deck: None,
            ready: false,
        });
        Ok(())
    }

    /// Attach a deck to the matching slot. No legality validation.
    pub fn submit_deck(
        &mut self,
        room_id: &str,
        connection_id: ConnectionId,
        deck: Deck,
    ) -> Result<(), LobbyError> {
        let room = self.get_mut(room_id)?;
        let slot = room
            .slot_mut(connection_id)
            .ok_or_else(|| LobbyError::NotInRoom(room_id.to_string()))?;
        slot.deck = Some(deck);
        Ok(())
    }

    /// Mark a slot ready. Returns true when this call is the one that
    /// must trigger the match start: both slots occupied and ready, no
    /// start triggered yet, no match installed. Any later call returns
    /// false — the start fires exactly once.
    pub fn set_ready(
        &mut self,
        room_id: &str,
        connection_id: ConnectionId,
    ) -> Result<bool, LobbyError> {
        let room = self.get_mut(room_id)?;
        let slot = room
            .slot_mut(connection_id)
            .ok_or_else(|| LobbyError::NotInRoom(room_id.to_string()))?;
        slot.ready = true;

        let start = room.players.len() == MAX_PLAYERS_PER_ROOM
            && room.players.iter().all(|slot| slot.ready)
            && !room.starting
            && room.match_handle.is_none();
        if start {
            room.starting = true;
        }
        Ok(start)
    }

    /// Snapshot of the start inputs: each player's connection and deck
    /// (missing decks count as empty).
    pub fn start_inputs(&self, room_id: &str) -> Option<Vec<(ConnectionId, Deck)>> {
        let room = self.rooms.get(room_id)?;
        Some(
            room.players
                .iter()
                .map(|slot| (slot.connection_id, slot.deck.clone().unwrap_or_default()))
                .collect(),
        )
    }

    /// Store the match handle. Succeeds only for a triggered start
    /// with no handle yet — the unset→set transition happens at most
    /// once per room.
    pub fn install_match(&mut self, room_id: &str, handle: Box<dyn MatchHandle>) -> bool {
        match self.rooms.get_mut(room_id) {
            Some(room) if room.starting && room.match_handle.is_none() => {
                room.match_handle = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// Roll back a failed start attempt: clear the latch and both
    /// ready flags so a fresh pair of ready signals can retry. Decks
    /// are kept.
    pub fn abort_start(&mut self, room_id: &str) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.starting = false;
            for slot in &mut room.players {
                slot.ready = false;
            }
        }
    }

    /// Remove a connection from every room containing it. Rooms left
    /// empty are destroyed. Returns the ids of rooms that still exist
    /// and changed.
    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> Vec<RoomId> {
        let mut changed = Vec::new();
        let mut emptied = Vec::new();

        for (id, room) in self.rooms.iter_mut() {
            let before = room.players.len();
            room.players
                .retain(|slot| slot.connection_id != connection_id);
            if room.players.len() != before {
                if room.players.is_empty() {
                    emptied.push(id.clone());
                } else {
                    changed.push(id.clone());
                }
            }
        }
        for id in &emptied {
            debug!(room = %id, "Room destroyed (last player left)");
            self.rooms.remove(id);
        }
        changed
    }

    /// The room with an active match this connection plays in, if any.
    pub fn playing_room_of(&self, connection_id: ConnectionId) -> Option<&Room> {
        self.rooms
            .values()
            .find(|room| room.has_match() && room.contains(connection_id))
    }

    pub fn views(&self) -> Vec<RoomView> {
        self.rooms.values().map(Room::view).collect()
    }

    pub fn playing_views(&self) -> Vec<Value> {
        self.rooms.values().filter_map(Room::playing_view).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubHandle;

    impl MatchHandle for StubHandle {
        fn state(&self) -> Value {
            serde_json::json!({"stub": true})
        }
    }

    fn deck() -> Deck {
        let mut lists = BTreeMap::new();
        lists.insert("main".to_string(), vec![1, 2, 3]);
        Deck(lists)
    }

    #[test]
    fn third_join_fails_and_leaves_room_unmutated() {
        let mut rooms = Rooms::new();
        let id = rooms.create_room();

        rooms.join(&id, 1).unwrap();
        rooms.join(&id, 2).unwrap();

        match rooms.join(&id, 3) {
            Err(LobbyError::RoomFull(room)) => assert_eq!(room, id),
            other => panic!("expected RoomFull, got {other:?}"),
        }

        let room = rooms.get(&id).unwrap();
        assert_eq!(room.players().len(), 2);
        assert!(room.players().iter().all(|s| s.connection_id != 3));
    }

    #[test]
    fn rejoin_is_a_noop() {
        let mut rooms = Rooms::new();
        let id = rooms.create_room();
        rooms.join(&id, 1).unwrap();
        rooms.join(&id, 1).unwrap();
        assert_eq!(rooms.get(&id).unwrap().players().len(), 1);
    }

    #[test]
    fn join_unknown_room_fails() {
        let mut rooms = Rooms::new();
        assert!(matches!(
            rooms.join("nope", 1),
            Err(LobbyError::RoomNotFound(_))
        ));
    }

    #[test]
    fn view_exposes_flags_but_never_deck_contents() {
        let mut rooms = Rooms::new();
        let id = rooms.create_room();
        rooms.join(&id, 1).unwrap();
        rooms.join(&id, 2).unwrap();
        rooms.submit_deck(&id, 1, deck()).unwrap();

        let view = rooms.get(&id).unwrap().view();
        assert!(view.full);
        assert_eq!(view.players[0], PlayerView { ready: false, has_deck: true });
        assert_eq!(view.players[1], PlayerView { ready: false, has_deck: false });

        let json = serde_json::to_value(&view).unwrap();
        assert!(json["players"][0].get("deck").is_none());
    }

    #[test]
    fn last_ready_triggers_start_exactly_once() {
        let mut rooms = Rooms::new();
        let id = rooms.create_room();
        rooms.join(&id, 1).unwrap();
        rooms.join(&id, 2).unwrap();

        // B ready first: no start yet.
        assert!(!rooms.set_ready(&id, 2).unwrap());
        // A ready: this is the triggering call.
        assert!(rooms.set_ready(&id, 1).unwrap());
        // Any further ready is a no-op.
        assert!(!rooms.set_ready(&id, 1).unwrap());
        assert!(!rooms.set_ready(&id, 2).unwrap());
    }

    #[test]
    fn ready_with_one_player_never_starts() {
        let mut rooms = Rooms::new();
        let id = rooms.create_room();
        rooms.join(&id, 1).unwrap();
        assert!(!rooms.set_ready(&id, 1).unwrap());
    }

    #[test]
    fn match_handle_installs_at_most_once() {
        let mut rooms = Rooms::new();
        let id = rooms.create_room();
        rooms.join(&id, 1).unwrap();
        rooms.join(&id, 2).unwrap();

        // Install before any start was triggered is refused.
        assert!(!rooms.install_match(&id, Box::new(StubHandle)));

        rooms.set_ready(&id, 1).unwrap();
        assert!(rooms.set_ready(&id, 2).unwrap());

        assert!(rooms.install_match(&id, Box::new(StubHandle)));
        assert!(!rooms.install_match(&id, Box::new(StubHandle)));
        assert!(rooms.get(&id).unwrap().has_match());
    }

    #[test]
    fn aborted_start_allows_a_retry() {
        let mut rooms = Rooms::new();
        let id = rooms.create_room();
        rooms.join(&id, 1).unwrap();
        rooms.join(&id, 2).unwrap();
        rooms.submit_deck(&id, 1, deck()).unwrap();

        rooms.set_ready(&id, 1).unwrap();
        assert!(rooms.set_ready(&id, 2).unwrap());

        // Hydration failed: ready flags reset, decks kept, no handle.
        rooms.abort_start(&id);
        let view = rooms.get(&id).unwrap().view();
        assert!(view.players.iter().all(|p| !p.ready));
        assert!(view.players[0].has_deck);

        rooms.set_ready(&id, 1).unwrap();
        assert!(rooms.set_ready(&id, 2).unwrap());
    }

    #[test]
    fn disconnect_teardown_destroys_emptied_rooms() {
        let mut rooms = Rooms::new();
        let solo = rooms.create_room();
        let shared = rooms.create_room();
        rooms.join(&solo, 1).unwrap();
        rooms.join(&shared, 1).unwrap();
        rooms.join(&shared, 2).unwrap();

        let changed = rooms.remove_connection(1);
        assert_eq!(changed, vec![shared.clone()]);
        assert!(rooms.get(&solo).is_none());
        assert_eq!(rooms.get(&shared).unwrap().players().len(), 1);
    }

    #[test]
    fn playing_views_embed_match_state() {
        let mut rooms = Rooms::new();
        let id = rooms.create_room();
        rooms.join(&id, 1).unwrap();
        rooms.join(&id, 2).unwrap();
        rooms.set_ready(&id, 1).unwrap();
        rooms.set_ready(&id, 2).unwrap();
        rooms.install_match(&id, Box::new(StubHandle));

        assert_eq!(rooms.playing_views().len(), 1);
        let view = &rooms.playing_views()[0];
        assert_eq!(view["id"], Value::String(id.clone()));
        assert_eq!(view["match"]["stub"], Value::Bool(true));

        // The plain listing contains it too, without match state.
        assert_eq!(rooms.views().len(), 1);

        assert!(rooms.playing_room_of(1).is_some());
        assert!(rooms.playing_room_of(9).is_none());
    }
}
