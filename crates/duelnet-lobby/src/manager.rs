//! Lobby manager — the single-writer task owning the room registry.
//!
//! Every handler (REST, WebSocket) talks to it through one command
//! channel; each command runs to completion before the next, so no
//! locks guard room state and racing ready signals cannot double-start
//! a match. Card hydration is the one await in a start — it runs on a
//! side task and re-enters the loop as a command, after which the room
//! state is re-validated.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use duelnet_core::message::{ClientEvent, RawEvent, ServerEvent};
use duelnet_core::types::{Card, CardId, ConnectionId, RoomId, RoomView};

use crate::bridge::TransportBridge;
use crate::cards::{hydrate_deck, CardSource};
use crate::engine::{MatchEngine, MatchPlayer};
use crate::rooms::Rooms;

/// Commands processed by the manager task.
pub enum LobbyCommand {
    /// A client connected; allocates a connection id and the outbound
    /// event stream.
    Register {
        reply: oneshot::Sender<(ConnectionId, mpsc::UnboundedReceiver<ServerEvent>)>,
    },
    /// A client connection closed.
    Disconnect { connection_id: ConnectionId },
    CreateRoom { reply: oneshot::Sender<RoomId> },
    ListRooms { reply: oneshot::Sender<Vec<RoomView>> },
    ListPlaying { reply: oneshot::Sender<Vec<Value>> },
    /// An inbound `{event, data}` frame from a client.
    ClientFrame {
        connection_id: ConnectionId,
        frame: RawEvent,
    },
    /// Card hydration for a triggered start finished.
    StartResolved {
        room_id: RoomId,
        cards: Result<HashMap<CardId, Card>, String>,
    },
}

/// Cheap handle to the manager task.
#[derive(Clone)]
pub struct LobbyHandle {
    commands: mpsc::UnboundedSender<LobbyCommand>,
}

impl LobbyHandle {
    pub async fn register(&self) -> Option<(ConnectionId, mpsc::UnboundedReceiver<ServerEvent>)> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(LobbyCommand::Register { reply: tx }).ok()?;
        rx.await.ok()
    }

    pub fn disconnect(&self, connection_id: ConnectionId) {
        let _ = self.commands.send(LobbyCommand::Disconnect { connection_id });
    }

    pub async fn create_room(&self) -> Option<RoomId> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(LobbyCommand::CreateRoom { reply: tx }).ok()?;
        rx.await.ok()
    }

    pub async fn list_rooms(&self) -> Vec<RoomView> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(LobbyCommand::ListRooms { reply: tx }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn list_playing(&self) -> Vec<Value> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(LobbyCommand::ListPlaying { reply: tx }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn client_frame(&self, connection_id: ConnectionId, frame: RawEvent) {
        let _ = self
            .commands
            .send(LobbyCommand::ClientFrame { connection_id, frame });
    }
}

struct Connection {
    sender: mpsc::UnboundedSender<ServerEvent>,
    /// Set once this connection's room has a running match.
    bridge: Option<TransportBridge>,
}

/// The manager task.
pub struct LobbyManager {
    rooms: Rooms,
    connections: HashMap<ConnectionId, Connection>,
    next_connection_id: ConnectionId,
    cards: Arc<dyn CardSource>,
    engine: Arc<dyn MatchEngine>,
    commands_rx: mpsc::UnboundedReceiver<LobbyCommand>,
    /// Loopback sender for start-resolution completions.
    commands_tx: mpsc::UnboundedSender<LobbyCommand>,
}

impl LobbyManager {
    pub fn new(cards: Arc<dyn CardSource>, engine: Arc<dyn MatchEngine>) -> (Self, LobbyHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = LobbyHandle {
            commands: commands_tx.clone(),
        };
        (
            Self {
                rooms: Rooms::new(),
                connections: HashMap::new(),
                next_connection_id: 1,
                cards,
                engine,
                commands_rx,
                commands_tx,
            },
            handle,
        )
    }

    /// Process commands until every handle is gone.
    pub async fn run(mut self) {
        while let Some(command) = self.commands_rx.recv().await {
            self.handle_command(command);
        }
        debug!("Lobby manager stopped");
    }

    fn handle_command(&mut self, command: LobbyCommand) {
        match command {
            LobbyCommand::Register { reply } => {
                let connection_id = self.next_connection_id;
                self.next_connection_id += 1;
                let (tx, rx) = mpsc::unbounded_channel();
                self.connections.insert(
                    connection_id,
                    Connection {
                        sender: tx,
                        bridge: None,
                    },
                );
                debug!(connection = connection_id, "Client registered");
                let _ = reply.send((connection_id, rx));
            }

            LobbyCommand::Disconnect { connection_id } => {
                self.teardown_connection(connection_id);
            }

            LobbyCommand::CreateRoom { reply } => {
                let room_id = self.rooms.create_room();
                self.broadcast_room_list();
                let _ = reply.send(room_id);
            }

            LobbyCommand::ListRooms { reply } => {
                let _ = reply.send(self.rooms.views());
            }

            LobbyCommand::ListPlaying { reply } => {
                let _ = reply.send(self.rooms.playing_views());
            }

            LobbyCommand::ClientFrame {
                connection_id,
                frame,
            } => {
                self.handle_frame(connection_id, frame);
            }

            LobbyCommand::StartResolved { room_id, cards } => {
                self.finish_start(room_id, cards);
            }
        }
    }

    fn handle_frame(&mut self, connection_id: ConnectionId, frame: RawEvent) {
        match ClientEvent::from_frame(&frame) {
            Some(ClientEvent::JoinLobby(room_id)) => {
                match self.rooms.join(&room_id, connection_id) {
                    Ok(()) => {
                        self.broadcast_room_update(&room_id);
                        self.broadcast_room_list();
                    }
                    Err(e) => self.send_error(connection_id, &e.to_string()),
                }
            }

            Some(ClientEvent::SendDeck { room_id, deck }) => {
                match self.rooms.submit_deck(&room_id, connection_id, deck) {
                    Ok(()) => self.broadcast_room_update(&room_id),
                    Err(e) => self.send_error(connection_id, &e.to_string()),
                }
            }

            Some(ClientEvent::PlayerReady(room_id)) => {
                match self.rooms.set_ready(&room_id, connection_id) {
                    Ok(start) => {
                        self.broadcast_room_update(&room_id);
                        if start {
                            self.begin_start(room_id);
                        }
                    }
                    Err(e) => self.send_error(connection_id, &e.to_string()),
                }
            }

            // Not a lobby event: opaque match traffic, forwarded
            // verbatim to the player's bridge consumers once a match
            // is running.
            None => {
                let bridge = self
                    .rooms
                    .playing_room_of(connection_id)
                    .and_then(|_| self.connections.get(&connection_id))
                    .and_then(|c| c.bridge.clone());
                match bridge {
                    Some(bridge) => bridge.dispatch_inbound(&frame.event, &frame.data),
                    None => {
                        debug!(
                            connection = connection_id,
                            event = %frame.event,
                            "Dropping event from connection without a running match"
                        );
                    }
                }
            }
        }
    }

    /// A start was triggered: kick card hydration off-loop. The room is
    /// latched as starting, so interleaved ready signals are no-ops
    /// while this is in flight.
    fn begin_start(&mut self, room_id: RoomId) {
        let Some(inputs) = self.rooms.start_inputs(&room_id) else {
            return;
        };
        let ids: Vec<CardId> = inputs
            .iter()
            .flat_map(|(_, deck)| deck.card_ids())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        info!(room = %room_id, cards = ids.len(), "Both players ready, resolving decks");

        let cards = Arc::clone(&self.cards);
        let loopback = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = cards.resolve(&ids).await.map_err(|e| e.to_string());
            let _ = loopback.send(LobbyCommand::StartResolved {
                room_id,
                cards: result,
            });
        });
    }

    /// Hydration came back. Re-validate the room — players may have
    /// left while we were suspended — then wire bridges, start the
    /// engine, and commit the match handle.
    fn finish_start(&mut self, room_id: RoomId, cards: Result<HashMap<CardId, Card>, String>) {
        let Some(inputs) = self.rooms.start_inputs(&room_id) else {
            debug!(room = %room_id, "Room vanished during card resolution");
            return;
        };
        if inputs.len() != 2 {
            warn!(room = %room_id, "Player left during card resolution, aborting start");
            self.rooms.abort_start(&room_id);
            self.broadcast_room_update(&room_id);
            return;
        }

        let records = match cards {
            Ok(records) => records,
            Err(e) => {
                warn!(room = %room_id, error = %e, "Card resolution failed, aborting start");
                self.fail_start(&room_id, &inputs, "card resolution failed");
                return;
            }
        };

        let mut players = Vec::new();
        let mut bridges = Vec::new();
        for (connection_id, deck) in &inputs {
            let Some(connection) = self.connections.get(connection_id) else {
                warn!(room = %room_id, connection = connection_id, "Connection gone, aborting start");
                self.fail_start(&room_id, &inputs, "player connection lost");
                return;
            };
            let deck = match hydrate_deck(deck, &records) {
                Ok(deck) => deck,
                Err(e) => {
                    warn!(room = %room_id, error = %e, "Deck hydration failed, aborting start");
                    self.fail_start(&room_id, &inputs, "card resolution failed");
                    return;
                }
            };
            players.push(MatchPlayer {
                connection_id: *connection_id,
                deck,
            });
            bridges.push(TransportBridge::new(
                *connection_id,
                connection.sender.clone(),
            ));
        }

        let handle = match self.engine.start(players, bridges.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(room = %room_id, error = %e, "Match engine failed to start");
                self.fail_start(&room_id, &inputs, "match engine failed to start");
                return;
            }
        };

        // Commit: from here the room is bound to this match.
        if !self.rooms.install_match(&room_id, handle) {
            warn!(room = %room_id, "Start was aborted underneath us, dropping engine handle");
            for bridge in &bridges {
                bridge.disconnect();
            }
            return;
        }
        for bridge in bridges {
            if let Some(connection) = self.connections.get_mut(&bridge.connection_id()) {
                connection.bridge = Some(bridge);
            }
        }

        info!(room = %room_id, "Game started");
        for (connection_id, _) in &inputs {
            self.send_to(
                *connection_id,
                ServerEvent::GameStarted {
                    lobby_id: room_id.clone(),
                },
            );
        }
        self.broadcast_room_list();
    }

    /// Failed start: no half-started room. Ready flags reset, players
    /// notified, decks kept for a caller-driven retry.
    fn fail_start(&mut self, room_id: &str, inputs: &[(ConnectionId, duelnet_core::types::Deck)], reason: &str) {
        self.rooms.abort_start(room_id);
        for (connection_id, _) in inputs {
            self.send_error(*connection_id, reason);
        }
        self.broadcast_room_update(room_id);
    }

    fn teardown_connection(&mut self, connection_id: ConnectionId) {
        let Some(connection) = self.connections.remove(&connection_id) else {
            return;
        };
        debug!(connection = connection_id, "Client disconnected");
        if let Some(bridge) = connection.bridge {
            bridge.disconnect();
        }
        for room_id in self.rooms.remove_connection(connection_id) {
            self.broadcast_room_update(&room_id);
        }
        self.broadcast_room_list();
    }

    fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) {
        if let Some(connection) = self.connections.get(&connection_id) {
            let _ = connection.sender.send(event);
        }
    }

    fn send_error(&self, connection_id: ConnectionId, message: &str) {
        self.send_to(connection_id, ServerEvent::Error(message.to_string()));
    }

    /// Latest room state to its members. Clients that miss one update
    /// self-heal on the next broadcast.
    fn broadcast_room_update(&self, room_id: &str) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        let view = room.view();
        for slot in room.players() {
            self.send_to(slot.connection_id, ServerEvent::LobbyUpdate(view.clone()));
        }
    }

    /// Room list to every connected client.
    fn broadcast_room_list(&self) {
        let views = self.rooms.views();
        for connection in self.connections.values() {
            let _ = connection
                .sender
                .send(ServerEvent::LobbyListUpdate(views.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubCards {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CardSource for StubCards {
        async fn resolve(&self, ids: &[CardId]) -> anyhow::Result<HashMap<CardId, Card>> {
            if self.fail {
                anyhow::bail!("card service down");
            }
            Ok(ids
                .iter()
                .map(|id| (*id, serde_json::json!({"id": id, "name": format!("card-{id}")})))
                .collect())
        }
    }

    struct CountingEngine {
        starts: Arc<Mutex<usize>>,
    }

    struct CountingHandle;

    impl crate::engine::MatchHandle for CountingHandle {
        fn state(&self) -> Value {
            serde_json::json!({"running": true})
        }
    }

    impl MatchEngine for CountingEngine {
        fn start(
            &self,
            _players: Vec<MatchPlayer>,
            _bridges: Vec<TransportBridge>,
        ) -> anyhow::Result<Box<dyn crate::engine::MatchHandle>> {
            *self.starts.lock().unwrap() += 1;
            Ok(Box::new(CountingHandle))
        }
    }

    fn frame(event: &str, data: Value) -> RawEvent {
        RawEvent::new(event, data)
    }

    async fn recv_event(
        rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
        want: &str,
    ) -> RawEvent {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            let frame = event.into_frame();
            if frame.event == want {
                return frame;
            }
        }
    }

    /// Full readiness flow driven through the command channel: both
    /// ready signals in the same tick still start exactly one match.
    #[tokio::test]
    async fn interleaved_ready_signals_start_one_match() {
        let starts = Arc::new(Mutex::new(0));
        let (manager, handle) = LobbyManager::new(
            Arc::new(StubCards { fail: false }),
            Arc::new(CountingEngine {
                starts: Arc::clone(&starts),
            }),
        );
        tokio::spawn(manager.run());

        let (conn_a, mut rx_a) = handle.register().await.unwrap();
        let (conn_b, mut rx_b) = handle.register().await.unwrap();
        let room = handle.create_room().await.unwrap();

        handle.client_frame(conn_a, frame("joinLobby", Value::String(room.clone())));
        handle.client_frame(conn_b, frame("joinLobby", Value::String(room.clone())));
        handle.client_frame(
            conn_a,
            frame(
                "sendDeck",
                serde_json::json!({"roomId": room, "deck": {"main": [1, 2]}}),
            ),
        );
        // Ready storm: repeated signals from both players in one tick.
        handle.client_frame(conn_a, frame("player-ready", Value::String(room.clone())));
        handle.client_frame(conn_b, frame("player-ready", Value::String(room.clone())));
        handle.client_frame(conn_a, frame("player-ready", Value::String(room.clone())));
        handle.client_frame(conn_b, frame("player-ready", Value::String(room.clone())));

        let started_a = recv_event(&mut rx_a, "gameStarted").await;
        let started_b = recv_event(&mut rx_b, "gameStarted").await;
        assert_eq!(started_a.data["lobbyId"], Value::String(room.clone()));
        assert_eq!(started_b.data["lobbyId"], Value::String(room.clone()));

        assert_eq!(*starts.lock().unwrap(), 1);
        assert_eq!(handle.list_playing().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_hydration_resets_readiness_and_notifies() {
        let starts = Arc::new(Mutex::new(0));
        let (manager, handle) = LobbyManager::new(
            Arc::new(StubCards { fail: true }),
            Arc::new(CountingEngine {
                starts: Arc::clone(&starts),
            }),
        );
        tokio::spawn(manager.run());

        let (conn_a, mut rx_a) = handle.register().await.unwrap();
        let (conn_b, _rx_b) = handle.register().await.unwrap();
        let room = handle.create_room().await.unwrap();

        handle.client_frame(conn_a, frame("joinLobby", Value::String(room.clone())));
        handle.client_frame(conn_b, frame("joinLobby", Value::String(room.clone())));
        handle.client_frame(
            conn_a,
            frame(
                "sendDeck",
                serde_json::json!({"roomId": room, "deck": {"main": [7]}}),
            ),
        );
        handle.client_frame(conn_a, frame("player-ready", Value::String(room.clone())));
        handle.client_frame(conn_b, frame("player-ready", Value::String(room.clone())));

        recv_event(&mut rx_a, "error").await;
        assert_eq!(*starts.lock().unwrap(), 0);
        assert!(handle.list_playing().await.is_empty());

        // The room is not stuck: decks survive and readiness was reset
        // so the players can retry.
        let rooms = handle.list_rooms().await;
        assert_eq!(rooms.len(), 1);
        assert!(rooms[0].players.iter().all(|p| !p.ready));
        assert!(rooms[0].players.iter().any(|p| p.has_deck));
    }

    #[tokio::test]
    async fn joining_a_full_room_reports_error_to_joiner_only() {
        let (manager, handle) = LobbyManager::new(
            Arc::new(StubCards { fail: false }),
            Arc::new(CountingEngine {
                starts: Arc::new(Mutex::new(0)),
            }),
        );
        tokio::spawn(manager.run());

        let (conn_a, _rx_a) = handle.register().await.unwrap();
        let (conn_b, _rx_b) = handle.register().await.unwrap();
        let (conn_c, mut rx_c) = handle.register().await.unwrap();
        let room = handle.create_room().await.unwrap();

        handle.client_frame(conn_a, frame("joinLobby", Value::String(room.clone())));
        handle.client_frame(conn_b, frame("joinLobby", Value::String(room.clone())));
        handle.client_frame(conn_c, frame("joinLobby", Value::String(room.clone())));

        let error = recv_event(&mut rx_c, "error").await;
        assert!(error.data.as_str().unwrap().contains("full"));

        let rooms = handle.list_rooms().await;
        assert_eq!(rooms[0].players.len(), 2);
    }

    #[tokio::test]
    async fn disconnect_of_last_player_destroys_the_room() {
        let (manager, handle) = LobbyManager::new(
            Arc::new(StubCards { fail: false }),
            Arc::new(CountingEngine {
                starts: Arc::new(Mutex::new(0)),
            }),
        );
        tokio::spawn(manager.run());

        let (conn_a, _rx_a) = handle.register().await.unwrap();
        let room = handle.create_room().await.unwrap();
        handle.client_frame(conn_a, frame("joinLobby", Value::String(room.clone())));
        handle.disconnect(conn_a);

        // Drain until the list shows no rooms.
        for _ in 0..50 {
            if handle.list_rooms().await.is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("room was not destroyed");
    }
}
