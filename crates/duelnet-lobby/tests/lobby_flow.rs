//! End-to-end lobby flow over real HTTP and WebSocket: create a room,
//! two clients join, submit decks, signal ready, and the match starts
//! with card hydration and verbatim post-start forwarding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use duelnet_core::message::RawEvent;
use duelnet_core::types::{Card, CardId};
use duelnet_lobby::{CardSource, LobbyManager, PassthroughEngine};

const WAIT: Duration = Duration::from_secs(10);

/// Card source stub: resolves every id and counts invocations.
struct StubCards {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl CardSource for StubCards {
    async fn resolve(&self, ids: &[CardId]) -> anyhow::Result<HashMap<CardId, Card>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ids
            .iter()
            .map(|id| (*id, serde_json::json!({"id": id, "name": format!("card-{id}")})))
            .collect())
    }
}

struct Lobby {
    base_url: String,
    ws_url: String,
    resolve_calls: Arc<AtomicUsize>,
}

async fn start_lobby() -> Lobby {
    let calls = Arc::new(AtomicUsize::new(0));
    let (manager, handle) = LobbyManager::new(
        Arc::new(StubCards {
            calls: Arc::clone(&calls),
        }),
        Arc::new(PassthroughEngine),
    );
    tokio::spawn(manager.run());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        duelnet_lobby::server::serve(listener, handle)
            .await
            .expect("serve");
    });

    Lobby {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws"),
        resolve_calls: calls,
    }
}

struct Client {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    async fn connect(lobby: &Lobby) -> Self {
        let (socket, _) = tokio_tungstenite::connect_async(lobby.ws_url.as_str())
            .await
            .expect("ws connect");
        Self { socket }
    }

    async fn send(&mut self, event: &str, data: Value) {
        let text = serde_json::to_string(&RawEvent::new(event, data)).expect("encode");
        self.socket
            .send(Message::Text(text.into()))
            .await
            .expect("ws send");
    }

    /// Read frames until one matches the event name and predicate.
    async fn recv_until<F>(&mut self, event: &str, mut predicate: F) -> RawEvent
    where
        F: FnMut(&RawEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let message = self
                    .socket
                    .next()
                    .await
                    .expect("socket closed")
                    .expect("ws error");
                let Message::Text(text) = message else {
                    continue;
                };
                let frame: RawEvent = serde_json::from_str(&text).expect("frame");
                if frame.event == event && predicate(&frame) {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {event}"))
    }
}

#[tokio::test]
async fn full_matchmaking_flow() {
    let lobby = start_lobby().await;
    let http = reqwest::Client::new();

    // Create a room over REST.
    let created: Value = http
        .post(format!("{}/lobbies", lobby.base_url))
        .send()
        .await
        .expect("post")
        .json()
        .await
        .expect("json");
    let room_id = created["id"].as_str().expect("room id").to_string();

    let listed: Value = http
        .get(format!("{}/lobbies", lobby.base_url))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(listed[0]["id"], Value::String(room_id.clone()));
    assert_eq!(listed[0]["full"], Value::Bool(false));

    // Two clients join; both end up listed, no decks, not ready.
    let mut alice = Client::connect(&lobby).await;
    let mut bob = Client::connect(&lobby).await;

    alice.send("joinLobby", Value::String(room_id.clone())).await;
    bob.send("joinLobby", Value::String(room_id.clone())).await;

    let update = alice
        .recv_until("lobbyUpdate", |f| f.data["players"].as_array().is_some_and(|p| p.len() == 2))
        .await;
    for player in update.data["players"].as_array().unwrap() {
        assert_eq!(player["ready"], Value::Bool(false));
        assert_eq!(player["hasDeck"], Value::Bool(false));
    }

    // Decks submitted: hasDeck flips, contents stay hidden.
    alice
        .send(
            "sendDeck",
            serde_json::json!({"roomId": room_id, "deck": {"main": [1, 2, 3]}}),
        )
        .await;
    bob.send(
        "sendDeck",
        serde_json::json!({"roomId": room_id, "deck": {"main": [3, 4]}}),
    )
    .await;

    let update = bob
        .recv_until("lobbyUpdate", |f| {
            f.data["players"]
                .as_array()
                .is_some_and(|p| p.iter().all(|pl| pl["hasDeck"] == Value::Bool(true)))
        })
        .await;
    assert!(update.data["players"][0].get("deck").is_none());

    // Both ready → both told the game started.
    alice.send("player-ready", Value::String(room_id.clone())).await;
    bob.send("player-ready", Value::String(room_id.clone())).await;

    let started = alice.recv_until("gameStarted", |_| true).await;
    assert_eq!(started.data["lobbyId"], Value::String(room_id.clone()));
    let started = bob.recv_until("gameStarted", |_| true).await;
    assert_eq!(started.data["lobbyId"], Value::String(room_id.clone()));

    // Card resolution happened exactly once, for the union of decks.
    assert_eq!(lobby.resolve_calls.load(Ordering::SeqCst), 1);

    // The playing listing embeds an opaque match object.
    let playing: Value = http
        .get(format!("{}/lobbies/playing", lobby.base_url))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(playing[0]["id"], Value::String(room_id.clone()));
    assert!(playing[0]["match"].is_object());

    // Post-start traffic is forwarded verbatim to the opponent.
    alice
        .send("playCard", serde_json::json!({"card": 3, "zone": "field"}))
        .await;
    let forwarded = bob.recv_until("playCard", |_| true).await;
    assert_eq!(forwarded.data["card"], 3);
    assert_eq!(forwarded.data["zone"], "field");

    // A departing player is announced to the opponent.
    drop(alice);
    bob.recv_until("opponentLeft", |_| true).await;
}

#[tokio::test]
async fn third_join_is_rejected_with_an_error() {
    let lobby = start_lobby().await;
    let http = reqwest::Client::new();

    let created: Value = http
        .post(format!("{}/lobbies", lobby.base_url))
        .send()
        .await
        .expect("post")
        .json()
        .await
        .expect("json");
    let room_id = created["id"].as_str().expect("room id").to_string();

    let mut alice = Client::connect(&lobby).await;
    let mut bob = Client::connect(&lobby).await;
    let mut carol = Client::connect(&lobby).await;

    alice.send("joinLobby", Value::String(room_id.clone())).await;
    bob.send("joinLobby", Value::String(room_id.clone())).await;
    // Wait until both are in before the third join.
    alice
        .recv_until("lobbyUpdate", |f| f.data["players"].as_array().is_some_and(|p| p.len() == 2))
        .await;

    carol.send("joinLobby", Value::String(room_id.clone())).await;
    let error = carol.recv_until("error", |_| true).await;
    assert!(error.data.as_str().unwrap().contains("full"));

    // The room is unmutated.
    let listed: Value = http
        .get(format!("{}/lobbies", lobby.base_url))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(listed[0]["players"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn nonexistent_room_reports_an_error() {
    let lobby = start_lobby().await;
    let mut client = Client::connect(&lobby).await;
    client.send("joinLobby", Value::String("missing".into())).await;
    let error = client.recv_until("error", |_| true).await;
    assert!(error.data.as_str().unwrap().contains("missing"));
}
