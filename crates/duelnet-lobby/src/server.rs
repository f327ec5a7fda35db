//! HTTP/WS surface of the lobby.
//!
//! REST for room listing/creation, one WebSocket per client for the
//! realtime lobby events and, after match start, the opaque
//! match-engine traffic.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use duelnet_core::message::RawEvent;
use duelnet_core::types::RoomView;

use crate::manager::LobbyHandle;

/// Build the lobby router. Browser clients connect cross-origin, so
/// CORS is permissive.
pub fn router(handle: LobbyHandle) -> Router {
    Router::new()
        .route("/lobbies", get(list_lobbies).post(create_lobby))
        .route("/lobbies/playing", get(list_playing))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(handle)
}

/// Serve the lobby on an already-bound listener.
pub async fn serve(
    listener: tokio::net::TcpListener,
    handle: LobbyHandle,
) -> anyhow::Result<()> {
    info!(addr = ?listener.local_addr(), "Lobby server listening");
    axum::serve(listener, router(handle)).await?;
    Ok(())
}

async fn list_lobbies(State(handle): State<LobbyHandle>) -> Json<Vec<RoomView>> {
    Json(handle.list_rooms().await)
}

async fn list_playing(State(handle): State<LobbyHandle>) -> Json<Vec<Value>> {
    Json(handle.list_playing().await)
}

async fn create_lobby(State(handle): State<LobbyHandle>) -> Json<Value> {
    let id = handle.create_room().await;
    Json(serde_json::json!({ "id": id }))
}

async fn ws_upgrade(
    State(handle): State<LobbyHandle>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| client_session(socket, handle))
}

/// One task per client: pump inbound frames into the manager and
/// outbound events back onto the socket, then tear down.
async fn client_session(socket: WebSocket, handle: LobbyHandle) {
    let Some((connection_id, mut outbound)) = handle.register().await else {
        return;
    };
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RawEvent>(&text) {
                        Ok(frame) => handle.client_frame(connection_id, frame),
                        Err(e) => {
                            debug!(connection = connection_id, error = %e, "Unparseable frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(connection = connection_id, error = %e, "WebSocket error");
                    break;
                }
            },

            event = outbound.recv() => match event {
                Some(event) => {
                    let frame = event.into_frame();
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode server event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    handle.disconnect(connection_id);
}
