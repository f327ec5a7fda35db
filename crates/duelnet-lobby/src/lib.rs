//! Lobby/session layer — rooms, readiness tracking, match launch, and
//! the HTTP/WS surface browser clients talk to.
//!
//! All room state is owned by a single manager task ([`manager`]);
//! everything else reaches it through one command channel, so racing
//! ready signals cannot double-start a match.

pub mod bridge;
pub mod cards;
pub mod engine;
pub mod manager;
pub mod rooms;
pub mod server;

pub use bridge::TransportBridge;
pub use cards::{CardSource, HttpCardSource};
pub use engine::{MatchEngine, MatchHandle, MatchPlayer, PassthroughEngine};
pub use manager::{LobbyHandle, LobbyManager};
