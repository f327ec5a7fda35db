//! Overlay networking layer — libp2p transport, discovery rendezvous,
//! relay/bootstrap node, and the peer connectivity handle.
//!
//! The overlay library (libp2p) is an external collaborator: everything
//! above this crate depends only on the narrow command/event interface in
//! [`transport`] and the [`node::PeerNode`] handle.

pub mod discovery;
pub mod node;
pub mod peer;
pub mod relay;
pub mod swarm;
pub mod transport;

pub use node::PeerNode;
pub use relay::{RelayConfig, RelayNode};
pub use transport::{NetworkConfig, NetworkEvent};
