//! Transport bridge — adapts one player's live lobby connection into
//! the narrow send/receive/disconnect contract the match engine
//! expects.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use duelnet_core::message::{RawEvent, ServerEvent};
use duelnet_core::types::ConnectionId;
use tokio::sync::mpsc;

type MessageCallback = Box<dyn FnMut(&str, &Value) + Send>;
type DisconnectCallback = Box<dyn FnOnce() + Send>;

struct Inner {
    outbound: mpsc::UnboundedSender<ServerEvent>,
    on_message: Vec<MessageCallback>,
    on_disconnect: Vec<DisconnectCallback>,
    closed: bool,
}

/// One duplex channel wrapped for the match engine. Clones share the
/// same underlying bridge.
///
/// Callback registration is independent of connection state; the
/// disconnect callbacks fire exactly once, on the first closure.
#[derive(Clone)]
pub struct TransportBridge {
    connection_id: ConnectionId,
    inner: Arc<Mutex<Inner>>,
}

impl TransportBridge {
    pub fn new(connection_id: ConnectionId, outbound: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            connection_id,
            inner: Arc::new(Mutex::new(Inner {
                outbound,
                on_message: Vec::new(),
                on_disconnect: Vec::new(),
                closed: false,
            })),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Push an event to the player. Outbound sends are logged for
    /// diagnostics only; a send after disconnect is a no-op.
    pub fn send(&self, event: &str, payload: Value) {
        let inner = self.inner.lock().expect("bridge lock");
        if inner.closed {
            return;
        }
        debug!(connection = self.connection_id, event, "Outbound match event");
        let _ = inner
            .outbound
            .send(ServerEvent::Raw(RawEvent::new(event, payload)));
    }

    /// Register a callback for every inbound event except internal
    /// connect/disconnect signaling.
    pub fn on_message<F>(&self, callback: F)
    where
        F: FnMut(&str, &Value) + Send + 'static,
    {
        self.inner
            .lock()
            .expect("bridge lock")
            .on_message
            .push(Box::new(callback));
    }

    /// Register a callback fired exactly once, on first closure.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .lock()
            .expect("bridge lock")
            .on_disconnect
            .push(Box::new(callback));
    }

    /// Fan an inbound event out to registered message callbacks.
    pub fn dispatch_inbound(&self, event: &str, data: &Value) {
        let mut inner = self.inner.lock().expect("bridge lock");
        if inner.closed {
            return;
        }
        for callback in inner.on_message.iter_mut() {
            callback(event, data);
        }
    }

    /// Idempotent teardown: unregisters listeners, closes the channel,
    /// and fires the disconnect callbacks once. A no-op thereafter.
    pub fn disconnect(&self) {
        let callbacks = {
            let mut inner = self.inner.lock().expect("bridge lock");
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.on_message.clear();
            std::mem::take(&mut inner.on_disconnect)
        };
        debug!(connection = self.connection_id, "Bridge disconnected");
        // Fired outside the lock so a callback may touch the bridge.
        for callback in callbacks {
            callback();
        }
    }
}
