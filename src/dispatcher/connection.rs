//! Connection state owned by the dispatcher (C3's registration target).

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::protocol::Envelope;

/// A registered WebSocket connection: authenticated principal, liveness
/// flag, and the set of session ids it owns.
pub struct ConnectionState {
    /// Opaque connection id.
    pub id: String,
    /// Authenticated principal (JWT `sub`).
    pub principal: String,
    /// Session ids created by/owned by this connection.
    pub session_ids: Mutex<HashSet<String>>,
    /// Cleared to `false` every liveness tick; set `true` by any inbound
    /// traffic or pong. Owned here so C6 and C3 share one flag.
    pub liveness: Arc<AtomicBool>,
    /// Channel the server's socket-writer task drains to push envelopes to
    /// the browser client.
    pub outbound_tx: mpsc::UnboundedSender<Envelope>,
}

impl ConnectionState {
    /// Send an envelope to this connection's client. Errors (closed socket)
    /// are swallowed: the close-handling path will clean up the connection
    /// shortly after via the reader task observing the socket close.
    pub fn send(&self, envelope: Envelope) {
        let _ = self.outbound_tx.send(envelope);
    }
}
