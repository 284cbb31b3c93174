//! Session state owned by the dispatcher (C6), paired 1:1 with a subprocess.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::rpc::Correlator;
use crate::subprocess::SubprocessHandle;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Handshake (initialize/session-new) is still in flight.
    Initializing,
    /// Ready to accept prompts.
    Active,
    /// Process killed and tables cleaned up; no further envelopes are sent.
    Closed,
}

/// A prompt awaiting completion, used to stamp streaming updates and the
/// final completion event with the client's originating request id.
#[derive(Debug, Clone)]
pub struct PendingPrompt {
    /// The client envelope id of the triggering `acp:prompt:send:request`.
    pub request_id: String,
    /// Connection that sent the prompt; completion/updates route back here.
    pub connection_id: String,
}

/// A live session: one browser-visible handle to one agent subprocess.
///
/// `id` is held behind a lock rather than as a plain field because
/// [`crate::dispatcher::Dispatcher::create_session`]'s migration step
/// mutates it exactly once, atomically with re-keying the dispatcher's
/// session table; every notification-handling closure reads it at
/// delivery time rather than capturing a value.
pub struct SessionState {
    /// Current session id; mutated exactly once, at migration.
    pub id: Mutex<String>,
    /// Owning connection id; immutable for the life of the session.
    pub connection_id: String,
    /// Authenticated principal that created this session.
    pub principal: String,
    /// Working directory hint passed to the agent at creation.
    pub cwd: Option<String>,
    /// Model hint passed to the agent at creation.
    pub model: Option<String>,
    /// Current lifecycle status.
    pub status: Mutex<SessionStatus>,
    /// Auth methods the agent reported at `initialize`, if any. Informational
    /// only: presence does not by itself mean authentication is required.
    pub auth_methods: Mutex<Option<serde_json::Value>>,
    /// The one pending prompt this session is currently servicing, if any.
    pub pending_prompt: Mutex<Option<PendingPrompt>>,
    /// Outstanding `session/request_permission` calls, keyed by the
    /// client-visible `requestId` minted when the request is forwarded.
    /// Maps back to the JSON-RPC id the agent must see echoed in the
    /// eventual response.
    pub pending_permissions: Mutex<HashMap<String, serde_json::Value>>,
    /// Live subprocess handle.
    pub subprocess: SubprocessHandle,
    /// JSON-RPC correlator for this subprocess.
    pub correlator: Correlator,
}

impl SessionState {
    /// Current session id.
    pub async fn current_id(&self) -> String {
        self.id.lock().await.clone()
    }

    /// Current lifecycle status.
    pub async fn current_status(&self) -> SessionStatus {
        *self.status.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn dummy_session() -> SessionState {
        let (tx, _rx) = mpsc::unbounded_channel::<String>();
        SessionState {
            id: Mutex::new("tentative".to_string()),
            connection_id: "conn-1".to_string(),
            principal: "alice".to_string(),
            cwd: None,
            model: None,
            status: Mutex::new(SessionStatus::Initializing),
            auth_methods: Mutex::new(None),
            pending_prompt: Mutex::new(None),
            pending_permissions: Mutex::new(HashMap::new()),
            subprocess: crate::subprocess::manager::test_support::noop_handle(),
            correlator: Correlator::new(tx),
        }
    }

    #[tokio::test]
    async fn test_current_id_reflects_mutation() {
        let session = dummy_session();
        assert_eq!(session.current_id().await, "tentative");
        *session.id.lock().await = "final".to_string();
        assert_eq!(session.current_id().await, "final");
    }

    #[tokio::test]
    async fn test_status_defaults_initializing() {
        let session = dummy_session();
        assert_eq!(session.current_status().await, SessionStatus::Initializing);
    }
}
