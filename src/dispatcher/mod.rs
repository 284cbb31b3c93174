//! Protocol dispatcher & session manager (C6).
//!
//! This is the hard core of the gateway: it maps validated client envelopes
//! to subprocess calls, owns the session-id migration step, and translates
//! streaming `session/update` notifications back into client envelopes. See
//! `spec.md` §4.5 for the prose this module implements.

pub mod connection;
pub mod session;
pub mod translate;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::envelope::now_millis;
use crate::protocol::{Envelope, EnvelopeError};
use crate::rpc::correlator::{Inbound, DEFAULT_TIMEOUT};
use crate::rpc::Correlator;
use crate::subprocess::{self, stderr, SubprocessHandle};

pub use connection::ConnectionState;
pub use session::{PendingPrompt, SessionState, SessionStatus};

/// JSON-RPC protocol version the gateway advertises at `initialize`.
const PROTOCOL_VERSION: i64 = 1;

/// Default permission options offered to the client when the agent's
/// `session/request_permission` call omits its own option list.
fn default_permission_options() -> Value {
    json!([
        { "optionId": "allow", "name": "Allow" },
        { "optionId": "reject", "name": "Reject" },
    ])
}

/// Outcome of an ownership/existence check on a session id.
enum LookupError {
    NotFound,
    Unauthorized,
}

impl LookupError {
    fn code(&self) -> &'static str {
        match self {
            LookupError::NotFound => "SESSION_NOT_FOUND",
            LookupError::Unauthorized => "UNAUTHORIZED",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            LookupError::NotFound => "session not found",
            LookupError::Unauthorized => "session is owned by a different connection",
        }
    }
}

/// Owns the global connection and session tables for the gateway's
/// lifetime. One `Dispatcher` per process; no persistence across restarts.
pub struct Dispatcher {
    connections: Mutex<HashMap<String, Arc<ConnectionState>>>,
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
}

impl Dispatcher {
    /// Build an empty dispatcher.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Register a freshly authenticated connection.
    pub async fn register_connection(&self, conn: Arc<ConnectionState>) {
        self.connections.lock().await.insert(conn.id.clone(), conn);
    }

    /// Look up a live connection by id.
    pub async fn connection(&self, conn_id: &str) -> Option<Arc<ConnectionState>> {
        self.connections.lock().await.get(conn_id).cloned()
    }

    /// Tear down a connection: close every session it owns, then remove it
    /// from the connection table. Called from the socket's close handler.
    pub async fn close_connection(self: &Arc<Self>, conn_id: &str) {
        let Some(conn) = self.connections.lock().await.remove(conn_id) else {
            return;
        };
        let owned: Vec<String> = conn.session_ids.lock().await.iter().cloned().collect();
        for session_id in owned {
            self.close_session_internal(&session_id).await;
        }
    }

    /// Build the `connection:established:success` envelope sent right after
    /// a successful WebSocket upgrade.
    pub fn connection_established(conn_id: &str) -> Envelope {
        Envelope::create_message(
            "connection:established:success",
            Some(json!({ "connectionId": conn_id, "protocolVersion": PROTOCOL_VERSION })),
        )
    }

    /// Dispatch one validated client envelope. Schema validation has already
    /// happened by the time this is called; unknown types never reach here.
    pub async fn handle_envelope(self: &Arc<Self>, conn: Arc<ConnectionState>, env: Envelope) {
        let payload = env.payload.clone().unwrap_or(Value::Null);
        match env.kind.as_str() {
            "connection:heartbeat:request" => self.heartbeat(&conn, env),
            "acp:session:create:request" => self.create_session(conn, env.id, payload).await,
            "acp:session:load:request" => self.load_session(&conn, env.id, payload).await,
            "acp:prompt:send:request" => self.prompt_send(conn, env.id, payload).await,
            "acp:prompt:cancel:request" => self.prompt_cancel(&conn, env.id, payload).await,
            "acp:session:close:request" => self.session_close(&conn, env.id, payload).await,
            "acp:permission:response" => self.permission_response(&conn, payload).await,
            "acp:initialize:request" => conn.send(Envelope::respond_to(
                env.id,
                "acp:initialize:success",
                Some(json!({ "protocolVersion": PROTOCOL_VERSION })),
            )),
            other => {
                tracing::debug!(kind = other, "envelope type recognized but not dispatcher-handled");
                conn.send(Envelope::create_error(
                    "system:error",
                    EnvelopeError::new("UNKNOWN_TYPE", format!("no handler registered for {other}")),
                    None,
                ));
            }
        }
    }

    fn heartbeat(&self, conn: &ConnectionState, env: Envelope) {
        let latency = now_millis().saturating_sub(env.timestamp);
        conn.send(Envelope::respond_to(
            env.id,
            "connection:heartbeat:success",
            Some(json!({ "latency": latency })),
        ));
    }

    /// No session persistence is in scope (spec.md §1 non-goals): a session
    /// can only be "loaded" by the connection that already owns it, as an
    /// idempotent confirmation. Any other request is `SESSION_NOT_FOUND`.
    async fn load_session(&self, conn: &ConnectionState, request_id: String, payload: Value) {
        let Some(session_id) = payload.get("sessionId").and_then(|v| v.as_str()) else {
            conn.send(Envelope::respond_error(
                request_id,
                "acp:session:load:error",
                EnvelopeError::new("INVALID_PARAMS", "sessionId is required"),
                None,
            ));
            return;
        };
        match self.lookup_owned(conn, session_id).await {
            Ok(session) => {
                let status = session.current_status().await;
                if status == SessionStatus::Closed {
                    conn.send(Envelope::respond_error(
                        request_id,
                        "acp:session:load:error",
                        EnvelopeError::new("SESSION_NOT_FOUND", "session is closed"),
                        Some(json!({ "sessionId": session_id })),
                    ));
                    return;
                }
                conn.send(Envelope::respond_to(
                    request_id,
                    "acp:session:load:success",
                    Some(json!({ "sessionId": session_id })),
                ));
            }
            Err(e) => conn.send(Envelope::respond_error(
                request_id,
                "acp:session:load:error",
                EnvelopeError::new(e.code(), e.message()),
                Some(json!({ "sessionId": session_id })),
            )),
        }
    }

    /// Session creation (spec.md §4.5): spawn the agent subprocess, run the
    /// `initialize`/`session/new` handshake, and migrate the tentative
    /// session id to whatever the agent assigns.
    pub async fn create_session(self: &Arc<Self>, conn: Arc<ConnectionState>, request_id: String, payload: Value) {
        let cwd = payload.get("cwd").and_then(|v| v.as_str()).map(str::to_string);
        let model = payload.get("model").and_then(|v| v.as_str()).map(str::to_string);
        let tentative_id = Uuid::new_v4().to_string();

        let binary = match subprocess::discover_binary() {
            Ok(path) => path,
            Err(e) => {
                conn.send(Envelope::respond_error(
                    request_id,
                    "acp:session:create:error",
                    EnvelopeError::new("TRANSPORT_ERROR", e.to_string()),
                    None,
                ));
                return;
            }
        };

        let (subprocess_handle, lines) = match SubprocessHandle::spawn(&binary, cwd.as_deref(), model.as_deref()) {
            Ok(pair) => pair,
            Err(e) => {
                conn.send(Envelope::respond_error(
                    request_id,
                    "acp:session:create:error",
                    EnvelopeError::new("TRANSPORT_ERROR", e.to_string()),
                    None,
                ));
                return;
            }
        };

        let correlator = Correlator::new(subprocess_handle.sender());
        let session = Arc::new(SessionState {
            id: Mutex::new(tentative_id.clone()),
            connection_id: conn.id.clone(),
            principal: conn.principal.clone(),
            cwd: cwd.clone(),
            model: model.clone(),
            status: Mutex::new(SessionStatus::Initializing),
            auth_methods: Mutex::new(None),
            pending_prompt: Mutex::new(None),
            pending_permissions: Mutex::new(HashMap::new()),
            subprocess: subprocess_handle,
            correlator: correlator.clone(),
        });

        // Route every agent-originated message to this session/connection
        // pair for the rest of the subprocess's life: no re-registration is
        // needed on migration because the handler reads `session.id` (a
        // `Mutex<String>`) at delivery time rather than capturing it by
        // value (spec.md §9's closure-capture fix, "hold by reference" arm).
        self.wire_ordered_notifications(session.clone(), conn.clone(), &correlator).await;

        // Single-reader stdout pump: feeds every line to the correlator in
        // arrival order. Its natural end (subprocess stdout closed) is how
        // we learn the process exited.
        let exit_dispatcher = self.clone();
        let exit_session = session.clone();
        let exit_conn = conn.clone();
        let mut stdout_rx = lines.stdout_rx;
        let pump_correlator = correlator.clone();
        tokio::spawn(async move {
            while let Some(line) = stdout_rx.recv().await {
                pump_correlator.dispatch(&line).await;
            }
            exit_dispatcher.handle_subprocess_exit(exit_session, exit_conn).await;
        });

        let mut stderr_rx = lines.stderr_rx;
        let stderr_session = session.clone();
        let stderr_conn = conn.clone();
        tokio::spawn(async move {
            while let Some(line) = stderr_rx.recv().await {
                if let Some(category) = stderr::classify(&line) {
                    let sid = stderr_session.current_id().await;
                    stderr_conn.send(Envelope::create_error(
                        "acp:session:error",
                        EnvelopeError::with_details("API_ERROR", category.message(), line.clone()),
                        Some(json!({ "sessionId": sid })),
                    ));
                }
            }
        });

        match self
            .complete_session_creation(session.clone(), tentative_id.clone(), cwd, model)
            .await
        {
            Ok(payload) => {
                let final_id = session.current_id().await;
                conn.session_ids.lock().await.insert(final_id);
                conn.send(Envelope::respond_to(request_id, "acp:session:create:success", Some(payload)));
            }
            Err(e) => {
                let _ = session.subprocess.kill().await;
                *session.status.lock().await = SessionStatus::Closed;
                self.sessions.lock().await.remove(&tentative_id);
                conn.send(Envelope::respond_error(
                    request_id,
                    "acp:session:create:error",
                    EnvelopeError::new(crate::error::error_code_of(&e), e.to_string()),
                    None,
                ));
            }
        }
    }

    /// Runs the `initialize` / `session/new` handshake and, if the agent
    /// assigns a different id, migrates the session atomically across the
    /// dispatcher's session table. Split out from [`Dispatcher::create_session`]
    /// so tests can drive it against a session wired to an in-memory
    /// correlator instead of a real spawned process.
    async fn complete_session_creation(
        self: &Arc<Self>,
        session: Arc<SessionState>,
        tentative_id: String,
        cwd: Option<String>,
        model: Option<String>,
    ) -> Result<Value> {
        self.sessions.lock().await.insert(tentative_id.clone(), session.clone());

        let init_params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": { "name": "bridge-gateway", "version": env!("CARGO_PKG_VERSION") },
            "capabilities": {},
        });
        let init_response = session
            .correlator
            .request("initialize", Some(init_params), DEFAULT_TIMEOUT)
            .await?;
        *session.auth_methods.lock().await = init_response.get("authMethods").cloned();

        let new_params = json!({
            "cwd": cwd,
            "mcpServers": [],
            "model": model,
        });
        let new_response = session
            .correlator
            .request("session/new", Some(new_params), DEFAULT_TIMEOUT)
            .await?;

        let agent_id = new_response
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| tentative_id.clone());

        if agent_id != tentative_id {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&tentative_id);
            *session.id.lock().await = agent_id.clone();
            sessions.insert(agent_id.clone(), session.clone());
        }

        *session.status.lock().await = SessionStatus::Active;

        let available_models = new_response
            .get("availableModels")
            .cloned()
            .unwrap_or_else(|| json!([session.model.clone().unwrap_or_else(|| "default".to_string())]));
        let current_model = new_response
            .get("currentModel")
            .cloned()
            .unwrap_or_else(|| json!(session.model.clone().unwrap_or_else(|| "default".to_string())));

        Ok(json!({
            "sessionId": agent_id,
            "availableModels": available_models,
            "currentModel": current_model,
            "modes": {
                "currentModeId": "build",
                "availableModes": [
                    { "id": "ask", "name": "Ask" },
                    { "id": "build", "name": "Build" },
                ],
            },
        }))
    }

    /// `acp:prompt:send:request`: fire-and-forget `session/prompt`, replied
    /// to immediately with `:accepted`; the real turn result streams back
    /// via `session/update` notifications and a terminal `session/prompt`.
    async fn prompt_send(self: &Arc<Self>, conn: Arc<ConnectionState>, request_id: String, payload: Value) {
        let Some(session_id) = payload.get("sessionId").and_then(|v| v.as_str()).map(str::to_string) else {
            conn.send(Envelope::respond_error(
                request_id,
                "acp:prompt:send:error",
                EnvelopeError::new("INVALID_PARAMS", "sessionId is required"),
                None,
            ));
            return;
        };

        let session = match self.lookup_owned(&conn, &session_id).await {
            Ok(session) => session,
            Err(e) => {
                conn.send(Envelope::respond_error(
                    request_id,
                    "acp:prompt:send:error",
                    EnvelopeError::new(e.code(), e.message()),
                    Some(json!({ "sessionId": session_id })),
                ));
                return;
            }
        };

        if session.current_status().await != SessionStatus::Active {
            conn.send(Envelope::respond_error(
                request_id,
                "acp:prompt:send:error",
                EnvelopeError::new("SESSION_NOT_FOUND", "session is not active"),
                Some(json!({ "sessionId": session_id })),
            ));
            return;
        }

        *session.pending_prompt.lock().await = Some(PendingPrompt {
            request_id: request_id.clone(),
            connection_id: conn.id.clone(),
        });

        let content = payload.get("content").cloned().unwrap_or_else(|| json!([]));
        let mut params = serde_json::Map::new();
        params.insert("sessionId".to_string(), json!(session.current_id().await));
        params.insert("prompt".to_string(), content);
        if let Some(mode) = payload.get("agentMode") {
            params.insert("agentMode".to_string(), mode.clone());
        }

        if let Err(e) = session.correlator.notify("session/prompt", Some(Value::Object(params))) {
            session.pending_prompt.lock().await.take();
            conn.send(Envelope::respond_error(
                request_id,
                "acp:prompt:send:error",
                EnvelopeError::new(crate::error::error_code_of(&e), e.to_string()),
                Some(json!({ "sessionId": session_id })),
            ));
            return;
        }

        conn.send(Envelope::respond_to(
            request_id,
            "acp:prompt:send:success",
            Some(json!({ "requestId": request_id, "status": "accepted" })),
        ));
    }

    /// `acp:prompt:cancel:request`: fire-and-forget `session/cancel`,
    /// acknowledged immediately. The agent is expected to eventually end the
    /// turn with `stopReason: "cancelled"`.
    async fn prompt_cancel(&self, conn: &ConnectionState, request_id: String, payload: Value) {
        let Some(session_id) = payload.get("sessionId").and_then(|v| v.as_str()).map(str::to_string) else {
            conn.send(Envelope::respond_error(
                request_id,
                "acp:prompt:cancel:error",
                EnvelopeError::new("INVALID_PARAMS", "sessionId is required"),
                None,
            ));
            return;
        };

        let session = match self.lookup_owned(conn, &session_id).await {
            Ok(session) => session,
            Err(e) => {
                conn.send(Envelope::respond_error(
                    request_id,
                    "acp:prompt:cancel:error",
                    EnvelopeError::new(e.code(), e.message()),
                    Some(json!({ "sessionId": session_id })),
                ));
                return;
            }
        };

        let current_id = session.current_id().await;
        if let Err(e) = session.correlator.notify("session/cancel", Some(json!({ "sessionId": current_id }))) {
            conn.send(Envelope::respond_error(
                request_id,
                "acp:prompt:cancel:error",
                EnvelopeError::new(crate::error::error_code_of(&e), e.to_string()),
                Some(json!({ "sessionId": session_id })),
            ));
            return;
        }

        conn.send(Envelope::respond_to(
            request_id,
            "acp:prompt:cancel:success",
            Some(json!({ "sessionId": session_id })),
        ));
    }

    /// `acp:session:close:request`: kill the subprocess, reject every
    /// pending correlator entry, and remove the session from every table.
    /// Idempotent: closing an already-closed (or never-existed, from this
    /// connection's point of view) session id is an ignorable success.
    async fn session_close(self: &Arc<Self>, conn: &ConnectionState, request_id: String, payload: Value) {
        let Some(session_id) = payload.get("sessionId").and_then(|v| v.as_str()).map(str::to_string) else {
            conn.send(Envelope::respond_error(
                request_id,
                "acp:session:close:error",
                EnvelopeError::new("INVALID_PARAMS", "sessionId is required"),
                None,
            ));
            return;
        };

        match self.lookup_owned(conn, &session_id).await {
            Ok(_) => self.close_session_internal(&session_id).await,
            Err(LookupError::Unauthorized) => {
                conn.send(Envelope::respond_error(
                    request_id,
                    "acp:session:close:error",
                    EnvelopeError::new("UNAUTHORIZED", "session is owned by a different connection"),
                    Some(json!({ "sessionId": session_id })),
                ));
                return;
            }
            Err(LookupError::NotFound) => {
                // Already closed (or never existed): ignorable no-op success.
            }
        }

        conn.send(Envelope::respond_to(
            request_id,
            "acp:session:close:success",
            Some(json!({ "sessionId": session_id })),
        ));
    }

    /// `acp:permission:response`: forward the client's decision upstream as
    /// the JSON-RPC response to the `session/request_permission` call it
    /// answers. No client-visible error type is defined for this event, so
    /// ownership/lookup failures are logged and dropped rather than echoed.
    async fn permission_response(&self, conn: &ConnectionState, payload: Value) {
        let (Some(session_id), Some(request_id), Some(outcome)) = (
            payload.get("sessionId").and_then(|v| v.as_str()),
            payload.get("requestId").and_then(|v| v.as_str()),
            payload.get("outcome").cloned(),
        ) else {
            tracing::warn!("malformed acp:permission:response payload");
            return;
        };

        let session = match self.lookup_owned(conn, session_id).await {
            Ok(session) => session,
            Err(_) => {
                tracing::warn!(session_id, "permission response for unowned/unknown session dropped");
                return;
            }
        };

        let agent_request_id = session.pending_permissions.lock().await.remove(request_id);
        match agent_request_id {
            Some(id) => {
                if let Err(e) = session.correlator.respond(id, outcome) {
                    tracing::warn!(error = %e, "failed to forward permission response upstream");
                }
            }
            None => tracing::warn!(request_id, "permission response for unknown requestId dropped"),
        }
    }

    /// Register the correlator's notification handler so every inbound
    /// agent message for this session is handled by a single ordered
    /// consumer rather than one detached task per message. The correlator's
    /// stdout pump calls `dispatch` for each line strictly in arrival order,
    /// but its notification handler runs synchronously inside that call;
    /// spawning a fresh task per message there would let two `session/update`
    /// handlers (or an update racing the terminal `session/prompt`) finish
    /// out of order, breaking the ordering guarantee in spec.md §5(a). The
    /// handler here only enqueues onto an unbounded channel (FIFO, no
    /// `.await`), and a single spawned task drains it and awaits
    /// `handle_inbound` to completion before picking up the next message.
    async fn wire_ordered_notifications(
        self: &Arc<Self>,
        session: Arc<SessionState>,
        conn: Arc<ConnectionState>,
        correlator: &Correlator,
    ) {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        correlator
            .on_notification(Arc::new(move |inbound: Inbound| {
                let _ = inbound_tx.send(inbound);
            }))
            .await;

        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                dispatcher.handle_inbound(session.clone(), conn.clone(), inbound).await;
            }
        });
    }

    /// Process every agent-originated message for one session: streaming
    /// updates, the terminal prompt result, and agent-initiated requests
    /// (permission bridging).
    async fn handle_inbound(&self, session: Arc<SessionState>, conn: Arc<ConnectionState>, inbound: Inbound) {
        match inbound {
            Inbound::Notification(note) => match note.method.as_str() {
                "session/update" => self.handle_session_update(&session, &conn, note.params).await,
                "session/prompt" => self.handle_prompt_complete(&session, &conn, note.params).await,
                other => tracing::debug!(method = other, "unhandled agent notification"),
            },
            Inbound::AgentRequest { id, method, params } => match method.as_str() {
                "session/request_permission" => {
                    self.handle_permission_request(&session, &conn, id, params).await
                }
                other => {
                    tracing::warn!(method = other, "unsupported agent-originated request rejected");
                    let _ = session.correlator.reject(id, -32601, "method not supported by bridge");
                }
            },
        }
    }

    async fn handle_session_update(&self, session: &Arc<SessionState>, conn: &Arc<ConnectionState>, params: Option<Value>) {
        let Some(pending) = session.pending_prompt.lock().await.clone() else {
            tracing::debug!("session/update dropped: no prompt in flight");
            return;
        };
        let raw = params.unwrap_or(Value::Null);
        let (kind, translated) = translate::translate_update(&raw);
        let mut update = translated.as_object().cloned().unwrap_or_default();
        update.insert("kind".to_string(), json!(kind));

        let session_id = session.current_id().await;
        conn.send(Envelope::create_message(
            "acp:prompt:update",
            Some(json!({
                "sessionId": session_id,
                "requestId": pending.request_id,
                "update": Value::Object(update),
            })),
        ));
    }

    async fn handle_prompt_complete(&self, session: &Arc<SessionState>, conn: &Arc<ConnectionState>, params: Option<Value>) {
        let Some(pending) = session.pending_prompt.lock().await.take() else {
            tracing::debug!("session/prompt result with no pending prompt; dropped");
            return;
        };
        let result = params.unwrap_or_else(|| json!({ "content": [], "stopReason": "end_turn" }));
        let content = result.get("content").cloned().unwrap_or_else(|| json!([]));
        let stop_reason = result.get("stopReason").and_then(|v| v.as_str()).unwrap_or("end_turn");
        let session_id = session.current_id().await;
        conn.send(Envelope::create_message(
            "acp:prompt:complete",
            Some(json!({
                "sessionId": session_id,
                "requestId": pending.request_id,
                "result": { "content": content, "stopReason": stop_reason },
            })),
        ));
    }

    async fn handle_permission_request(
        &self,
        session: &Arc<SessionState>,
        conn: &Arc<ConnectionState>,
        agent_request_id: Value,
        params: Option<Value>,
    ) {
        let params = params.unwrap_or(Value::Null);
        let request_id = Uuid::new_v4().to_string();
        session
            .pending_permissions
            .lock()
            .await
            .insert(request_id.clone(), agent_request_id);

        let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
        let options = params.get("options").cloned().unwrap_or_else(default_permission_options);
        let session_id = session.current_id().await;

        conn.send(Envelope::create_message(
            "acp:permission:request",
            Some(json!({
                "sessionId": session_id,
                "requestId": request_id,
                "toolCall": tool_call,
                "options": options,
            })),
        ));
    }

    /// Handle the subprocess's stdout pipe closing: the process has exited.
    /// A no-op if the session was already closed deliberately (avoids a
    /// spurious error racing an intentional `acp:session:close:request`).
    async fn handle_subprocess_exit(self: Arc<Self>, session: Arc<SessionState>, conn: Arc<ConnectionState>) {
        if session.current_status().await == SessionStatus::Closed {
            return;
        }
        *session.status.lock().await = SessionStatus::Closed;
        let session_id = session.current_id().await;
        self.sessions.lock().await.remove(&session_id);
        conn.session_ids.lock().await.remove(&session_id);
        session.correlator.reject_all("Process terminated unexpectedly").await;

        if let Some(pending) = session.pending_prompt.lock().await.take() {
            conn.send(Envelope::create_message(
                "acp:prompt:complete",
                Some(json!({
                    "sessionId": session_id,
                    "requestId": pending.request_id,
                    "result": { "content": [], "stopReason": "error" },
                })),
            ));
        }

        conn.send(Envelope::create_error(
            "acp:session:error",
            EnvelopeError::new("SUBPROCESS_EXITED", "Process terminated unexpectedly"),
            Some(json!({ "sessionId": session_id })),
        ));
    }

    async fn close_session_internal(&self, session_id: &str) {
        let Some(session) = self.sessions.lock().await.remove(session_id) else {
            return;
        };
        *session.status.lock().await = SessionStatus::Closed;
        session.correlator.reject_all("Session closed").await;
        let _ = session.subprocess.kill().await;
        if let Some(conn) = self.connections.lock().await.get(&session.connection_id) {
            conn.session_ids.lock().await.remove(session_id);
        }
    }

    async fn lookup_owned(&self, conn: &ConnectionState, session_id: &str) -> std::result::Result<Arc<SessionState>, LookupError> {
        let session = self.sessions.lock().await.get(session_id).cloned().ok_or(LookupError::NotFound)?;
        if session.connection_id != conn.id {
            return Err(LookupError::Unauthorized);
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::connection::ConnectionState;
    use crate::subprocess::manager::test_support::noop_handle;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::sync::Mutex as TokioMutex;

    fn test_connection() -> (Arc<ConnectionState>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ConnectionState {
            id: "conn-1".to_string(),
            principal: "alice".to_string(),
            session_ids: TokioMutex::new(Default::default()),
            liveness: Arc::new(AtomicBool::new(true)),
            outbound_tx: tx,
        });
        (conn, rx)
    }

    fn test_session(conn_id: &str) -> (Arc<SessionState>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let correlator = Correlator::new(tx);
        let session = Arc::new(SessionState {
            id: TokioMutex::new("tentative".to_string()),
            connection_id: conn_id.to_string(),
            principal: "alice".to_string(),
            cwd: None,
            model: None,
            status: TokioMutex::new(SessionStatus::Initializing),
            auth_methods: TokioMutex::new(None),
            pending_prompt: TokioMutex::new(None),
            pending_permissions: TokioMutex::new(Default::default()),
            subprocess: noop_handle(),
            correlator,
        });
        (session, rx)
    }

    #[tokio::test]
    async fn test_handshake_migrates_session_id() {
        let dispatcher = Dispatcher::new();
        let (session, mut rx) = test_session("conn-1");

        let handle = {
            let dispatcher = dispatcher.clone();
            let session = session.clone();
            tokio::spawn(async move {
                dispatcher
                    .complete_session_creation(session, "tentative".to_string(), None, None)
                    .await
            })
        };

        let init_line = rx.recv().await.unwrap();
        let init_req: Value = serde_json::from_str(&init_line).unwrap();
        assert_eq!(init_req["method"], "initialize");
        session
            .correlator
            .dispatch(&format!(
                r#"{{"jsonrpc":"2.0","id":{},"result":{{"authMethods":[]}}}}"#,
                init_req["id"]
            ))
            .await;

        let new_line = rx.recv().await.unwrap();
        let new_req: Value = serde_json::from_str(&new_line).unwrap();
        assert_eq!(new_req["method"], "session/new");
        session
            .correlator
            .dispatch(&format!(
                r#"{{"jsonrpc":"2.0","id":{},"result":{{"sessionId":"S1"}}}}"#,
                new_req["id"]
            ))
            .await;

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result["sessionId"], "S1");
        assert_eq!(session.current_id().await, "S1");
        assert_eq!(session.current_status().await, SessionStatus::Active);

        let sessions = dispatcher.sessions.lock().await;
        assert!(!sessions.contains_key("tentative"));
        assert!(sessions.contains_key("S1"));
    }

    #[tokio::test]
    async fn test_prompt_send_unauthorized_for_other_connection() {
        let dispatcher = Dispatcher::new();
        let (session, _rx) = test_session("conn-owner");
        *session.status.lock().await = SessionStatus::Active;
        *session.id.lock().await = "S1".to_string();
        dispatcher.sessions.lock().await.insert("S1".to_string(), session);

        let (other_conn, mut other_rx) = test_connection();
        dispatcher.prompt_send(other_conn, "req-1".to_string(), json!({ "sessionId": "S1", "content": [] })).await;

        let env = other_rx.recv().await.unwrap();
        assert_eq!(env.kind, "acp:prompt:send:error");
        assert_eq!(env.error.unwrap().code, "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_prompt_send_success_then_update_and_complete() {
        let dispatcher = Dispatcher::new();
        let (conn, mut conn_rx) = test_connection();
        let (session, mut subprocess_rx) = test_session(&conn.id);
        *session.status.lock().await = SessionStatus::Active;
        *session.id.lock().await = "S1".to_string();
        dispatcher.sessions.lock().await.insert("S1".to_string(), session.clone());

        // Wire the notification handler the way create_session would.
        dispatcher
            .wire_ordered_notifications(session.clone(), conn.clone(), &session.correlator)
            .await;

        dispatcher
            .prompt_send(
                conn.clone(),
                "R1".to_string(),
                json!({ "sessionId": "S1", "content": [{"type": "text", "text": "hi"}] }),
            )
            .await;

        let accepted = conn_rx.recv().await.unwrap();
        assert_eq!(accepted.kind, "acp:prompt:send:success");
        assert_eq!(accepted.payload.unwrap()["status"], "accepted");

        let sent_line = subprocess_rx.recv().await.unwrap();
        assert!(sent_line.contains("session/prompt"));
        assert!(sent_line.contains("\"hi\""));

        session
            .correlator
            .dispatch(
                r#"{"jsonrpc":"2.0","method":"session/update","params":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"hello"}}}"#,
            )
            .await;
        let update = conn_rx.recv().await.unwrap();
        assert_eq!(update.kind, "acp:prompt:update");
        let update_payload = update.payload.unwrap();
        assert_eq!(update_payload["requestId"], "R1");
        assert_eq!(update_payload["update"]["content"]["text"], "hello");

        session
            .correlator
            .dispatch(r#"{"jsonrpc":"2.0","id":999,"result":{"content":[{"type":"text","text":"hello"}],"stopReason":"end_turn"}}"#)
            .await;
        let complete = conn_rx.recv().await.unwrap();
        assert_eq!(complete.kind, "acp:prompt:complete");
        let complete_payload = complete.payload.unwrap();
        assert_eq!(complete_payload["requestId"], "R1");
        assert_eq!(complete_payload["result"]["stopReason"], "end_turn");
    }

    /// Regression test for the per-message-spawn ordering bug: dispatching
    /// two updates and the terminal completion back-to-back (without
    /// awaiting delivery in between, the way a fast-talking subprocess
    /// would) must still deliver them to the client in arrival order, with
    /// the completion last. Before `wire_ordered_notifications`, each
    /// `dispatch` call spawned its own detached task, so the completion
    /// task (which clears `pending_prompt`) could race ahead of an update
    /// task still in flight and silently drop it.
    #[tokio::test]
    async fn test_updates_and_complete_preserve_order_under_concurrent_dispatch() {
        let dispatcher = Dispatcher::new();
        let (conn, mut conn_rx) = test_connection();
        let (session, mut subprocess_rx) = test_session(&conn.id);
        *session.status.lock().await = SessionStatus::Active;
        *session.id.lock().await = "S1".to_string();
        dispatcher.sessions.lock().await.insert("S1".to_string(), session.clone());

        dispatcher
            .wire_ordered_notifications(session.clone(), conn.clone(), &session.correlator)
            .await;

        dispatcher
            .prompt_send(
                conn.clone(),
                "R1".to_string(),
                json!({ "sessionId": "S1", "content": [{"type": "text", "text": "hi"}] }),
            )
            .await;
        conn_rx.recv().await.unwrap(); // acp:prompt:send:success
        subprocess_rx.recv().await.unwrap(); // the session/prompt line

        // Fire all three inbound lines without waiting for any of them to
        // be handled; only the final `conn_rx` receive order is checked.
        session
            .correlator
            .dispatch(
                r#"{"jsonrpc":"2.0","method":"session/update","params":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"first"}}}"#,
            )
            .await;
        session
            .correlator
            .dispatch(
                r#"{"jsonrpc":"2.0","method":"session/update","params":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"second"}}}"#,
            )
            .await;
        session
            .correlator
            .dispatch(r#"{"jsonrpc":"2.0","id":999,"result":{"content":[{"type":"text","text":"first second"}],"stopReason":"end_turn"}}"#)
            .await;

        let first = conn_rx.recv().await.unwrap();
        assert_eq!(first.kind, "acp:prompt:update");
        assert_eq!(first.payload.unwrap()["update"]["content"]["text"], "first");

        let second = conn_rx.recv().await.unwrap();
        assert_eq!(second.kind, "acp:prompt:update");
        assert_eq!(second.payload.unwrap()["update"]["content"]["text"], "second");

        let complete = conn_rx.recv().await.unwrap();
        assert_eq!(complete.kind, "acp:prompt:complete");
        assert_eq!(complete.payload.unwrap()["requestId"], "R1");

        assert!(conn_rx.try_recv().is_err(), "no further envelopes after complete");
    }

    #[tokio::test]
    async fn test_session_close_rejects_pending_and_emits_success() {
        let dispatcher = Dispatcher::new();
        let (conn, mut conn_rx) = test_connection();
        let (session, _rx) = test_session(&conn.id);
        *session.status.lock().await = SessionStatus::Active;
        *session.id.lock().await = "S1".to_string();
        conn.session_ids.lock().await.insert("S1".to_string());
        dispatcher.sessions.lock().await.insert("S1".to_string(), session.clone());
        dispatcher.register_connection(conn.clone()).await;

        dispatcher.session_close(&conn, "req-close".to_string(), json!({ "sessionId": "S1" })).await;

        let env = conn_rx.recv().await.unwrap();
        assert_eq!(env.kind, "acp:session:close:success");
        assert_eq!(session.current_status().await, SessionStatus::Closed);
        assert!(!dispatcher.sessions.lock().await.contains_key("S1"));
    }

    #[tokio::test]
    async fn test_repeated_close_is_ignorable_success() {
        let dispatcher = Dispatcher::new();
        let (conn, mut conn_rx) = test_connection();

        dispatcher.session_close(&conn, "req-1".to_string(), json!({ "sessionId": "never-existed" })).await;
        let env = conn_rx.recv().await.unwrap();
        assert_eq!(env.kind, "acp:session:close:success");
    }

    #[tokio::test]
    async fn test_permission_request_then_response_round_trip() {
        let dispatcher = Dispatcher::new();
        let (conn, mut conn_rx) = test_connection();
        let (session, _rx) = test_session(&conn.id);
        *session.id.lock().await = "S1".to_string();
        dispatcher.sessions.lock().await.insert("S1".to_string(), session.clone());

        dispatcher
            .handle_permission_request(
                &session,
                &conn,
                json!(7),
                Some(json!({ "toolCall": { "toolCallId": "t1" } })),
            )
            .await;

        let env = conn_rx.recv().await.unwrap();
        assert_eq!(env.kind, "acp:permission:request");
        let payload = env.payload.unwrap();
        let request_id = payload["requestId"].as_str().unwrap().to_string();
        assert_eq!(payload["options"].as_array().unwrap().len(), 2);

        dispatcher
            .permission_response(
                &conn,
                json!({ "sessionId": "S1", "requestId": request_id, "outcome": { "outcome": "selected", "optionId": "allow" } }),
            )
            .await;

        assert!(session.pending_permissions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_prompt_cancel_sends_notification_and_acks() {
        let dispatcher = Dispatcher::new();
        let (conn, mut conn_rx) = test_connection();
        let (session, mut subprocess_rx) = test_session(&conn.id);
        *session.status.lock().await = SessionStatus::Active;
        *session.id.lock().await = "S1".to_string();
        dispatcher.sessions.lock().await.insert("S1".to_string(), session.clone());

        dispatcher.prompt_cancel(&conn, "req-cancel".to_string(), json!({ "sessionId": "S1" })).await;

        let sent_line = subprocess_rx.recv().await.unwrap();
        assert!(sent_line.contains("session/cancel"));

        let env = conn_rx.recv().await.unwrap();
        assert_eq!(env.kind, "acp:prompt:cancel:success");
    }

    #[tokio::test]
    async fn test_subprocess_exit_completes_pending_prompt_and_emits_error() {
        let dispatcher = Dispatcher::new();
        let (conn, mut conn_rx) = test_connection();
        let (session, _rx) = test_session(&conn.id);
        *session.status.lock().await = SessionStatus::Active;
        *session.id.lock().await = "S1".to_string();
        *session.pending_prompt.lock().await = Some(PendingPrompt {
            request_id: "R1".to_string(),
            connection_id: conn.id.clone(),
        });
        conn.session_ids.lock().await.insert("S1".to_string());
        dispatcher.sessions.lock().await.insert("S1".to_string(), session.clone());

        dispatcher.clone().handle_subprocess_exit(session.clone(), conn.clone()).await;

        let complete = conn_rx.recv().await.unwrap();
        assert_eq!(complete.kind, "acp:prompt:complete");
        assert_eq!(complete.payload.unwrap()["result"]["stopReason"], "error");

        let error_env = conn_rx.recv().await.unwrap();
        assert_eq!(error_env.kind, "acp:session:error");
        assert_eq!(error_env.error.unwrap().code, "SUBPROCESS_EXITED");

        assert_eq!(session.current_status().await, SessionStatus::Closed);
        assert!(!dispatcher.sessions.lock().await.contains_key("S1"));
        assert!(!conn.session_ids.lock().await.contains("S1"));
    }

    #[tokio::test]
    async fn test_subprocess_exit_is_noop_once_already_closed() {
        let dispatcher = Dispatcher::new();
        let (conn, mut conn_rx) = test_connection();
        let (session, _rx) = test_session(&conn.id);
        *session.status.lock().await = SessionStatus::Closed;
        *session.id.lock().await = "S1".to_string();

        dispatcher.clone().handle_subprocess_exit(session.clone(), conn.clone()).await;

        assert!(conn_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_connection_closes_every_owned_session() {
        let dispatcher = Dispatcher::new();
        let (conn, _conn_rx) = test_connection();
        let (session_a, _rx_a) = test_session(&conn.id);
        *session_a.id.lock().await = "S1".to_string();
        let (session_b, _rx_b) = test_session(&conn.id);
        *session_b.id.lock().await = "S2".to_string();

        conn.session_ids.lock().await.insert("S1".to_string());
        conn.session_ids.lock().await.insert("S2".to_string());
        dispatcher.sessions.lock().await.insert("S1".to_string(), session_a.clone());
        dispatcher.sessions.lock().await.insert("S2".to_string(), session_b.clone());
        dispatcher.register_connection(conn.clone()).await;

        dispatcher.close_connection(&conn.id).await;

        assert_eq!(session_a.current_status().await, SessionStatus::Closed);
        assert_eq!(session_b.current_status().await, SessionStatus::Closed);
        assert!(dispatcher.sessions.lock().await.is_empty());
        assert!(dispatcher.connection(&conn.id).await.is_none());
    }
}
