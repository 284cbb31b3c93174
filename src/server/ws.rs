//! WebSocket upgrade and per-connection socket pump (C3).
//!
//! Grounded on the split-sender/receiver, mpsc-relay pattern used for
//! real-time gateway connections elsewhere in the pack: one task drains an
//! outbound `mpsc` channel into the socket while also ticking a liveness
//! timer, and another reads inbound frames and hands them to the dispatcher.
//! Liveness rides native WebSocket ping/pong frames, kept separate from the
//! envelope-level `connection:heartbeat:*` exchange, which is client-
//! initiated and answered by the dispatcher like any other request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dispatcher::ConnectionState;
use crate::protocol::{schema, Envelope, EnvelopeError};
use crate::server::state::AppState;

/// How often a liveness ping is sent; a connection that hasn't answered the
/// previous ping by the next tick is considered dead.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: String,
}

/// `GET /ws?token=<bearer token>`. The token is validated before the
/// upgrade completes; a socket is never opened for an unauthenticated
/// caller (WebSocket upgrades are plain GETs and can't reliably carry an
/// `Authorization` header across browser/proxy stacks).
pub async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let claims = match state.token_service.verify(&params.token) {
        Ok(claims) => claims,
        Err(_) => return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, claims.sub, state))
}

async fn handle_socket(socket: WebSocket, principal: String, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();

    let conn_id = Uuid::new_v4().to_string();
    let liveness = Arc::new(AtomicBool::new(true));
    let conn = Arc::new(ConnectionState {
        id: conn_id.clone(),
        principal,
        session_ids: tokio::sync::Mutex::new(Default::default()),
        liveness: liveness.clone(),
        outbound_tx,
    });

    conn.send(crate::dispatcher::Dispatcher::connection_established(&conn_id));
    state.dispatcher.register_connection(conn.clone()).await;

    let send_liveness = liveness.clone();
    let send_conn_id = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
        ticker.tick().await; // first tick fires immediately, skip it
        loop {
            tokio::select! {
                biased;
                maybe_envelope = outbound_rx.recv() => {
                    let Some(envelope) = maybe_envelope else { break };
                    let Ok(text) = serde_json::to_string(&envelope) else { continue };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if !send_liveness.swap(false, Ordering::SeqCst) {
                        tracing::info!(connection_id = %send_conn_id, "connection failed liveness check, closing");
                        break;
                    }
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_conn = conn.clone();
    let recv_dispatcher = state.dispatcher.clone();
    let recv_liveness = liveness.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    recv_liveness.store(true, Ordering::SeqCst);
                    handle_inbound_text(&recv_dispatcher, &recv_conn, &text).await;
                }
                Ok(Message::Pong(_)) => {
                    recv_liveness.store(true, Ordering::SeqCst);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, connection_id = %recv_conn.id, "websocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => { recv_task.abort(); }
        _ = &mut recv_task => { send_task.abort(); }
    }

    state.dispatcher.close_connection(&conn_id).await;
}

async fn handle_inbound_text(dispatcher: &Arc<crate::dispatcher::Dispatcher>, conn: &Arc<ConnectionState>, text: &str) {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            conn.send(Envelope::create_error(
                "system:error",
                EnvelopeError::new("INVALID_MESSAGE", "payload is not valid JSON"),
                None,
            ));
            return;
        }
    };

    let envelope: Envelope = match serde_json::from_value(raw) {
        Ok(env) => env,
        Err(e) => {
            conn.send(Envelope::create_error(
                "system:error",
                EnvelopeError::new("INVALID_MESSAGE", format!("malformed envelope: {e}")),
                None,
            ));
            return;
        }
    };

    if let Err(e) = schema::validate(&envelope.kind, envelope.payload.as_ref()) {
        let code = schema::error_code_for_validation_message(&e.to_string());
        let error_kind = if code == "UNKNOWN_TYPE" {
            "system:error".to_string()
        } else {
            Envelope::derive_error_type(&envelope.kind)
        };
        conn.send(Envelope::respond_error(
            envelope.id.clone(),
            error_kind,
            EnvelopeError::new(code, e.to_string()),
            None,
        ));
        return;
    }

    dispatcher.handle_envelope(conn.clone(), envelope).await;
}
