//! Request/response correlation over a line-framed JSON-RPC transport.
//!
//! The agent subprocess speaks newline-delimited JSON-RPC 2.0 on stdout.
//! [`Correlator`] assigns ids to outgoing requests, parks a `oneshot`
//! receiver per in-flight id, and classifies every inbound line into one of
//! three buckets: a response to a pending request, a notification, or a
//! response whose id was never sent by us. The last case is not an error:
//! the agent may emit a terminal `session/prompt` result after we've already
//! stopped waiting on it (e.g. after a cancellation raced the response), and
//! the bridge still owes the browser client a terminal update. That bucket
//! is re-synthesized as a `session/prompt` notification so the dispatcher's
//! ordinary streaming path picks it up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::BridgeError;
use crate::rpc::types::{JsonRpcError, JsonRpcNotification, JsonRpcRequest};

/// Default deadline for a correlated request, per spec.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = HashMap<u64, oneshot::Sender<Result<serde_json::Value, JsonRpcError>>>;

/// An inbound message the subprocess sent us that isn't a response to one
/// of our own requests: either an ordinary notification, or a JSON-RPC
/// request the agent itself originated (e.g. `session/request_permission`),
/// which carries an `id` the bridge must eventually answer via
/// [`Correlator::respond`].
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A fire-and-forget notification (`session/update`, the synthesized
    /// terminal `session/prompt`, etc).
    Notification(JsonRpcNotification),
    /// An agent-originated request awaiting a JSON-RPC response.
    AgentRequest {
        /// The id to echo back in the eventual response.
        id: serde_json::Value,
        /// Method name, e.g. `session/request_permission`.
        method: String,
        /// Request parameters.
        params: Option<serde_json::Value>,
    },
}

/// A handler invoked for every inbound message the subprocess emits that
/// isn't a response to one of our own requests. The dispatcher is
/// responsible for reading `method`/`params` and routing by session id
/// found inside `params`.
pub type NotificationHandler = Arc<dyn Fn(Inbound) + Send + Sync>;

/// Correlates outgoing JSON-RPC requests with their eventual responses.
///
/// One `Correlator` is owned per subprocess. It does not itself write to or
/// read from the pipe; [`Correlator::outgoing_sender`] hands back the
/// channel the subprocess writer task drains, and [`Correlator::dispatch`]
/// is fed every inbound line by the subprocess reader task.
#[derive(Clone)]
pub struct Correlator {
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<PendingMap>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    notification_handler: Arc<Mutex<Option<NotificationHandler>>>,
}

impl Correlator {
    /// Build a correlator that writes serialized JSON-RPC lines onto
    /// `outbound_tx` (consumed by the subprocess's stdin writer task).
    pub fn new(outbound_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound_tx,
            notification_handler: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the handler invoked for every notification this correlator
    /// receives. Replaces any previously registered handler, which is how
    /// a session migration re-points notification delivery at the new
    /// session id without losing in-flight state (see
    /// [`crate::dispatcher::session`]).
    pub async fn on_notification(&self, handler: NotificationHandler) {
        *self.notification_handler.lock().await = Some(handler);
    }

    /// Send a JSON-RPC request and wait up to `timeout` for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> crate::error::Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: serde_json::Value::from(id),
            method: method.to_string(),
            params,
        };
        let line = serde_json::to_string(&req)?;
        if self.outbound_tx.send(line).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(BridgeError::Transport("subprocess stdin closed".to_string()).into());
        }

        let method_owned = method.to_string();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(rpc_err))) => {
                Err(BridgeError::Transport(format!("{method_owned}: {rpc_err}")).into())
            }
            Ok(Err(_canceled)) => {
                Err(BridgeError::Internal(format!("{method_owned}: correlator dropped")).into())
            }
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                Err(BridgeError::CorrelatorTimeout {
                    method: method_owned,
                }
                .into())
            }
        }
    }

    /// Send a fire-and-forget JSON-RPC notification; no response is expected.
    pub fn notify(&self, method: &str, params: Option<serde_json::Value>) -> crate::error::Result<()> {
        let note = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&note)?;
        self.outbound_tx
            .send(line)
            .map_err(|_| BridgeError::Transport("subprocess stdin closed".to_string()))?;
        Ok(())
    }

    /// Reject every currently pending request (used on session close): each
    /// waiter observes a JSON-RPC error with `message` instead of hanging
    /// forever on a subprocess that will never answer.
    pub async fn reject_all(&self, message: &str) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(JsonRpcError {
                code: -32000,
                message: message.to_string(),
                data: None,
            }));
        }
    }

    /// Answer an agent-originated request with a JSON-RPC error, for methods
    /// the dispatcher does not support bridging.
    pub fn reject(&self, id: serde_json::Value, code: i64, message: &str) -> crate::error::Result<()> {
        let response = crate::rpc::types::JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        };
        let line = serde_json::to_string(&response)?;
        self.outbound_tx
            .send(line)
            .map_err(|_| BridgeError::Transport("subprocess stdin closed".to_string()))?;
        Ok(())
    }

    /// Answer an agent-originated request (e.g. `session/request_permission`)
    /// with a successful result.
    pub fn respond(&self, id: serde_json::Value, result: serde_json::Value) -> crate::error::Result<()> {
        let response = crate::rpc::types::JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        };
        let line = serde_json::to_string(&response)?;
        self.outbound_tx
            .send(line)
            .map_err(|_| BridgeError::Transport("subprocess stdin closed".to_string()))?;
        Ok(())
    }

    /// Feed one raw inbound line to the correlator. Classifies and routes it;
    /// never returns an error for malformed lines (they are logged by the
    /// caller and dropped, matching the subprocess's own tolerance for noisy
    /// stdout).
    pub async fn dispatch(&self, raw: &str) {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(line = raw, error = %err, "discarding unparseable subprocess line");
                return;
            }
        };

        let has_id = value.get("id").is_some();
        let has_method = value.get("method").is_some();
        let has_result_or_error = value.get("result").is_some() || value.get("error").is_some();

        if has_id && has_result_or_error {
            let id = value.get("id").and_then(|v| v.as_u64());
            let resolved = match id {
                Some(id) => self.pending.lock().await.remove(&id),
                None => None,
            };
            match resolved {
                Some(sender) => {
                    let outcome = if let Some(err_val) = value.get("error") {
                        match serde_json::from_value::<JsonRpcError>(err_val.clone()) {
                            Ok(err) => Err(err),
                            Err(_) => Err(JsonRpcError {
                                code: -32000,
                                message: "malformed error object".to_string(),
                                data: None,
                            }),
                        }
                    } else {
                        Ok(value.get("result").cloned().unwrap_or(serde_json::Value::Null))
                    };
                    let _ = sender.send(outcome);
                }
                None => {
                    // id was never ours, or the wait already timed out and was
                    // removed: resurrect it as a terminal session/prompt
                    // notification so the dispatcher still completes the turn.
                    let synthetic_params = value
                        .get("result")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({ "content": [], "stopReason": "unknown" }));
                    self.route(Inbound::Notification(JsonRpcNotification::new(
                        "session/prompt",
                        Some(synthetic_params),
                    )))
                    .await;
                }
            }
            return;
        }

        if has_id && has_method {
            // Agent-originated request (e.g. session/request_permission):
            // carries both an id and a method, but no result/error yet.
            let id = value.get("id").cloned().unwrap_or(serde_json::Value::Null);
            let method = value
                .get("method")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string();
            let params = value.get("params").cloned();
            self.route(Inbound::AgentRequest { id, method, params }).await;
            return;
        }

        if has_method && !has_id {
            match serde_json::from_value::<JsonRpcNotification>(value) {
                Ok(note) => self.route(Inbound::Notification(note)).await,
                Err(err) => tracing::warn!(error = %err, "malformed notification"),
            }
        }
    }

    async fn route(&self, inbound: Inbound) {
        if let Some(handler) = self.notification_handler.lock().await.as_ref() {
            handler(inbound);
        } else {
            tracing::debug!("inbound message dropped: no handler registered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make() -> (Correlator, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Correlator::new(tx), rx)
    }

    #[tokio::test]
    async fn test_request_resolves_on_matching_response() {
        let (corr, mut rx) = make();
        let corr2 = corr.clone();
        let handle = tokio::spawn(async move {
            corr2.request("session/new", None, Duration::from_secs(1)).await
        });
        let sent = rx.recv().await.unwrap();
        let req: serde_json::Value = serde_json::from_str(&sent).unwrap();
        let id = req["id"].clone();
        corr.dispatch(&format!(r#"{{"jsonrpc":"2.0","id":{id},"result":{{"sessionId":"abc"}}}}"#))
            .await;
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result["sessionId"], "abc");
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (corr, _rx) = make();
        let err = corr
            .request("session/new", None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("correlator timeout"));
    }

    #[tokio::test]
    async fn test_unknown_id_response_becomes_session_prompt_notification() {
        let (corr, _rx) = make();
        let received = Arc::new(Mutex::new(None));
        let received2 = received.clone();
        corr.on_notification(Arc::new(move |inbound: Inbound| {
            let received = received2.clone();
            tokio::spawn(async move {
                *received.lock().await = Some(inbound);
            });
        }))
        .await;
        corr.dispatch(r#"{"jsonrpc":"2.0","id":999,"result":{"content":[],"stopReason":"end_turn"}}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let inbound = received.lock().await.take().expect("synthetic notification delivered");
        match inbound {
            Inbound::Notification(note) => {
                assert_eq!(note.method, "session/prompt");
                assert_eq!(note.params.unwrap()["stopReason"], "end_turn");
            }
            Inbound::AgentRequest { .. } => panic!("expected a notification"),
        }
    }

    #[tokio::test]
    async fn test_plain_notification_routed_to_handler() {
        let (corr, _rx) = make();
        let received = Arc::new(Mutex::new(None));
        let received2 = received.clone();
        corr.on_notification(Arc::new(move |inbound: Inbound| {
            let received = received2.clone();
            tokio::spawn(async move {
                *received.lock().await = Some(inbound);
            });
        }))
        .await;
        corr.dispatch(r#"{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"S"}}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let inbound = received.lock().await.take().expect("notification delivered");
        match inbound {
            Inbound::Notification(note) => assert_eq!(note.method, "session/update"),
            Inbound::AgentRequest { .. } => panic!("expected a notification"),
        }
    }

    #[tokio::test]
    async fn test_agent_request_routed_with_id_preserved() {
        let (corr, mut rx) = make();
        let received = Arc::new(Mutex::new(None));
        let received2 = received.clone();
        corr.on_notification(Arc::new(move |inbound: Inbound| {
            let received = received2.clone();
            tokio::spawn(async move {
                *received.lock().await = Some(inbound);
            });
        }))
        .await;
        corr.dispatch(r#"{"jsonrpc":"2.0","id":42,"method":"session/request_permission","params":{"sessionId":"S"}}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let inbound = received.lock().await.take().expect("agent request delivered");
        match inbound {
            Inbound::AgentRequest { id, method, .. } => {
                assert_eq!(id, serde_json::json!(42));
                assert_eq!(method, "session/request_permission");
            }
            Inbound::Notification(_) => panic!("expected an agent request"),
        }

        corr.respond(serde_json::json!(42), serde_json::json!({"outcome": "allow"})).unwrap();
        let sent = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(parsed["id"], 42);
        assert_eq!(parsed["result"]["outcome"], "allow");
    }

    #[tokio::test]
    async fn test_reject_all_resolves_every_pending_request() {
        let (corr, mut rx) = make();
        let corr2 = corr.clone();
        let handle = tokio::spawn(async move {
            corr2.request("session/prompt", None, Duration::from_secs(5)).await
        });
        let _sent = rx.recv().await.unwrap();
        corr.reject_all("Session closed").await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Session closed"));
    }

    #[tokio::test]
    async fn test_error_response_rejects_pending_request() {
        let (corr, mut rx) = make();
        let corr2 = corr.clone();
        let handle = tokio::spawn(async move {
            corr2.request("session/prompt", None, Duration::from_secs(1)).await
        });
        let sent = rx.recv().await.unwrap();
        let req: serde_json::Value = serde_json::from_str(&sent).unwrap();
        let id = req["id"].clone();
        corr.dispatch(&format!(
            r#"{{"jsonrpc":"2.0","id":{id},"error":{{"code":-32602,"message":"bad params"}}}}"#
        ))
        .await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("bad params"));
    }
}
