//! The typed envelope that rides every frame on the client socket.
//!
//! An envelope is `{id, type, timestamp, payload?, error?}`. `type` is a
//! string of the form `<domain>:<action>[:<status>]` drawn from a closed
//! enumeration (see [`crate::protocol::schema`]). This module owns envelope
//! construction and the sibling-derivation rules used to answer a `:request`
//! with a `:success` or `:error` of the same domain/action.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis()
}

/// The structured error carried by an envelope's `error` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeError {
    /// Stable machine-readable error code (e.g. `UNAUTHORIZED`).
    pub code: String,
    /// Short, actionable, human-readable message; never a stack trace.
    pub message: String,
    /// Optional raw upstream text for debugging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl EnvelopeError {
    /// Build an [`EnvelopeError`] with no `details`.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Build an [`EnvelopeError`] that also carries raw upstream text.
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

/// A single typed message at the client boundary.
///
/// Error envelopes MAY carry both an `error` object and a `payload` (e.g. a
/// session-scoped error carries the session identifier in the payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque, client- or server-generated unique identifier.
    pub id: String,
    /// Message type, e.g. `"acp:session:create:request"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Monotonic wall-clock timestamp in milliseconds.
    pub timestamp: u128,
    /// Typed payload; shape is determined by `kind`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Structured error, present on `:error` envelopes and `system:error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

impl Envelope {
    /// Construct a well-formed envelope with a freshly generated id and the
    /// current timestamp.
    pub fn create_message(kind: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            timestamp: now_millis(),
            payload,
            error: None,
        }
    }

    /// Construct an error envelope of the given `kind`, stamped with the
    /// current timestamp and a fresh id.
    pub fn create_error(
        kind: impl Into<String>,
        error: EnvelopeError,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            timestamp: now_millis(),
            payload,
            error: Some(error),
        }
    }

    /// Construct a response envelope that echoes `request_id`: the id of the
    /// triggering `:request` envelope. Request/response correlation at the
    /// envelope layer mirrors the JSON-RPC id convention one layer down, so
    /// a `:success`/`:error` can be matched to its request without a
    /// separate correlation table on the client.
    pub fn respond_to(
        request_id: impl Into<String>,
        kind: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: request_id.into(),
            kind: kind.into(),
            timestamp: now_millis(),
            payload,
            error: None,
        }
    }

    /// Construct an error response envelope that echoes `request_id`.
    pub fn respond_error(
        request_id: impl Into<String>,
        kind: impl Into<String>,
        error: EnvelopeError,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: request_id.into(),
            kind: kind.into(),
            timestamp: now_millis(),
            payload,
            error: Some(error),
        }
    }

    /// Split `kind` into `(domain, action, status)`, where `status` is
    /// absent for event-shaped kinds like `acp:prompt:update`.
    pub fn parts(kind: &str) -> (Option<&str>, Option<&str>, Option<&str>) {
        let mut it = kind.splitn(3, ':');
        (it.next(), it.next(), it.next())
    }

    /// Derive the `:error` sibling of a `:request` (or any) type.
    ///
    /// If `kind` ends in `:request` (or any trailing status segment), the
    /// sibling replaces that segment with `error`. If `kind` has only
    /// `domain:action` with no status segment, the sibling is
    /// `domain:action:error`. If `kind` itself has no recognizable
    /// `domain:action` form, the fallback is `system:error`.
    pub fn derive_error_type(kind: &str) -> String {
        let (domain, action, _status) = Self::parts(kind);
        match (domain, action) {
            (Some(d), Some(a)) => format!("{d}:{a}:error"),
            _ => "system:error".to_string(),
        }
    }

    /// Derive the `:success` sibling of a `:request` type, analogous to
    /// [`Envelope::derive_error_type`].
    pub fn derive_success_type(kind: &str) -> Option<String> {
        let (domain, action, _status) = Self::parts(kind);
        match (domain, action) {
            (Some(d), Some(a)) => Some(format!("{d}:{a}:success")),
            _ => None,
        }
    }
}
