//! Closed registry of envelope types and their structural payload schemas.
//!
//! Schemas are structural, not nominal: extra fields are rejected, missing
//! required fields fail, enumerations are closed. This is deliberately not a
//! JSON Schema engine — the payload shapes here are small and fixed, so a
//! hand-rolled field-presence validator is both sufficient and legible.

use crate::error::BridgeError;
use serde_json::Value;

/// Every envelope `type` the gateway will accept on the client socket.
///
/// Event-shaped kinds (no `:request`/`:success`/`:error` suffix) are
/// included verbatim; request/response triples are listed individually so
/// that [`validate`] can reject an unrecognized status suffix.
pub const KNOWN_TYPES: &[&str] = &[
    "connection:established:success",
    "connection:heartbeat:request",
    "connection:heartbeat:success",
    "acp:initialize:request",
    "acp:initialize:success",
    "acp:initialize:error",
    "acp:session:create:request",
    "acp:session:create:success",
    "acp:session:create:error",
    "acp:session:load:request",
    "acp:session:load:success",
    "acp:session:load:error",
    "acp:session:close:request",
    "acp:session:close:success",
    "acp:session:close:error",
    "acp:session:error",
    "acp:prompt:send:request",
    "acp:prompt:send:success",
    "acp:prompt:send:error",
    "acp:prompt:update",
    "acp:prompt:complete",
    "acp:prompt:error",
    "acp:prompt:cancel:request",
    "acp:prompt:cancel:success",
    "acp:prompt:cancel:error",
    "acp:permission:request",
    "acp:permission:response",
    "system:error",
];

/// A small structural validator: required top-level fields, and whether
/// unlisted fields are rejected.
pub struct Schema {
    /// Field names that MUST be present in the payload object.
    pub required: &'static [&'static str],
    /// All field names the payload MAY contain (superset of `required`).
    /// `None` means "no payload expected at all" (object must be absent or empty).
    pub allowed: Option<&'static [&'static str]>,
}

/// Look up the schema for a known envelope type. Returns `None` for types
/// that carry no payload contract (event-shaped passthroughs, errors).
fn schema_for(kind: &str) -> Option<Schema> {
    match kind {
        "connection:heartbeat:request" => Some(Schema {
            required: &[],
            allowed: Some(&[]),
        }),
        "acp:session:create:request" => Some(Schema {
            required: &[],
            allowed: Some(&["cwd", "model"]),
        }),
        "acp:prompt:send:request" => Some(Schema {
            required: &["sessionId", "content"],
            allowed: Some(&["sessionId", "content", "agentMode"]),
        }),
        "acp:prompt:cancel:request" => Some(Schema {
            required: &["sessionId"],
            allowed: Some(&["sessionId"]),
        }),
        "acp:session:close:request" => Some(Schema {
            required: &["sessionId"],
            allowed: Some(&["sessionId"]),
        }),
        "acp:permission:response" => Some(Schema {
            required: &["sessionId", "requestId", "outcome"],
            allowed: Some(&["sessionId", "requestId", "outcome"]),
        }),
        _ => None,
    }
}

/// Validate a payload against the schema registered for `kind`.
///
/// Unknown types fail with [`BridgeError::Validation`] carrying code
/// `UNKNOWN_TYPE` in the message; callers building a client-visible error
/// should use [`crate::protocol::schema::error_code_for`] to recover the
/// right envelope error code.
pub fn validate(kind: &str, payload: Option<&Value>) -> Result<(), BridgeError> {
    if !KNOWN_TYPES.contains(&kind) {
        return Err(BridgeError::Validation(format!("UNKNOWN_TYPE: {kind}")));
    }

    let Some(schema) = schema_for(kind) else {
        // No payload contract registered: any payload (including none) is fine.
        return Ok(());
    };

    let obj = match payload {
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(BridgeError::Validation(format!(
                "INVALID_PARAMS: payload for {kind} must be an object, got {other}"
            )))
        }
        None => {
            if schema.required.is_empty() {
                return Ok(());
            }
            return Err(BridgeError::Validation(format!(
                "INVALID_PARAMS: {kind} requires a payload with fields {:?}",
                schema.required
            )));
        }
    };

    for field in schema.required {
        if !obj.contains_key(*field) {
            return Err(BridgeError::Validation(format!(
                "INVALID_PARAMS: {kind} missing required field `{field}`"
            )));
        }
    }

    if let Some(allowed) = schema.allowed {
        for key in obj.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(BridgeError::Validation(format!(
                    "INVALID_PARAMS: {kind} has unexpected field `{key}`"
                )));
            }
        }
    }

    Ok(())
}

/// Error code to report when `kind` itself is not in [`KNOWN_TYPES`].
pub fn error_code_for_unknown_type() -> &'static str {
    "UNKNOWN_TYPE"
}

/// Recover the stable envelope error code embedded in a [`validate`] failure
/// message. `validate` prefixes its message with the code it wants the
/// caller to report (`UNKNOWN_TYPE`, `INVALID_PARAMS`); anything else
/// (malformed JSON, a missing `type` field) is reported as `INVALID_MESSAGE`.
pub fn error_code_for_validation_message(message: &str) -> &'static str {
    if message.contains("UNKNOWN_TYPE") {
        "UNKNOWN_TYPE"
    } else if message.contains("INVALID_PARAMS") {
        "INVALID_PARAMS"
    } else {
        "INVALID_MESSAGE"
    }
}
