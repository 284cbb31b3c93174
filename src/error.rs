//! Error types for the bridge gateway
//!
//! This module defines the error taxonomy used throughout the gateway, using
//! `thiserror` for ergonomic error handling. Every variant corresponds to a
//! row in the error taxonomy: each carries a stable `error_code()` used when
//! building envelope `error.code` fields sent back to the browser client.

use thiserror::Error;

/// Main error type for bridge gateway operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Envelope failed structural/schema validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Caller is not authorized to perform the requested operation.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Referenced session, connection, or pending request does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A JSON-RPC request to the subprocess was not answered within its deadline.
    #[error("correlator timeout: method={method}")]
    CorrelatorTimeout {
        /// JSON-RPC method that timed out.
        method: String,
    },

    /// The subprocess's stderr matched a known fatal-pattern regex.
    #[error("subprocess stderr pattern matched: {0}")]
    StderrPattern(String),

    /// The subprocess exited unexpectedly.
    #[error("subprocess exited: code={code:?}")]
    ProcessExit {
        /// Exit code, if the OS reported one.
        code: Option<i32>,
    },

    /// Subprocess transport-level failure (spawn, pipe, write).
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration is invalid or incomplete.
    #[error("configuration error: {0}")]
    Config(String),

    /// Bearer token is malformed, expired, or fails signature verification.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Internal invariant violation; should never surface to a well-behaved client.
    #[error("internal error: {0}")]
    Internal(String),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A correlator wait exceeded its `tokio::time::timeout` deadline.
    #[error("request timed out")]
    Elapsed(#[from] tokio::time::error::Elapsed),
}

impl BridgeError {
    /// Stable machine-readable code used in envelope `error.code` fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::Validation(_) => "VALIDATION_ERROR",
            BridgeError::Authorization(_) => "UNAUTHORIZED",
            BridgeError::NotFound(_) => "NOT_FOUND",
            BridgeError::CorrelatorTimeout { .. } => "TIMEOUT",
            BridgeError::StderrPattern(_) => "SUBPROCESS_ERROR",
            BridgeError::ProcessExit { .. } => "SUBPROCESS_EXITED",
            BridgeError::Transport(_) => "TRANSPORT_ERROR",
            BridgeError::Config(_) => "CONFIG_ERROR",
            BridgeError::Authentication(_) => "UNAUTHORIZED",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
            BridgeError::Io(_) => "INTERNAL_ERROR",
            BridgeError::Serialization(_) => "VALIDATION_ERROR",
            BridgeError::Yaml(_) => "CONFIG_ERROR",
            BridgeError::Elapsed(_) => "TIMEOUT",
        }
    }
}

/// Result type alias for bridge gateway operations.
pub type Result<T> = anyhow::Result<T>;

/// Recover a stable envelope error code from an `anyhow::Error`, falling
/// back to `INTERNAL_ERROR` for errors that didn't originate as a
/// [`BridgeError`] (e.g. a bare `tokio::task::JoinError`).
pub fn error_code_of(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<BridgeError>()
        .map(BridgeError::error_code)
        .unwrap_or("INTERNAL_ERROR")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_and_code() {
        let e = BridgeError::Validation("missing field `sessionId`".to_string());
        assert_eq!(
            e.to_string(),
            "validation error: missing field `sessionId`"
        );
        assert_eq!(e.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_correlator_timeout_display_and_code() {
        let e = BridgeError::CorrelatorTimeout {
            method: "session/prompt".to_string(),
        };
        assert!(e.to_string().contains("session/prompt"));
        assert_eq!(e.error_code(), "TIMEOUT");
    }

    #[test]
    fn test_process_exit_display() {
        let e = BridgeError::ProcessExit { code: Some(1) };
        assert!(e.to_string().contains("code=Some(1)"));
        assert_eq!(e.error_code(), "SUBPROCESS_EXITED");
    }

    #[test]
    fn test_authorization_error_code() {
        let e = BridgeError::Authorization("invalid token".to_string());
        assert_eq!(e.error_code(), "UNAUTHORIZED");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: BridgeError = io_error.into();
        assert!(matches!(error, BridgeError::Io(_)));
        assert_eq!(error.error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid}").unwrap_err();
        let error: BridgeError = json_err.into();
        assert!(matches!(error, BridgeError::Serialization(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<serde_yaml::Value>("invalid: : yaml").unwrap_err();
        let error: BridgeError = yaml_err.into();
        assert!(matches!(error, BridgeError::Yaml(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BridgeError>();
    }

    #[test]
    fn test_not_found_error_display() {
        let e = BridgeError::NotFound("session abc123".to_string());
        assert_eq!(e.to_string(), "not found: session abc123");
    }

    #[test]
    fn test_config_error_display() {
        let e = BridgeError::Config("JWT_SECRET must not be empty".to_string());
        assert_eq!(
            e.to_string(),
            "configuration error: JWT_SECRET must not be empty"
        );
    }
}
