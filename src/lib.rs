//! Bridge gateway - typed-protocol bridge between a browser chat client and
//! a local AI coding agent subprocess.
//!
//! The gateway terminates a WebSocket connection from the browser, speaks a
//! closed envelope protocol over it, and drives an agent subprocess over
//! newline-delimited JSON-RPC 2.0 on stdio. It holds no conversation state of
//! its own beyond what's needed to route one browser connection's messages to
//! the right subprocess and back.
//!
//! # Architecture
//!
//! - `protocol`: the client-facing envelope type and its closed schema registry
//! - `rpc`: JSON-RPC types and the request/response correlator
//! - `subprocess`: agent binary discovery, spawn, line-framed stdio, teardown
//! - `dispatcher`: session/connection state and the envelope-to-JSON-RPC bridge
//! - `auth`: bearer token issuance/verification and the `/auth/*` HTTP surface
//! - `server`: axum router, WebSocket upgrade, health check
//! - `config`: layered configuration (defaults, YAML file, environment)
//! - `error`: error taxonomy and result alias
//! - `cli`: command-line interface definition

pub mod auth;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod subprocess;

pub use config::Config;
pub use error::{BridgeError, Result};
