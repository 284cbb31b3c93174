//! Command-line interface definition for the bridge gateway (C10).
//!
//! `clap`-derived subcommands: `serve` runs the gateway (the default when no
//! subcommand is given), `health-check` probes a running gateway's
//! `/health` endpoint, and `token issue`/`token verify` drive the bearer
//! token service (C2) directly for local testing without starting the
//! socket server.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Bridge gateway: typed-protocol bridge between a browser chat client and
/// a local AI coding agent subprocess.
#[derive(Parser, Debug, Clone)]
#[command(name = "bridge-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to an optional YAML configuration file, layered under env vars.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Command to execute; defaults to `serve` when omitted.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available top-level commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the gateway: accept WebSocket connections at `/ws`, serve the
    /// auth HTTP surface and `/health`.
    Serve {
        /// Override the bind port from config/env.
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the bind host from config/env.
        #[arg(long)]
        host: Option<String>,
    },

    /// Probe a running gateway's `/health` endpoint; exits non-zero unless
    /// the response body's `status` field is `"ok"`.
    HealthCheck {
        /// Base URL of the gateway, e.g. `http://127.0.0.1:8080`.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
    },

    /// Operate the bearer token service (C2) from the command line.
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
}

/// Token service subcommands, for local testing of C2 without an HTTP round trip.
#[derive(Subcommand, Debug, Clone)]
pub enum TokenCommand {
    /// Issue a bearer token for a principal.
    Issue {
        /// Principal (subject) to embed in the token's `sub` claim.
        #[arg(long)]
        username: String,
    },
    /// Verify a bearer token's signature and expiry.
    Verify {
        /// The token to verify.
        #[arg(long)]
        token: String,
    },
}

impl Cli {
    /// Parse CLI arguments from `std::env::args`.
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
