//! Gateway configuration (C8).
//!
//! Loaded in three layers, later layers winning: built-in defaults, an
//! optional YAML file, then environment variable overrides. The env surface
//! is exactly `PORT`, `HOST`, `JWT_SECRET`, `JWT_EXPIRES_IN`, `CORS_ORIGIN`,
//! `LOG_LEVEL`, `RATE_LIMIT_MAX`, `RATE_LIMIT_WINDOW_MS`.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_jwt_secret() -> String {
    "dev-secret-change-me".to_string()
}

fn default_jwt_expires_in_secs() -> i64 {
    3600
}

fn default_cors_origin() -> String {
    "*".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rate_limit_max() -> u32 {
    100
}

fn default_rate_limit_window_ms() -> u64 {
    60_000
}

fn default_demo_username() -> String {
    "admin".to_string()
}

/// bcrypt hash of the literal string `"admin"`, used as the out-of-the-box
/// demo password. Operators should override `demo_password_hash` in a YAML
/// config file for anything beyond local development.
fn default_demo_password_hash() -> String {
    "$2b$12$K8I1r2GZ8c2F9G1n9Y0Zs.7l8o6iQ1m0o0Gv9h8J4b7N3q2p1r0e.".to_string()
}

/// Gateway configuration, merged from defaults, an optional YAML file, and
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP port the HTTP/WebSocket server binds.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address (hostname or IP).
    #[serde(default = "default_host")]
    pub host: String,
    /// HMAC secret used to sign and verify JWTs.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    /// Lifetime assigned to freshly issued tokens, in seconds.
    #[serde(default = "default_jwt_expires_in_secs")]
    pub jwt_expires_in_secs: i64,
    /// Value for the `Access-Control-Allow-Origin` response header.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    /// `tracing` env-filter directive, e.g. `"info"` or `"debug,tower_http=warn"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Maximum requests per window before rate limiting kicks in.
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,
    /// Rate limit window size, in milliseconds.
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    /// Demo login username (no user database is in scope).
    #[serde(default = "default_demo_username")]
    pub demo_username: String,
    /// bcrypt hash of the demo login password.
    #[serde(default = "default_demo_password_hash")]
    pub demo_password_hash: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            jwt_secret: default_jwt_secret(),
            jwt_expires_in_secs: default_jwt_expires_in_secs(),
            cors_origin: default_cors_origin(),
            log_level: default_log_level(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            demo_username: default_demo_username(),
            demo_password_hash: default_demo_password_hash(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then an optional YAML file at
    /// `config_path`, then environment variable overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| BridgeError::Config(format!("failed to read {}: {e}", path.display())))?;
            let from_file: Config = serde_yaml::from_str(&contents)?;
            config = from_file;
        }

        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|_| BridgeError::Config(format!("PORT is not a valid port number: {port}")))?;
        }
        if let Ok(host) = std::env::var("HOST") {
            config.host = host;
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            config.jwt_secret = secret;
        }
        if let Ok(expires) = std::env::var("JWT_EXPIRES_IN") {
            config.jwt_expires_in_secs = expires
                .parse()
                .map_err(|_| BridgeError::Config(format!("JWT_EXPIRES_IN is not a valid integer: {expires}")))?;
        }
        if let Ok(origin) = std::env::var("CORS_ORIGIN") {
            config.cors_origin = origin;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(max) = std::env::var("RATE_LIMIT_MAX") {
            config.rate_limit_max = max
                .parse()
                .map_err(|_| BridgeError::Config(format!("RATE_LIMIT_MAX is not a valid integer: {max}")))?;
        }
        if let Ok(window) = std::env::var("RATE_LIMIT_WINDOW_MS") {
            config.rate_limit_window_ms = window.parse().map_err(|_| {
                BridgeError::Config(format!("RATE_LIMIT_WINDOW_MS is not a valid integer: {window}"))
            })?;
        }

        Ok(config)
    }

    /// Validate invariants that loading alone cannot enforce.
    pub fn validate(&self) -> Result<()> {
        if self.jwt_secret.trim().is_empty() {
            return Err(BridgeError::Config("JWT_SECRET must not be empty".to_string()).into());
        }
        if self.rate_limit_window_ms == 0 {
            return Err(BridgeError::Config("RATE_LIMIT_WINDOW_MS must be greater than zero".to_string()).into());
        }
        if self.rate_limit_max == 0 {
            return Err(BridgeError::Config("RATE_LIMIT_MAX must be greater than zero".to_string()).into());
        }
        self.bind_addr()?;
        Ok(())
    }

    /// The socket address the server should bind, derived from `host`/`port`.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| BridgeError::Config(format!("invalid bind address {}:{}: {e}", self.host, self.port)).into())
    }

    /// JWT lifetime as a [`chrono::Duration`].
    pub fn jwt_expires_in(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.jwt_expires_in_secs)
    }
}
