//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::DEFAULT_HTTP_PORT;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API and WebSocket endpoints.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file, or `:memory:` for a throwaway store.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: String,

    /// Token admins present with `admin_auth` on `/admin/ws`.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin channel disabled).
    pub admin_token: Option<String>,

    /// Maximum concurrent connections per user (0 = unlimited).
    /// Env: `MAX_CONNECTIONS_PER_USER`
    /// Default: `0`
    pub max_connections_per_user: usize,

    /// Sustained requests per second per client (REST per IP, WebSocket
    /// sends per user).
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `10`
    pub rate_limit_per_sec: f64,

    /// Burst capacity of the token bucket.
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `30`
    pub rate_limit_burst: f64,

    /// Interval between server pings on every WebSocket.
    /// Env: `HEARTBEAT_INTERVAL_SECS`
    /// Default: `15`
    pub heartbeat_interval: Duration,

    /// A connection with no inbound frame for this long is dropped.
    /// Env: `CLIENT_TIMEOUT_SECS`
    /// Default: `45`
    pub client_timeout: Duration,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("admin_enabled", &self.admin_token.is_some())
            .field("max_connections_per_user", &self.max_connections_per_user)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("client_timeout", &self.client_timeout)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: "./parley.db".to_string(),
            admin_token: None,
            max_connections_per_user: 0,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
            heartbeat_interval: Duration::from_secs(15),
            client_timeout: Duration::from_secs(45),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Invalid values are
    /// logged and the default is kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = parsed(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.trim().is_empty()) {
            config.database_path = path;
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(n) = parsed(&lookup, "MAX_CONNECTIONS_PER_USER") {
            config.max_connections_per_user = n;
        }

        if let Some(rate) = parsed::<f64, _>(&lookup, "RATE_LIMIT_PER_SEC").filter(|r| *r > 0.0) {
            config.rate_limit_per_sec = rate;
        }

        if let Some(burst) = parsed::<f64, _>(&lookup, "RATE_LIMIT_BURST").filter(|b| *b >= 1.0) {
            config.rate_limit_burst = burst;
        }

        if let Some(secs) = parsed::<u64, _>(&lookup, "HEARTBEAT_INTERVAL_SECS").filter(|s| *s > 0) {
            config.heartbeat_interval = Duration::from_secs(secs);
        }

        if let Some(secs) = parsed::<u64, _>(&lookup, "CLIENT_TIMEOUT_SECS").filter(|s| *s > 0) {
            config.client_timeout = Duration::from_secs(secs);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
            None
        }
    }
}
