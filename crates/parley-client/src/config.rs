use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::DEFAULT_HTTP_PORT;

/// Client settings. Every field has a default so tests and local runs need
/// no environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the server, e.g. `http://127.0.0.1:8080`.
    /// Env: `PARLEY_SERVER_URL`
    pub server_url: String,

    /// Constant delay between reconnect attempts.
    /// Env: `PARLEY_RECONNECT_DELAY_MS`
    pub reconnect_delay: Duration,

    /// Reconnect attempts before the session gives up.
    /// Env: `PARLEY_MAX_RECONNECT_ATTEMPTS`
    pub max_reconnect_attempts: u32,

    /// Timeout for every REST request, key lookups included.
    /// Env: `PARLEY_HTTP_TIMEOUT_SECS`
    pub http_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("http://127.0.0.1:{DEFAULT_HTTP_PORT}"),
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 10,
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("PARLEY_SERVER_URL").filter(|u| !u.trim().is_empty()) {
            config.server_url = url.trim().to_string();
        }
        if let Some(ms) = parsed::<u64, _>(&lookup, "PARLEY_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parsed(&lookup, "PARLEY_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = n;
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "PARLEY_HTTP_TIMEOUT_SECS").filter(|s| *s > 0) {
            config.http_timeout = Duration::from_secs(secs);
        }

        config
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// WebSocket endpoint derived from the server URL.
    pub fn ws_url(&self) -> String {
        let base = self.base_url();
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws}/ws")
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
            tracing::warn!(key, value = %raw, "Invalid client setting, using default");
            None
        }
    }
}
