//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use tandem_shared::constants::{
    DEFAULT_HISTORY_REPLAY_LIMIT, DEFAULT_HTTP_PORT, MAX_ATTACHMENT_SIZE,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket listener.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./tandem.db`
    pub database_path: PathBuf,

    /// Directory where uploaded attachments are stored.
    /// Env: `ATTACHMENT_STORAGE_PATH`
    /// Default: `./attachments`
    pub attachment_storage_path: PathBuf,

    /// Maximum attachment size in bytes.
    /// Env: `MAX_ATTACHMENT_SIZE`
    /// Default: 25 MiB
    pub max_attachment_size: usize,

    /// How many messages a `join` replays.
    /// Env: `HISTORY_REPLAY_LIMIT`
    /// Default: `200`
    pub history_replay_limit: usize,

    /// Base URL used when building attachment references.
    /// Env: `PUBLIC_BASE_URL`
    /// Default: `http://localhost:8080`
    pub public_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./tandem.db"),
            attachment_storage_path: PathBuf::from("./attachments"),
            max_attachment_size: MAX_ATTACHMENT_SIZE,
            history_replay_limit: DEFAULT_HISTORY_REPLAY_LIMIT,
            public_base_url: format!("http://localhost:{DEFAULT_HTTP_PORT}"),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = get("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = get("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = get("ATTACHMENT_STORAGE_PATH") {
            config.attachment_storage_path = PathBuf::from(path);
        }

        if let Some(val) = get("MAX_ATTACHMENT_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_attachment_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_ATTACHMENT_SIZE, using default"),
            }
        }

        if let Some(val) = get("HISTORY_REPLAY_LIMIT") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.history_replay_limit = n,
                _ => tracing::warn!(value = %val, "Invalid HISTORY_REPLAY_LIMIT, using default"),
            }
        }

        if let Some(url) = get("PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.history_replay_limit, 200);
        assert_eq!(config.max_attachment_size, 25 * 1024 * 1024);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("HISTORY_REPLAY_LIMIT", "50"),
            ("PUBLIC_BASE_URL", "https://chat.example.org/"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.history_replay_limit, 50);
        assert_eq!(config.public_base_url, "https://chat.example.org");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = load(&[("HTTP_ADDR", "nope"), ("MAX_ATTACHMENT_SIZE", "0")]);
        assert_eq!(config.http_addr, ServerConfig::default().http_addr);
        assert_eq!(config.max_attachment_size, MAX_ATTACHMENT_SIZE);
    }
}
