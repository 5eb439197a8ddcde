//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use parley_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_MAX_TEXT_LENGTH, DEFAULT_SESSION_QUEUE_CAPACITY,
    DEFAULT_SESSION_TTL_HOURS, MAX_SESSION_TTL_HOURS,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// Ed25519 secret used to sign session tokens (hex-encoded, 64 chars).
    /// Env: `SESSION_SIGNING_KEY`
    /// Default: none (a random per-process key is generated).
    pub session_signing_key: Option<[u8; 32]>,

    /// Session token lifetime in hours.
    /// Env: `SESSION_TTL_HOURS`
    pub session_ttl_hours: i64,

    /// Maximum text message length in characters.
    /// Env: `MAX_TEXT_LENGTH`
    pub max_text_length: usize,

    /// Outbound event queue depth per connected session.
    /// Env: `SESSION_QUEUE_CAPACITY`
    pub session_queue_capacity: usize,

    /// Sustained requests (or socket events) per second per client.
    /// Env: `RATE_LIMIT_PER_SEC`
    pub rate_limit_per_sec: f64,

    /// Token bucket capacity.
    /// Env: `RATE_LIMIT_BURST`
    pub rate_limit_burst: f64,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("session_signing_key", &self.session_signing_key.map(|_| "<redacted>"))
            .field("session_ttl_hours", &self.session_ttl_hours)
            .field("max_text_length", &self.max_text_length)
            .field("session_queue_capacity", &self.session_queue_capacity)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            session_signing_key: None,
            session_ttl_hours: DEFAULT_SESSION_TTL_HOURS,
            max_text_length: DEFAULT_MAX_TEXT_LENGTH,
            session_queue_capacity: DEFAULT_SESSION_QUEUE_CAPACITY,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(hex_key) = lookup("SESSION_SIGNING_KEY") {
            match parse_hex_key(&hex_key) {
                Ok(key) => config.session_signing_key = Some(key),
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid SESSION_SIGNING_KEY, using a random key");
                }
            }
        }

        parse_into(&lookup, "SESSION_TTL_HOURS", &mut config.session_ttl_hours, |v| {
            (1..=MAX_SESSION_TTL_HOURS).contains(v)
        });
        parse_into(&lookup, "MAX_TEXT_LENGTH", &mut config.max_text_length, |v| *v > 0);
        parse_into(
            &lookup,
            "SESSION_QUEUE_CAPACITY",
            &mut config.session_queue_capacity,
            |v| *v > 0,
        );
        parse_into(&lookup, "RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec, |v| *v > 0.0);
        parse_into(&lookup, "RATE_LIMIT_BURST", &mut config.rate_limit_burst, |v| *v >= 1.0);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_into<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
    valid: impl Fn(&T) -> bool,
) where
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => *slot = value,
        _ => tracing::warn!(key, value = %raw, "Invalid setting, using default"),
    }
}

/// Parse a 64-character hex string into a 32-byte array.
fn parse_hex_key(raw: &str) -> Result<[u8; 32], String> {
    let raw = raw.trim();
    if raw.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", raw.len()));
    }
    let bytes = hex::decode(raw).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert!(config.session_signing_key.is_none());
        assert_eq!(config.max_text_length, 4000);
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATABASE_PATH", "/tmp/chat.db"),
            ("SESSION_SIGNING_KEY", &"ab".repeat(32)),
            ("MAX_TEXT_LENGTH", "100"),
            ("RATE_LIMIT_BURST", "5"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.database_path, PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.session_signing_key, Some([0xab; 32]));
        assert_eq!(config.max_text_length, 100);
        assert_eq!(config.rate_limit_burst, 5.0);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = from_map(&[
            ("HTTP_ADDR", "nope"),
            ("SESSION_SIGNING_KEY", "abcd"),
            ("SESSION_QUEUE_CAPACITY", "0"),
            ("SESSION_TTL_HOURS", "soon"),
        ]);
        let defaults = ServerConfig::default();
        assert_eq!(config.http_addr, defaults.http_addr);
        assert!(config.session_signing_key.is_none());
        assert_eq!(config.session_queue_capacity, defaults.session_queue_capacity);
        assert_eq!(config.session_ttl_hours, defaults.session_ttl_hours);
    }

    #[test]
    fn test_ttl_is_bounded() {
        let defaults = ServerConfig::default();
        for raw in ["0", "-5", "87601", "10000000000"] {
            let config = from_map(&[("SESSION_TTL_HOURS", raw)]);
            assert_eq!(config.session_ttl_hours, defaults.session_ttl_hours, "{raw}");
        }

        let config = from_map(&[("SESSION_TTL_HOURS", "87600")]);
        assert_eq!(config.session_ttl_hours, 87_600);
        // The accepted maximum still yields a usable signer.
        chrono::Duration::hours(config.session_ttl_hours);
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = from_map(&[("SESSION_SIGNING_KEY", &"cd".repeat(32))]);
        let printed = format!("{config:?}");
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("cdcd"));
    }
}
