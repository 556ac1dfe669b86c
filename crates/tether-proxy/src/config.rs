//! Configuration for the forwarding proxy.
//!
//! Configuration is loaded from environment variables. There is no default
//! token: the proxy refuses to start without `TETHER_TOKEN`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tether_core::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_SOCKET_PATH};

/// Default TCP listen address (loopback only).
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8765";

/// Default time allowed for the upstream exchange.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TETHER_TOKEN must be set to a non-empty shared secret")]
    MissingToken,

    #[error("invalid listen address '{0}'")]
    InvalidAddr(String),
}

/// Configuration for the proxy.
#[derive(Clone)]
pub struct ProxyConfig {
    /// TCP address to accept connections on.
    pub listen_addr: SocketAddr,

    /// Unix socket of the tether server.
    pub socket_path: PathBuf,

    /// Shared secret clients must present.
    pub token: String,

    /// Largest frame accepted from clients or the server.
    pub max_message_size: usize,

    /// Time allowed for the upstream exchange.
    pub upstream_timeout: Duration,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("listen_addr", &self.listen_addr)
            .field("socket_path", &self.socket_path)
            .field("token", &"<redacted>")
            .field("max_message_size", &self.max_message_size)
            .field("upstream_timeout", &self.upstream_timeout)
            .finish()
    }
}

impl ProxyConfig {
    /// Create a config with defaults and the given token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            token: token.into(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TETHER_TOKEN` | required |
    /// | `TETHER_PROXY_ADDR` | `127.0.0.1:8765` |
    /// | `TETHER_SOCKET` | `/tmp/tether.sock` |
    /// | `TETHER_MAX_MESSAGE_BYTES` | `5242880` |
    /// | `TETHER_PROXY_TIMEOUT_SECS` | `120` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = std::env::var("TETHER_TOKEN").unwrap_or_default();
        Self::from_parts(
            &token,
            std::env::var("TETHER_PROXY_ADDR").ok().as_deref(),
            std::env::var("TETHER_SOCKET").ok(),
            std::env::var("TETHER_MAX_MESSAGE_BYTES")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            std::env::var("TETHER_PROXY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_secs),
        )
    }

    fn from_parts(
        token: &str,
        listen_addr: Option<&str>,
        socket_path: Option<String>,
        max_message_size: Option<usize>,
        upstream_timeout: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        if token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        let mut config = Self::new(token);

        let addr = listen_addr.unwrap_or(DEFAULT_LISTEN_ADDR);
        config.listen_addr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddr(addr.to_string()))?;
        if let Some(path) = socket_path {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(max) = max_message_size {
            config.max_message_size = max;
        }
        if let Some(timeout) = upstream_timeout {
            config.upstream_timeout = timeout;
        }
        Ok(config)
    }

    /// Warn about risky settings.
    pub fn validate_warn(&self) {
        if !self.listen_addr.ip().is_loopback() {
            tracing::warn!(addr = %self.listen_addr, "Proxy listening on a non-loopback address");
        }
        if self.token.len() < 16 {
            tracing::warn!("TETHER_TOKEN is shorter than 16 characters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_required() {
        assert!(matches!(
            ProxyConfig::from_parts("", None, None, None, None),
            Err(ConfigError::MissingToken)
        ));
        assert!(matches!(
            ProxyConfig::from_parts("   ", None, None, None, None),
            Err(ConfigError::MissingToken)
        ));
    }

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::from_parts("s3cret", None, None, None, None).unwrap();
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_overrides() {
        let config = ProxyConfig::from_parts(
            "s3cret",
            Some("0.0.0.0:9000"),
            Some("/run/tether.sock".into()),
            Some(1024),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.socket_path, PathBuf::from("/run/tether.sock"));
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.upstream_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_addr() {
        let err = ProxyConfig::from_parts("s3cret", Some("localhost"), None, None, None).unwrap_err();
        assert_eq!(err.to_string(), "invalid listen address 'localhost'");
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = ProxyConfig::new("s3cret");
        let debug = format!("{config:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));
    }
}
