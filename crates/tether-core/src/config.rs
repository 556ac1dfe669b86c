//! Server configuration.
//!
//! Configuration is loaded from environment variables with sensible defaults,
//! or assembled in code through [`ServerConfig::builder`].

use crate::error::CoreError;
use std::path::PathBuf;
use std::time::Duration;

/// Default path of the local Unix socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tether.sock";

/// Largest frame body accepted or produced (5 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;

/// Wall-clock budget for a script run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Soft memory cap for a script interpreter (1 GiB).
pub const DEFAULT_MEMORY_LIMIT: usize = 1024 * 1024 * 1024;

/// Captured stdout/stderr cap per stream (1 MiB).
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Number of blocking workers.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Directory that is always on the path allow-list.
pub const BASELINE_ALLOW_DIR: &str = "/tmp";

/// Module roots scripts may never `require`.
///
/// Covers the OS interface, file and process access, the debug library,
/// sockets and HTTP/TLS clients.
pub const DEFAULT_BLOCKED_MODULES: &[&str] = &[
    "os",
    "io",
    "debug",
    "package",
    "ffi",
    "socket",
    "http",
    "https",
    "ssl",
    "lfs",
    "posix",
    "subprocess",
    "process",
    "shutil",
];

/// Configuration for the tether server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path of the Unix socket to listen on.
    pub socket_path: PathBuf,
    /// Timeout applied to script runs.
    pub timeout: Duration,
    /// Maximum frame body size in bytes.
    pub max_message_size: usize,
    /// Interpreter memory cap in bytes (`None` disables it).
    pub memory_limit: Option<usize>,
    /// Path prefixes that path-like parameters must live under.
    pub allow_dirs: Vec<PathBuf>,
    /// Module roots blocked by the import gate.
    pub blocked_modules: Vec<String>,
    /// Size of the blocking worker pool.
    pub max_workers: usize,
    /// Cap on captured stdout/stderr per stream.
    pub max_output_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            timeout: DEFAULT_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            memory_limit: Some(DEFAULT_MEMORY_LIMIT),
            allow_dirs: vec![PathBuf::from(BASELINE_ALLOW_DIR)],
            blocked_modules: DEFAULT_BLOCKED_MODULES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            max_workers: DEFAULT_MAX_WORKERS,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
        }
    }
}

impl ServerConfig {
    /// Create a new config builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TETHER_SOCKET` | `/tmp/tether.sock` |
    /// | `TETHER_TIMEOUT_SECS` | `30` |
    /// | `TETHER_MAX_MESSAGE_BYTES` | `5242880` |
    /// | `TETHER_MEMORY_LIMIT_MB` | `1024` (`0` disables the cap) |
    /// | `TETHER_ALLOW_DIRS` | colon-separated, added after `/tmp` |
    /// | `TETHER_BLOCKED_MODULES` | colon-separated, added to the denylist |
    /// | `TETHER_MAX_WORKERS` | `4` |
    /// | `TETHER_MAX_OUTPUT_BYTES` | `1048576` |
    pub fn from_env() -> Self {
        let default = Self::default();

        let memory_limit = match env_parse::<usize>("TETHER_MEMORY_LIMIT_MB") {
            Some(0) => None,
            Some(mb) => Some(mb.saturating_mul(1024 * 1024)),
            None => default.memory_limit,
        };

        let mut allow_dirs = default.allow_dirs;
        if let Ok(extra) = std::env::var("TETHER_ALLOW_DIRS") {
            allow_dirs.extend(split_list(&extra).map(PathBuf::from));
        }

        let mut blocked_modules = default.blocked_modules;
        if let Ok(extra) = std::env::var("TETHER_BLOCKED_MODULES") {
            blocked_modules.extend(split_list(&extra).map(str::to_string));
        }

        Self {
            socket_path: std::env::var("TETHER_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(default.socket_path),
            timeout: env_parse::<u64>("TETHER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.timeout),
            max_message_size: env_parse("TETHER_MAX_MESSAGE_BYTES")
                .unwrap_or(default.max_message_size),
            memory_limit,
            allow_dirs,
            blocked_modules,
            max_workers: env_parse("TETHER_MAX_WORKERS").unwrap_or(default.max_workers),
            max_output_size: env_parse("TETHER_MAX_OUTPUT_BYTES")
                .unwrap_or(default.max_output_size),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(CoreError::Config("socket_path is required".into()));
        }
        if self.timeout.is_zero() {
            return Err(CoreError::Config("timeout must be > 0".into()));
        }
        if self.max_message_size == 0 {
            return Err(CoreError::Config("max_message_size must be > 0".into()));
        }
        if self.max_message_size > u32::MAX as usize {
            return Err(CoreError::Config(
                "max_message_size must fit in a 4-byte length prefix".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(CoreError::Config("max_workers must be > 0".into()));
        }
        if self.allow_dirs.is_empty() {
            return Err(CoreError::Config("allow_dirs must not be empty".into()));
        }
        Ok(())
    }
}

/// Builder for ServerConfig.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the socket path.
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.socket_path = path.into();
        self
    }

    /// Set the script timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the maximum frame size.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    /// Set (or clear) the interpreter memory cap.
    pub fn memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.config.memory_limit = bytes;
        self
    }

    /// Add a directory to the path allow-list.
    pub fn allow_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.allow_dirs.push(path.into());
        self
    }

    /// Add a module root to the import denylist.
    pub fn block_module(mut self, name: impl Into<String>) -> Self {
        self.config.blocked_modules.push(name.into());
        self
    }

    /// Set the worker pool size.
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    /// Set the captured output cap.
    pub fn max_output_size(mut self, bytes: usize) -> Self {
        self.config.max_output_size = bytes;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ServerConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(':').map(str::trim).filter(|s| !s.is_empty())
}
