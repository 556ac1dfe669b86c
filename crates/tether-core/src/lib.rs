//! # tether-core
//!
//! Remote-control core for a host application: a local socket server that
//! lets external clients enumerate the host's resources, run its processing
//! algorithms, and execute sandboxed Lua against it.
//!
//! ## Architecture
//!
//! ```text
//! client ──frame──▶ Server ──▶ Dispatcher ──┬──▶ PathGuard
//!                                           ├──▶ RunRegistry ──▶ WorkerPool
//!                                           ├──▶ Sandbox (Lua, ImportGate)
//!                                           └──▶ Host (capability trait)
//! client ◀──frame── Server ◀── {result} | {error}
//! ```
//!
//! - Every connection carries one request frame and one response frame
//!   (4-byte big-endian length + JSON).
//! - Blocking work (scripts, host calls) runs on a bounded [`WorkerPool`];
//!   the accept loop never blocks.
//! - Background work is tracked in the [`RunRegistry`]; clients poll
//!   `fetch_log` and may `cancel_run`.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_core::{Server, ServerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(host: Arc<dyn tether_core::Host>) -> tether_core::Result<()> {
//! let config = ServerConfig::builder()
//!     .socket_path("/tmp/tether.sock")
//!     .allow_dir("/data/gis")
//!     .build()?;
//!
//! let shutdown = CancellationToken::new();
//! Server::bind(config, host)?.serve(shutdown).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Methods
//!
//! `list_tools`, `list_resources`, `list_layers`, `list_algorithms`,
//! `run_processing`, `run_script`, `fetch_log`, `cancel_run`.

mod config;
mod dispatcher;
mod error;
mod guard;
mod host;
mod output;
mod pool;
mod protocol;
mod registry;
mod sandbox;
mod schema;
mod server;
pub mod transport;

pub use config::{
    ServerConfig, ServerConfigBuilder, BASELINE_ALLOW_DIR, DEFAULT_BLOCKED_MODULES,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_SOCKET_PATH, DEFAULT_TIMEOUT,
};
pub use dispatcher::Dispatcher;
pub use error::{CoreError, Result};
pub use guard::{looks_like_path, PathGuard, PATH_EXTENSIONS};
pub use host::{AlgorithmInfo, Feedback, Host, HostError, HostInfo, LayerInfo};
pub use output::OutputBuffer;
pub use pool::{PoolStats, WorkerPool};
pub use protocol::{
    Method, NoParams, Request, Response, RunIdParams, RunProcessingParams, RunScriptParams,
};
pub use registry::{
    ProgressHandle, RunContext, RunId, RunKind, RunOutcome, RunRecord, RunRegistry, RunStatus,
    StartedRun,
};
pub use sandbox::{ImportGate, Interrupt, Sandbox, ScriptLog, BUILTINS, SAFE_MODULES};
pub use schema::{resources, tools, ResourceSpec, ToolSpec};
pub use server::Server;
pub use transport::Client;
