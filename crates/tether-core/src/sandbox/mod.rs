//! Sandboxed execution of caller-supplied Lua.
//!
//! Each call to [`Sandbox::execute`] builds a fresh interpreter loaded with
//! only the side-effect-free standard libraries, then runs the chunk against
//! a restricted environment table holding:
//!
//! - the [`builtins`](BUILTINS) (`print`, `range`, `len`, ...),
//! - host handles: `iface`, `project`, `processing`,
//! - `require`, routed through a per-execution [`ImportGate`].
//!
//! Output goes to per-execution buffers and every failure ends up in
//! [`ScriptLog::error`]; `execute` itself never fails.
//!
//! # Limits
//!
//! This is language-level isolation, not a security boundary. Memory is
//! capped through the interpreter allocator. Cancellation and the deadline
//! are checked from an instruction-count hook, so pure Lua loops stop
//! promptly, but a script blocked inside a host call only notices once the
//! call returns.

mod builtins;
mod gate;

pub use builtins::BUILTINS;
pub use gate::{ImportGate, SAFE_MODULES};

use crate::config::ServerConfig;
use crate::guard::PathGuard;
use crate::host::{Feedback, Host};
use crate::output::OutputBuffer;
use crate::registry::RunOutcome;
use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, Table, VmState};
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Instructions between cancellation/deadline checks.
const HOOK_INTERVAL: u32 = 1000;

/// Why a script was stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The deadline passed.
    TimedOut,
    /// The cancellation token fired.
    Cancelled,
}

/// Captured result of one execution.
#[derive(Debug, Clone, Default)]
pub struct ScriptLog {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub interrupted: Option<Interrupt>,
}

impl ScriptLog {
    /// Whether the script ran to completion without error.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl From<ScriptLog> for RunOutcome {
    fn from(log: ScriptLog) -> Self {
        let outcome = match (log.interrupted, log.error) {
            (Some(Interrupt::TimedOut), error) => {
                RunOutcome::timed_out(error.unwrap_or_else(|| "timeout".into()))
            }
            (Some(Interrupt::Cancelled), _) => RunOutcome::cancelled(),
            (None, Some(error)) => RunOutcome::failed(error),
            (None, None) => RunOutcome::finished(None),
        };
        outcome.with_output(log.stdout, log.stderr)
    }
}

/// Executes scripts against a host.
#[derive(Clone)]
pub struct Sandbox {
    host: Arc<dyn Host>,
    guard: PathGuard,
    gate: ImportGate,
    memory_limit: Option<usize>,
    max_output_size: usize,
}

impl Sandbox {
    /// Create a sandbox using the limits and denylist from `config`.
    pub fn new(host: Arc<dyn Host>, guard: PathGuard, config: &ServerConfig) -> Self {
        Self {
            host,
            guard,
            gate: ImportGate::new(config.blocked_modules.iter().cloned()),
            memory_limit: config.memory_limit,
            max_output_size: config.max_output_size,
        }
    }

    /// The import gate applied to every execution.
    pub fn gate(&self) -> &ImportGate {
        &self.gate
    }

    /// Run `code` to completion, cancellation or `timeout`.
    ///
    /// Blocks the calling thread; run it on a worker.
    pub fn execute(
        &self,
        code: &str,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> ScriptLog {
        let stdout = OutputBuffer::new(self.max_output_size);
        let stderr = OutputBuffer::new(self.max_output_size);
        let interrupted = Arc::new(OnceLock::new());
        let start = Instant::now();

        let result = self.run(code, cancel, timeout, &stdout, &stderr, &interrupted);

        let interrupted = interrupted.get().copied();
        let error = match (&result, interrupted) {
            (Ok(()), _) => None,
            (Err(_), Some(Interrupt::TimedOut)) => Some(format!(
                "timeout after {:?}",
                timeout.unwrap_or_default()
            )),
            (Err(_), Some(Interrupt::Cancelled)) => Some("execution cancelled".to_string()),
            (Err(e), None) => Some(describe(e)),
        };

        tracing::debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            failed = error.is_some(),
            interrupted = ?interrupted,
            "Script executed"
        );

        ScriptLog {
            stdout: stdout.contents(),
            stderr: stderr.contents(),
            error,
            interrupted,
        }
    }

    fn run(
        &self,
        code: &str,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
        stdout: &OutputBuffer,
        stderr: &OutputBuffer,
        interrupted: &Arc<OnceLock<Interrupt>>,
    ) -> mlua::Result<()> {
        let lua = Lua::new_with(
            StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
            LuaOptions::default(),
        )?;

        if let Some(limit) = self.memory_limit {
            if let Err(e) = lua.set_memory_limit(limit) {
                tracing::warn!(error = %e, limit, "Could not apply script memory limit");
            }
        }

        let token = cancel.clone();
        let deadline = timeout.map(|t| Instant::now() + t);
        let flag = Arc::clone(interrupted);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
            move |_, _| {
                if token.is_cancelled() {
                    let _ = flag.set(Interrupt::Cancelled);
                    return Err(mlua::Error::runtime("execution cancelled"));
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    let _ = flag.set(Interrupt::TimedOut);
                    return Err(mlua::Error::runtime("execution timed out"));
                }
                Ok(VmState::Continue)
            },
        );

        let env = lua.create_table()?;
        builtins::install(&lua, &env, stdout.clone())?;
        self.gate.install(&lua, &env)?;
        let feedback = Feedback::new(cancel.clone()).with_log(stderr.clone());
        self.install_handles(&lua, &env, feedback)?;

        lua.load(code).set_name("=script").set_environment(env).exec()
    }

    fn install_handles(&self, lua: &Lua, env: &Table, feedback: Feedback) -> mlua::Result<()> {
        let info = self.host.info();
        let iface = lua.create_table()?;
        let name = info.name.clone();
        iface.set("name", lua.create_function(move |_, ()| Ok(name.clone()))?)?;
        let version = info.version;
        iface.set("version", lua.create_function(move |_, ()| Ok(version.clone()))?)?;
        env.set("iface", iface)?;

        let project = lua.create_table()?;
        let host = Arc::clone(&self.host);
        project.set(
            "layers",
            lua.create_function(move |lua, ()| {
                let layers = host.list_layers().map_err(mlua::Error::external)?;
                lua.to_value(&layers)
            })?,
        )?;
        env.set("project", project)?;

        let processing = lua.create_table()?;
        let host = Arc::clone(&self.host);
        processing.set(
            "algorithms",
            lua.create_function(move |lua, ()| {
                let algorithms = host.list_algorithms().map_err(mlua::Error::external)?;
                lua.to_value(&algorithms)
            })?,
        )?;
        let host = Arc::clone(&self.host);
        let guard = self.guard.clone();
        processing.set(
            "run",
            lua.create_function(move |lua, (algorithm, params): (String, Option<mlua::Value>)| {
                let parameters = match params {
                    Some(v) => lua_params(lua, v)?,
                    None => Map::new(),
                };
                guard
                    .check(&parameters)
                    .map_err(|e| mlua::Error::runtime(e.to_string()))?;
                tracing::info!(algorithm = %algorithm, "Script invoking algorithm");
                let output = host
                    .run_algorithm(&algorithm, &parameters, &feedback)
                    .map_err(mlua::Error::external)?;
                lua.to_value(&output)
            })?,
        )?;
        env.set("processing", processing)?;
        Ok(())
    }
}

/// Convert a Lua parameter table to a JSON object; an empty table counts.
fn lua_params(lua: &Lua, value: mlua::Value) -> mlua::Result<Map<String, Value>> {
    match lua.from_value::<Value>(value)? {
        Value::Object(map) => Ok(map),
        Value::Array(items) if items.is_empty() => Ok(Map::new()),
        Value::Null => Ok(Map::new()),
        other => Err(mlua::Error::runtime(format!(
            "algorithm parameters must be a table of named values, got {other}"
        ))),
    }
}

/// Innermost message of an interpreter error, without callback tracebacks.
fn describe(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => describe(cause),
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::MemoryError(msg) => format!("memory limit exceeded: {msg}"),
        mlua::Error::ExternalError(e) => e.to_string(),
        other => other.to_string(),
    }
}
