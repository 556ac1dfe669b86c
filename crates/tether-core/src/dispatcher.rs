//! Request dispatcher.
//!
//! Routes a decoded request to its handler and shapes the response envelope.
//! Handlers return `Result<Value, CoreError>`; every error is converted into
//! `{error}` here, so nothing escapes [`Dispatcher::dispatch`].

use crate::config::ServerConfig;
use crate::error::CoreError;
use crate::guard::PathGuard;
use crate::host::{Feedback, Host};
use crate::output::OutputBuffer;
use crate::pool::WorkerPool;
use crate::protocol::{Method, Request, Response, RunIdParams, RunProcessingParams, RunScriptParams};
use crate::registry::{RunKind, RunOutcome, RunRegistry};
use crate::sandbox::Sandbox;
use crate::schema;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Maximum length of script source echoed into logs.
const MAX_LOG_CODE_LEN: usize = 200;

/// Maps methods to handlers.
#[derive(Clone)]
pub struct Dispatcher {
    host: Arc<dyn Host>,
    guard: PathGuard,
    pool: WorkerPool,
    registry: RunRegistry,
    sandbox: Sandbox,
    timeout: Duration,
    max_output_size: usize,
}

impl Dispatcher {
    /// Build a dispatcher (guard, worker pool, registry, sandbox) from `config`.
    pub fn new(config: &ServerConfig, host: Arc<dyn Host>) -> Self {
        let guard = PathGuard::new(&config.allow_dirs);
        let pool = WorkerPool::new(config.max_workers);
        let registry = RunRegistry::new(pool.clone());
        let sandbox = Sandbox::new(Arc::clone(&host), guard.clone(), config);

        Self {
            host,
            guard,
            pool,
            registry,
            sandbox,
            timeout: config.timeout,
            max_output_size: config.max_output_size,
        }
    }

    /// The run registry backing `fetch_log` and `cancel_run`.
    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// The worker pool used for blocking work.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Decode a frame body and dispatch it.
    ///
    /// A body that is not a request envelope yields `{error}`.
    pub async fn dispatch_bytes(&self, body: &[u8]) -> Response {
        match Request::from_slice(body) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                warn!(error = %e, bytes = body.len(), "Undecodable request");
                e.into()
            }
        }
    }

    /// Handle a request; always produces exactly one of `{result}` or `{error}`.
    pub async fn dispatch(&self, request: Request) -> Response {
        let start = Instant::now();
        trace!(params = ?request.params, "Request params");

        let method = match Method::parse(&request.method, request.params) {
            Ok(method) => method,
            Err(e) => {
                warn!(method = %truncate_for_log(&request.method, 64), error = %e, "Rejected request");
                return e.into();
            }
        };
        let name = method.name();

        let result = match method {
            Method::ListTools => to_value(schema::tools()),
            Method::ListResources => to_value(schema::resources()),
            Method::ListLayers => self.handle_list_layers().await,
            Method::ListAlgorithms => self.handle_list_algorithms().await,
            Method::RunProcessing(p) => self.handle_run_processing(p).await,
            Method::RunScript(p) => self.handle_run_script(p).await,
            Method::FetchLog(p) => self.handle_fetch_log(p).await,
            Method::CancelRun(p) => self.handle_cancel_run(p).await,
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(value) => {
                debug!(method = name, elapsed_ms, "Request succeeded");
                Response::success(value)
            }
            Err(e) => {
                debug!(method = name, elapsed_ms, error = %e, "Request failed");
                e.into()
            }
        }
    }

    async fn handle_list_layers(&self) -> Result<Value, CoreError> {
        let host = Arc::clone(&self.host);
        let layers = self.pool.run(move || host.list_layers()).await??;
        to_value(layers)
    }

    async fn handle_list_algorithms(&self) -> Result<Value, CoreError> {
        let host = Arc::clone(&self.host);
        let algorithms = self.pool.run(move || host.list_algorithms()).await??;
        to_value(algorithms)
    }

    async fn handle_run_processing(&self, p: RunProcessingParams) -> Result<Value, CoreError> {
        self.guard.check(&p.parameters)?;
        info!(algorithm = %p.algorithm, background = p.background, "Running algorithm");

        let host = Arc::clone(&self.host);
        let RunProcessingParams {
            algorithm,
            parameters,
            background,
        } = p;

        if !background {
            let output = self
                .pool
                .run(move || host.run_algorithm(&algorithm, &parameters, &Feedback::detached()))
                .await??;
            return Ok(output);
        }

        let max_output_size = self.max_output_size;
        let started = self
            .registry
            .start(RunKind::Processing, None, move |ctx| {
                let messages = OutputBuffer::new(max_output_size);
                let feedback = ctx.feedback().with_log(messages.clone());
                let outcome = match host.run_algorithm(&algorithm, &parameters, &feedback) {
                    Ok(_) if ctx.cancel.is_cancelled() => RunOutcome::cancelled(),
                    Ok(output) => RunOutcome::finished(Some(output)),
                    Err(e) => RunOutcome::failed(e.to_string()),
                };
                outcome.with_output(String::new(), messages.contents())
            })
            .await;

        Ok(json!({"run_id": started.id, "status": "running"}))
    }

    async fn handle_run_script(&self, p: RunScriptParams) -> Result<Value, CoreError> {
        info!(
            background = p.background,
            code = %truncate_for_log(&p.code, MAX_LOG_CODE_LEN),
            "Running script"
        );

        let sandbox = self.sandbox.clone();
        let timeout = self.timeout;
        let code = p.code;
        let started = self
            .registry
            .start(RunKind::Script, Some(timeout), move |ctx| {
                sandbox.execute(&code, &ctx.cancel, Some(timeout)).into()
            })
            .await;

        if p.background {
            return Ok(json!({"run_id": started.id, "status": "running"}));
        }

        let id = started.wait().await?;
        to_value(self.registry.get(id).await.ok_or(CoreError::RunNotFound)?)
    }

    async fn handle_fetch_log(&self, p: RunIdParams) -> Result<Value, CoreError> {
        let id = p.require()?;
        to_value(self.registry.get_str(id).await)
    }

    async fn handle_cancel_run(&self, p: RunIdParams) -> Result<Value, CoreError> {
        let id = p.require()?;
        let status = self.registry.cancel_str(id).await?;
        Ok(json!({"run_id": id, "status": status}))
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, CoreError> {
    Ok(serde_json::to_value(value)?)
}

/// Truncate a string for logging, keeping UTF-8 intact.
fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes total)", &s[..end], s.len())
}
