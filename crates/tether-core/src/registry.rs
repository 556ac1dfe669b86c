//! Run registry: tracks background operations by opaque identifier.
//!
//! # Locking
//!
//! One `tokio::sync::Mutex` guards the whole map. Every status transition
//! (creation, completion, cancellation) happens while holding it. Progress
//! is the exception: workers publish it through a per-run atomic, so
//! [`ProgressHandle::set`] never blocks and is safe from any context. The
//! value is copied into the record when the run leaves `Running`.
//!
//! A record leaves `Running` exactly once; writes to a terminal record are
//! dropped, so a late completion can never overwrite a cancellation (or the
//! other way around) and repeated reads of a finished run are identical.

use crate::error::CoreError;
use crate::host::Feedback;
use crate::pool::WorkerPool;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long a timed-out worker gets to hand back its captured output after
/// its token is cancelled.
pub const TIMEOUT_GRACE: Duration = Duration::from_millis(500);

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a run ID from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    /// Sandboxed script.
    Script,
    /// Host processing algorithm.
    Processing,
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Still executing.
    Running,
    /// Completed normally.
    Finished,
    /// Failed with an error.
    Error,
    /// Exceeded its deadline.
    Timeout,
    /// Cancelled by a client.
    Cancelled,
}

impl RunStatus {
    /// Whether the run has left `Running`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Snapshot of a run as returned by `fetch_log`.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub kind: RunKind,
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    /// Percent complete; only tracked for processing runs.
    pub progress: Option<f64>,
    pub result: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    fn new(run_id: RunId, kind: RunKind) -> Self {
        Self {
            run_id,
            kind,
            status: RunStatus::Running,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            progress: match kind {
                RunKind::Processing => Some(0.0),
                RunKind::Script => None,
            },
            result: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Terminal outcome produced by a unit of work.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    status: RunStatus,
    result: Option<Value>,
    stdout: String,
    stderr: String,
    error: Option<String>,
}

impl RunOutcome {
    /// Normal completion.
    pub fn finished(result: Option<Value>) -> Self {
        Self::terminal(RunStatus::Finished, result, None)
    }

    /// Failure with a message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::terminal(RunStatus::Error, None, Some(error.into()))
    }

    /// The work noticed its deadline passed.
    pub fn timed_out(error: impl Into<String>) -> Self {
        Self::terminal(RunStatus::Timeout, None, Some(error.into()))
    }

    /// The work noticed it was cancelled.
    pub fn cancelled() -> Self {
        Self::terminal(RunStatus::Cancelled, None, None)
    }

    fn terminal(status: RunStatus, result: Option<Value>, error: Option<String>) -> Self {
        Self {
            status,
            result,
            stdout: String::new(),
            stderr: String::new(),
            error,
        }
    }

    /// Attach captured output.
    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Terminal status this outcome records.
    pub fn status(&self) -> RunStatus {
        self.status
    }
}

#[derive(Debug)]
struct RunEntry {
    record: RunRecord,
    cancel: CancellationToken,
    progress: Arc<AtomicU64>,
}

impl RunEntry {
    fn snapshot(&self) -> RunRecord {
        let mut record = self.record.clone();
        if record.status == RunStatus::Running && record.progress.is_some() {
            record.progress = Some(load_progress(&self.progress));
        }
        record
    }

    /// Copy the last published progress into the record before it goes terminal.
    fn freeze_progress(&mut self) {
        if self.record.progress.is_some() {
            self.record.progress = Some(load_progress(&self.progress));
        }
    }
}

fn load_progress(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Acquire))
}

type RunMap = Arc<Mutex<HashMap<RunId, RunEntry>>>;

/// Publishes progress for one run.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    cell: Arc<AtomicU64>,
}

impl ProgressHandle {
    /// Set progress, clamped to 0-100. Updates after the run has ended are
    /// not visible in its record.
    pub fn set(&self, percent: f64) {
        if percent.is_nan() {
            return;
        }
        self.cell
            .store(percent.clamp(0.0, 100.0).to_bits(), Ordering::Release);
    }
}

/// Everything a unit of work gets to observe about its run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The run being executed.
    pub id: RunId,
    /// Triggered on cancellation or timeout.
    pub cancel: CancellationToken,
    /// Progress sink for the run.
    pub progress: ProgressHandle,
}

impl RunContext {
    /// Host feedback wired to this run's cancellation and progress.
    pub fn feedback(&self) -> Feedback {
        Feedback::new(self.cancel.clone()).with_progress(self.progress.clone())
    }
}

/// A run that has been registered and scheduled.
#[derive(Debug)]
pub struct StartedRun {
    /// Identifier of the new run.
    pub id: RunId,
    handle: JoinHandle<()>,
}

impl StartedRun {
    /// Wait until the run's record has reached a terminal state.
    pub async fn wait(self) -> Result<RunId, CoreError> {
        self.handle
            .await
            .map_err(|e| CoreError::Worker(e.to_string()))?;
        Ok(self.id)
    }
}

enum Completion {
    Outcome(RunOutcome),
    Failed(String),
    /// Deadline passed; carries whatever the worker returned within the grace.
    TimedOut(Duration, Option<RunOutcome>),
    Cancelled,
}

/// Concurrent store mapping run identifiers to run state.
///
/// Records are kept for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct RunRegistry {
    runs: RunMap,
    pool: WorkerPool,
}

impl RunRegistry {
    /// Create an empty registry executing work on `pool`.
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            runs: Arc::new(Mutex::new(HashMap::new())),
            pool,
        }
    }

    /// Register a run and schedule `work` on the worker pool.
    ///
    /// The record exists (as `running`) before this returns. With a
    /// `timeout`, a run still going at the deadline has its cancellation
    /// token triggered and is recorded as `timeout`, keeping the output the
    /// worker returns within [`TIMEOUT_GRACE`].
    pub async fn start<F>(&self, kind: RunKind, timeout: Option<Duration>, work: F) -> StartedRun
    where
        F: FnOnce(RunContext) -> RunOutcome + Send + 'static,
    {
        let id = RunId::new();
        let cancel = CancellationToken::new();
        let progress = Arc::new(AtomicU64::new(0f64.to_bits()));

        {
            let mut runs = self.runs.lock().await;
            runs.insert(
                id,
                RunEntry {
                    record: RunRecord::new(id, kind),
                    cancel: cancel.clone(),
                    progress: Arc::clone(&progress),
                },
            );
        }
        tracing::info!(run_id = %id, kind = ?kind, "Run started");

        let ctx = RunContext {
            id,
            cancel: cancel.clone(),
            progress: ProgressHandle { cell: progress },
        };
        let runs = Arc::clone(&self.runs);
        let pool = self.pool.clone();

        let handle = tokio::spawn(async move {
            let start = std::time::Instant::now();
            let mut job = std::pin::pin!(pool.run(move || work(ctx)));

            let completion = tokio::select! {
                _ = cancel.cancelled() => Completion::Cancelled,
                result = with_deadline(timeout, job.as_mut()) => match result {
                    Some(Ok(outcome)) => Completion::Outcome(outcome),
                    Some(Err(e)) => Completion::Failed(e.to_string()),
                    None => {
                        cancel.cancel();
                        let partial = match tokio::time::timeout(TIMEOUT_GRACE, job).await {
                            Ok(Ok(outcome)) => Some(outcome),
                            _ => {
                                tracing::warn!(run_id = %id, "Worker did not stop within grace period");
                                None
                            }
                        };
                        Completion::TimedOut(timeout.unwrap_or_default(), partial)
                    }
                },
            };

            Self::complete(&runs, id, completion).await;
            tracing::debug!(
                run_id = %id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Run supervisor exited"
            );
        });

        StartedRun { id, handle }
    }

    /// Snapshot of a run.
    pub async fn get(&self, id: RunId) -> Option<RunRecord> {
        let runs = self.runs.lock().await;
        runs.get(&id).map(RunEntry::snapshot)
    }

    /// Snapshot of a run by its string id; unparsable ids are simply absent.
    pub async fn get_str(&self, id: &str) -> Option<RunRecord> {
        match RunId::parse(id) {
            Some(id) => self.get(id).await,
            None => None,
        }
    }

    /// Request cancellation of a run.
    ///
    /// A running run becomes `cancelled`; a finished one keeps (and reports)
    /// its final status.
    pub async fn cancel(&self, id: RunId) -> Result<RunStatus, CoreError> {
        let mut runs = self.runs.lock().await;
        let entry = runs.get_mut(&id).ok_or(CoreError::RunNotFound)?;

        if entry.record.status.is_terminal() {
            tracing::debug!(run_id = %id, status = %entry.record.status, "Cancel on finished run");
            return Ok(entry.record.status);
        }

        entry.freeze_progress();
        entry.record.status = RunStatus::Cancelled;
        entry.record.finished_at = Some(Utc::now());
        entry.cancel.cancel();
        tracing::info!(run_id = %id, "Run cancelled");
        Ok(RunStatus::Cancelled)
    }

    /// Request cancellation of a run by its string id.
    pub async fn cancel_str(&self, id: &str) -> Result<RunStatus, CoreError> {
        let id = RunId::parse(id).ok_or(CoreError::RunNotFound)?;
        self.cancel(id).await
    }

    /// Number of runs recorded so far.
    pub async fn len(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Whether no run was ever started.
    pub async fn is_empty(&self) -> bool {
        self.runs.lock().await.is_empty()
    }

    async fn complete(runs: &RunMap, id: RunId, completion: Completion) {
        let mut runs = runs.lock().await;
        let Some(entry) = runs.get_mut(&id) else {
            return;
        };
        if entry.record.status.is_terminal() {
            tracing::debug!(run_id = %id, status = %entry.record.status, "Dropping late completion");
            return;
        }
        entry.freeze_progress();
        let record = &mut entry.record;

        match completion {
            Completion::Outcome(outcome) => {
                record.status = outcome.status;
                if outcome.status == RunStatus::Finished {
                    record.result = outcome.result;
                }
                record.stdout = outcome.stdout;
                record.stderr = outcome.stderr;
                record.error = outcome.error;
            }
            Completion::Failed(message) => {
                record.status = RunStatus::Error;
                record.error = Some(message);
            }
            Completion::TimedOut(limit, partial) => {
                record.status = RunStatus::Timeout;
                record.error = Some(format!("timeout after {limit:?}"));
                if let Some(outcome) = partial {
                    record.stdout = outcome.stdout;
                    record.stderr = outcome.stderr;
                }
            }
            Completion::Cancelled => {
                record.status = RunStatus::Cancelled;
            }
        }

        if record.kind == RunKind::Processing && record.status == RunStatus::Finished {
            record.progress = Some(100.0);
        }
        record.finished_at = Some(Utc::now());

        match record.status {
            RunStatus::Finished => tracing::info!(run_id = %id, "Run finished"),
            status => tracing::warn!(run_id = %id, %status, error = ?record.error, "Run ended"),
        }
    }
}

async fn with_deadline<F: Future>(timeout: Option<Duration>, fut: F) -> Option<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> RunRegistry {
        RunRegistry::new(WorkerPool::new(4))
    }

    fn wait_for_cancel(ctx: &RunContext) {
        while !ctx.cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_run_id_display() {
        let id = RunId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 36);
        assert_eq!(RunId::parse(&s), Some(id));
        assert_eq!(RunId::parse("not-a-uuid"), None);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_value(RunStatus::Timeout).unwrap(), json!("timeout"));
        assert_eq!(RunStatus::Cancelled.to_string(), "cancelled");
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Error.is_terminal());
    }

    #[tokio::test]
    async fn test_run_finishes_with_result() {
        let registry = registry();
        let started = registry
            .start(RunKind::Processing, None, |_| {
                RunOutcome::finished(Some(json!({"OUTPUT": "/tmp/out.gpkg"})))
            })
            .await;
        let id = started.wait().await.unwrap();

        let record = registry.get(id).await.unwrap();
        assert_eq!(record.status, RunStatus::Finished);
        assert_eq!(record.result, Some(json!({"OUTPUT": "/tmp/out.gpkg"})));
        assert_eq!(record.progress, Some(100.0));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_run_error_keeps_output() {
        let registry = registry();
        let started = registry
            .start(RunKind::Script, None, |_| {
                RunOutcome::failed("boom").with_output("partial\n".into(), String::new())
            })
            .await;
        let id = started.wait().await.unwrap();

        let record = registry.get(id).await.unwrap();
        assert_eq!(record.status, RunStatus::Error);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert_eq!(record.stdout, "partial\n");
        assert!(record.result.is_none());
        assert!(record.progress.is_none());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let registry = registry();
        assert!(registry.get(RunId::new()).await.is_none());
        assert!(registry.get_str("garbage").await.is_none());
        assert!(matches!(
            registry.cancel(RunId::new()).await,
            Err(CoreError::RunNotFound)
        ));
        assert!(matches!(
            registry.cancel_str("garbage").await,
            Err(CoreError::RunNotFound)
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_run() {
        let registry = registry();
        let started = registry
            .start(RunKind::Processing, None, |ctx| {
                wait_for_cancel(&ctx);
                RunOutcome::finished(Some(json!("too late")))
            })
            .await;
        let id = started.id;

        assert_eq!(registry.cancel(id).await.unwrap(), RunStatus::Cancelled);
        started.wait().await.unwrap();

        let record = registry.get(id).await.unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn test_cancel_finished_run_is_noop() {
        let registry = registry();
        let id = registry
            .start(RunKind::Processing, None, |_| RunOutcome::finished(None))
            .await
            .wait()
            .await
            .unwrap();

        assert_eq!(registry.cancel(id).await.unwrap(), RunStatus::Finished);
        assert_eq!(registry.get(id).await.unwrap().status, RunStatus::Finished);
    }

    #[tokio::test]
    async fn test_timeout_marks_record_and_cancels_worker() {
        let registry = registry();
        let (tx, rx) = std::sync::mpsc::channel();
        let started = registry
            .start(RunKind::Script, Some(Duration::from_millis(50)), move |ctx| {
                wait_for_cancel(&ctx);
                let _ = tx.send(());
                RunOutcome::cancelled()
            })
            .await;
        let id = started.wait().await.unwrap();

        let record = registry.get(id).await.unwrap();
        assert_eq!(record.status, RunStatus::Timeout);
        assert_eq!(record.error.as_deref(), Some("timeout after 50ms"));

        // The worker observes the token and returns.
        let observed = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(observed.is_ok());
        // Its late outcome does not overwrite the timeout.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.get(id).await.unwrap().status, RunStatus::Timeout);
    }

    #[tokio::test]
    async fn test_timeout_keeps_worker_output() {
        let registry = registry();
        let started = registry
            .start(RunKind::Script, Some(Duration::from_millis(50)), |ctx| {
                wait_for_cancel(&ctx);
                RunOutcome::timed_out("execution timed out")
                    .with_output("started\n".into(), "warming up\n".into())
            })
            .await;
        let id = started.wait().await.unwrap();

        let record = registry.get(id).await.unwrap();
        assert_eq!(record.status, RunStatus::Timeout);
        assert_eq!(record.error.as_deref(), Some("timeout after 50ms"));
        assert_eq!(record.stdout, "started\n");
        assert_eq!(record.stderr, "warming up\n");
    }

    #[tokio::test]
    async fn test_timeout_without_cooperating_worker() {
        let registry = registry();
        let started = registry
            .start(RunKind::Script, Some(Duration::from_millis(20)), |_| {
                std::thread::sleep(TIMEOUT_GRACE + Duration::from_millis(300));
                RunOutcome::finished(None).with_output("late\n".into(), String::new())
            })
            .await;
        let id = started.wait().await.unwrap();

        let record = registry.get(id).await.unwrap();
        assert_eq!(record.status, RunStatus::Timeout);
        assert!(record.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_progress_updates_while_running() {
        let registry = registry();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let started = registry
            .start(RunKind::Processing, None, move |ctx| {
                ctx.feedback().set_progress(40.0);
                let _ = tx.send(());
                wait_for_cancel(&ctx);
                RunOutcome::cancelled()
            })
            .await;
        rx.await.unwrap();

        let record = registry.get(started.id).await.unwrap();
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.progress, Some(40.0));

        registry.cancel(started.id).await.unwrap();
        let id = started.wait().await.unwrap();
        assert_eq!(registry.get(id).await.unwrap().progress, Some(40.0));
    }

    #[tokio::test]
    async fn test_progress_from_async_context() {
        let registry = registry();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let started = registry
            .start(RunKind::Processing, None, move |ctx| {
                let _ = tx.send(ctx.progress.clone());
                wait_for_cancel(&ctx);
                RunOutcome::cancelled()
            })
            .await;
        let progress = rx.await.unwrap();

        progress.set(250.0);
        assert_eq!(registry.get(started.id).await.unwrap().progress, Some(100.0));
        progress.set(f64::NAN);
        progress.set(-3.0);
        assert_eq!(registry.get(started.id).await.unwrap().progress, Some(0.0));

        registry.cancel(started.id).await.unwrap();
        progress.set(75.0);
        assert_eq!(registry.get(started.id).await.unwrap().progress, Some(0.0));
        started.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_snapshot_is_stable() {
        let registry = registry();
        let id = registry
            .start(RunKind::Script, None, |_| {
                RunOutcome::finished(None).with_output("hi\n".into(), String::new())
            })
            .await
            .wait()
            .await
            .unwrap();

        let first = serde_json::to_value(registry.get(id).await.unwrap()).unwrap();
        let second = serde_json::to_value(registry.get(id).await.unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_completion_race_is_consistent() {
        let registry = registry();
        let mut ids = Vec::new();

        for i in 0..50 {
            let started = registry
                .start(RunKind::Processing, None, move |_| {
                    RunOutcome::finished(Some(json!(i)))
                })
                .await;
            let id = started.id;
            let reg = registry.clone();
            let canceller = tokio::spawn(async move { reg.cancel(id).await });
            canceller.await.unwrap().unwrap();
            started.wait().await.unwrap();
            ids.push(id);
        }

        for id in ids {
            let record = registry.get(id).await.unwrap();
            match record.status {
                RunStatus::Finished => assert!(record.result.is_some()),
                RunStatus::Cancelled => assert!(record.result.is_none()),
                other => panic!("unexpected status {other}"),
            }
            assert!(record.finished_at.is_some());
        }
    }
}
