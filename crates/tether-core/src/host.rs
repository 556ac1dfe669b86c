//! Capability interface to the host application.
//!
//! tether never implements domain operations itself. The embedding
//! application supplies a [`Host`]; every call into it happens on a blocking
//! worker, so implementations are free to block.

use crate::output::OutputBuffer;
use crate::registry::ProgressHandle;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure reported by the host application.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HostError {
    message: String,
}

impl HostError {
    /// Create a host error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Identification of the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
}

/// A layer in the host's current project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    /// Stable layer identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Layer kind (e.g. `vector`, `raster`).
    #[serde(rename = "type")]
    pub layer_type: String,
    /// Authority identifier of the layer CRS, if any.
    #[serde(default)]
    pub crs: Option<String>,
}

/// An algorithm in the host's processing registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmInfo {
    /// Algorithm identifier, e.g. `native:buffer`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Identifier of the providing plugin.
    pub provider: String,
}

/// Operations the host application exposes to tether.
pub trait Host: Send + Sync + 'static {
    /// Name and version of the host application.
    fn info(&self) -> HostInfo;

    /// Layers of the current project, in project order.
    fn list_layers(&self) -> Result<Vec<LayerInfo>, HostError>;

    /// Algorithms known to the processing registry.
    fn list_algorithms(&self) -> Result<Vec<AlgorithmInfo>, HostError>;

    /// Run an algorithm to completion.
    ///
    /// Long-running implementations should poll [`Feedback::is_canceled`]
    /// and report progress through [`Feedback::set_progress`].
    fn run_algorithm(
        &self,
        algorithm: &str,
        parameters: &Map<String, Value>,
        feedback: &Feedback,
    ) -> Result<Value, HostError>;
}

/// Channel from a running host operation back to tether.
///
/// Carries the cancellation request for the operation and, when the
/// operation is tracked as a run, a progress sink and a message log.
#[derive(Debug, Clone)]
pub struct Feedback {
    cancel: CancellationToken,
    progress: Option<ProgressHandle>,
    log: Option<OutputBuffer>,
}

impl Feedback {
    /// Feedback observing the given cancellation token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: None,
            log: None,
        }
    }

    /// Feedback for an untracked operation that can never be cancelled.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Route progress updates into a run record.
    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Route informational messages into a buffer.
    pub fn with_log(mut self, log: OutputBuffer) -> Self {
        self.log = Some(log);
        self
    }

    /// Whether cancellation of the operation was requested.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The underlying cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Report completion percentage (0-100). Ignored for untracked operations.
    pub fn set_progress(&self, percent: f64) {
        if let Some(progress) = &self.progress {
            progress.set(percent);
        }
    }

    /// Record an informational message.
    pub fn push_info(&self, message: &str) {
        tracing::trace!(message = %message, "Host feedback");
        if let Some(log) = &self.log {
            log.push_line(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_layer_info_serializes_type_key() {
        let layer = LayerInfo {
            id: "roads_1".into(),
            name: "Roads".into(),
            layer_type: "vector".into(),
            crs: Some("EPSG:4326".into()),
        };
        assert_eq!(
            serde_json::to_value(&layer).unwrap(),
            json!({"id": "roads_1", "name": "Roads", "type": "vector", "crs": "EPSG:4326"})
        );
    }

    #[test]
    fn test_feedback_cancellation() {
        let token = CancellationToken::new();
        let feedback = Feedback::new(token.clone());
        assert!(!feedback.is_canceled());
        token.cancel();
        assert!(feedback.is_canceled());
    }

    #[test]
    fn test_feedback_log() {
        let log = OutputBuffer::new(1024);
        let feedback = Feedback::detached().with_log(log.clone());
        feedback.push_info("step 1");
        feedback.set_progress(50.0);
        assert_eq!(log.contents(), "step 1\n");
    }
}
