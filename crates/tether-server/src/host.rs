//! Manifest-backed development host.
//!
//! Stands in for a real host application: layers and algorithms come from a
//! JSON manifest, and running an algorithm echoes its inputs back after an
//! optional simulated duration.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;
use tether_core::{AlgorithmInfo, Feedback, Host, HostError, HostInfo, LayerInfo};

/// Progress steps reported while simulating work.
const PROGRESS_STEPS: u64 = 10;

/// An algorithm entry in the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestAlgorithm {
    #[serde(flatten)]
    pub info: AlgorithmInfo,

    /// Simulated run time in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

/// Contents of `TETHER_HOST_MANIFEST`.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub layers: Vec<LayerInfo>,
    #[serde(default)]
    pub algorithms: Vec<ManifestAlgorithm>,
}

fn default_name() -> String {
    "tether-server".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            layers: Vec::new(),
            algorithms: vec![ManifestAlgorithm {
                info: AlgorithmInfo {
                    id: "tether:echo".into(),
                    name: "Echo parameters".into(),
                    provider: "tether".into(),
                },
                duration_ms: 0,
            }],
        }
    }
}

/// Host whose contents are fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticHost {
    manifest: Manifest,
}

impl StaticHost {
    /// Create a host from an in-memory manifest.
    pub fn new(manifest: Manifest) -> Self {
        Self { manifest }
    }

    /// Load a manifest file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading manifest {}: {e}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing manifest {}: {e}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            layers = manifest.layers.len(),
            algorithms = manifest.algorithms.len(),
            "Loaded host manifest"
        );
        Ok(Self::new(manifest))
    }
}

impl Host for StaticHost {
    fn info(&self) -> HostInfo {
        HostInfo {
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
        }
    }

    fn list_layers(&self) -> Result<Vec<LayerInfo>, HostError> {
        Ok(self.manifest.layers.clone())
    }

    fn list_algorithms(&self) -> Result<Vec<AlgorithmInfo>, HostError> {
        Ok(self
            .manifest
            .algorithms
            .iter()
            .map(|a| a.info.clone())
            .collect())
    }

    fn run_algorithm(
        &self,
        algorithm: &str,
        parameters: &Map<String, Value>,
        feedback: &Feedback,
    ) -> Result<Value, HostError> {
        let entry = self
            .manifest
            .algorithms
            .iter()
            .find(|a| a.info.id == algorithm)
            .ok_or_else(|| HostError::new(format!("Algorithm not found: {algorithm}")))?;

        feedback.push_info(&format!("Running {}", entry.info.name));
        let step = Duration::from_millis(entry.duration_ms / PROGRESS_STEPS);
        for i in 1..=PROGRESS_STEPS {
            if feedback.is_canceled() {
                return Err(HostError::new("Algorithm canceled"));
            }
            if !step.is_zero() {
                std::thread::sleep(step);
            }
            feedback.set_progress((i * 100 / PROGRESS_STEPS) as f64);
        }

        Ok(json!({"algorithm": algorithm, "parameters": parameters}))
    }
}
