//! Discovery tables advertised by `list_tools` and `list_resources`.

use crate::protocol::{NoParams, RunIdParams, RunProcessingParams, RunScriptParams};
use schemars::{schema_for, JsonSchema};
use serde::Serialize;
use serde_json::{json, Value};

/// A tool description.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    /// Method name.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// JSON Schema of the parameters.
    pub input_schema: Value,
}

/// A resource description.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSpec {
    /// Resource name.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Method that produces the resource.
    pub provider: &'static str,
    /// JSON Schema of the produced value.
    pub schema: Value,
}

/// Convert a schemars root schema into a plain JSON object.
fn schema_value<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    serde_json::to_value(&schema.schema).unwrap_or_else(|_| json!({"type": "object"}))
}

/// Build the list of available tools.
pub fn tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "list_tools",
            description: "List available tools and their schemas.",
            input_schema: schema_value::<NoParams>(),
        },
        ToolSpec {
            name: "list_resources",
            description: "List available resources (layers, algorithms).",
            input_schema: schema_value::<NoParams>(),
        },
        ToolSpec {
            name: "list_layers",
            description: "List project layers (id, name, type, crs).",
            input_schema: schema_value::<NoParams>(),
        },
        ToolSpec {
            name: "list_algorithms",
            description: "List processing algorithms (id, name, provider).",
            input_schema: schema_value::<NoParams>(),
        },
        ToolSpec {
            name: "run_processing",
            description: "Run a processing algorithm, optionally in the background.",
            input_schema: schema_value::<RunProcessingParams>(),
        },
        ToolSpec {
            name: "run_script",
            description: "Run sandboxed Lua code with stdout/stderr capture.",
            input_schema: schema_value::<RunScriptParams>(),
        },
        ToolSpec {
            name: "fetch_log",
            description: "Fetch status, stdout/stderr, error, progress and result by run_id.",
            input_schema: schema_value::<RunIdParams>(),
        },
        ToolSpec {
            name: "cancel_run",
            description: "Cancel a running job by run_id.",
            input_schema: schema_value::<RunIdParams>(),
        },
    ]
}

/// Build the list of available resources.
pub fn resources() -> Vec<ResourceSpec> {
    vec![
        ResourceSpec {
            name: "layers",
            description: "Current project layers",
            provider: "list_layers",
            schema: json!({
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "name": {"type": "string"},
                        "type": {"type": "string"},
                        "crs": {"type": ["string", "null"]}
                    }
                }
            }),
        },
        ResourceSpec {
            name: "algorithms",
            description: "Available processing algorithms",
            provider: "list_algorithms",
            schema: json!({
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "name": {"type": "string"},
                        "provider": {"type": "string"}
                    }
                }
            }),
        },
    ]
}
