//! Wire envelopes and typed method parameters.
//!
//! A request is `{method, params}`; a response is exactly one of
//! `{result}` or `{error}`. Incoming method names are parsed into the closed
//! [`Method`] enum so the dispatcher can match on it exhaustively.

use crate::error::CoreError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Method name to invoke.
    pub method: String,
    /// Method parameters; absent or `null` means "no parameters".
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    /// Create a request with the given method and parameters.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Decode a request from a frame body.
    pub fn from_slice(body: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(body).map_err(|e| CoreError::InvalidRequest(e.to_string()))
    }
}

/// Response envelope.
///
/// Serializes as `{"result": ...}` or `{"error": "..."}`; never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    /// Successful outcome.
    Result(Value),
    /// Failure message.
    Error(String),
}

impl Response {
    /// Create a success response.
    pub fn success(result: Value) -> Self {
        Self::Result(result)
    }

    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Serialize a value into a success response.
    pub fn json<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(v) => Self::Result(v),
            Err(e) => Self::Error(format!("JSON serialization error: {e}")),
        }
    }

    /// Returns `true` for an `{error}` response.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The result payload, if any.
    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Result(v) => Some(v),
            Self::Error(_) => None,
        }
    }

    /// The error message, if any.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Result(_) => None,
            Self::Error(e) => Some(e),
        }
    }
}

impl From<CoreError> for Response {
    fn from(err: CoreError) -> Self {
        Self::Error(err.to_string())
    }
}

impl<T: Serialize> From<Result<T, CoreError>> for Response {
    fn from(result: Result<T, CoreError>) -> Self {
        match result {
            Ok(v) => Self::json(&v),
            Err(e) => e.into(),
        }
    }
}

// ============================================================================
// Method parameters
// ============================================================================

/// Parameters for `run_processing`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RunProcessingParams {
    /// Algorithm identifier, e.g. `native:buffer`.
    pub algorithm: String,

    /// Algorithm parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,

    /// Start in the background and return a run_id immediately.
    #[serde(default, rename = "async")]
    pub background: bool,
}

/// Parameters for `run_script`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RunScriptParams {
    /// Lua source to execute in the sandbox.
    pub code: String,

    /// Start in the background and return a run_id immediately.
    #[serde(default, rename = "async")]
    pub background: bool,
}

/// Parameters for `fetch_log` and `cancel_run`.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct RunIdParams {
    /// Identifier returned when the run was started.
    #[serde(default)]
    pub run_id: Option<String>,
}

impl RunIdParams {
    /// The run id, or [`CoreError::MissingRunId`].
    pub fn require(&self) -> Result<&str, CoreError> {
        match self.run_id.as_deref() {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(CoreError::MissingRunId),
        }
    }
}

/// Parameters for methods that take none.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct NoParams {}

// ============================================================================
// Methods
// ============================================================================

/// Every method the dispatcher understands, with its typed parameters.
#[derive(Debug, Clone)]
pub enum Method {
    ListTools,
    ListResources,
    ListLayers,
    ListAlgorithms,
    RunProcessing(RunProcessingParams),
    RunScript(RunScriptParams),
    FetchLog(RunIdParams),
    CancelRun(RunIdParams),
}

impl Method {
    /// Wire names of all methods, in advertised order.
    pub const NAMES: [&'static str; 8] = [
        "list_tools",
        "list_resources",
        "list_layers",
        "list_algorithms",
        "run_processing",
        "run_script",
        "fetch_log",
        "cancel_run",
    ];

    /// Parse a method name and its raw parameters.
    pub fn parse(name: &str, params: Value) -> Result<Self, CoreError> {
        let params = match params {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        let method = match name {
            "list_tools" => Self::ListTools,
            "list_resources" => Self::ListResources,
            "list_layers" => Self::ListLayers,
            "list_algorithms" => Self::ListAlgorithms,
            "run_processing" => Self::RunProcessing(decode(params)?),
            "run_script" => Self::RunScript(decode(params)?),
            "fetch_log" => Self::FetchLog(decode(params)?),
            "cancel_run" => Self::CancelRun(decode(params)?),
            _ => return Err(CoreError::UnknownMethod),
        };
        Ok(method)
    }

    /// Wire name of this method.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListTools => "list_tools",
            Self::ListResources => "list_resources",
            Self::ListLayers => "list_layers",
            Self::ListAlgorithms => "list_algorithms",
            Self::RunProcessing(_) => "run_processing",
            Self::RunScript(_) => "run_script",
            Self::FetchLog(_) => "fetch_log",
            Self::CancelRun(_) => "cancel_run",
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, CoreError> {
    serde_json::from_value(params).map_err(|e| CoreError::InvalidParams(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_serializes_exactly_one_key() {
        let ok = serde_json::to_value(Response::success(json!([1, 2]))).unwrap();
        assert_eq!(ok, json!({"result": [1, 2]}));

        let err = serde_json::to_value(Response::error("boom")).unwrap();
        assert_eq!(err, json!({"error": "boom"}));
    }

    #[test]
    fn test_null_result_is_still_a_result() {
        let resp = serde_json::to_value(Response::success(Value::Null)).unwrap();
        assert_eq!(resp, json!({"result": null}));
    }

    #[test]
    fn test_request_without_params() {
        let req = Request::from_slice(br#"{"method":"list_tools"}"#).unwrap();
        assert_eq!(req.method, "list_tools");
        assert!(req.params.is_null());
        assert!(matches!(
            Method::parse(&req.method, req.params),
            Ok(Method::ListTools)
        ));
    }

    #[test]
    fn test_request_malformed_json() {
        let err = Request::from_slice(b"{not json").unwrap_err();
        assert!(err.to_string().starts_with("invalid request:"));
    }

    #[test]
    fn test_unknown_method() {
        let err = Method::parse("drop_tables", json!({})).unwrap_err();
        assert_eq!(err.to_string(), "unknown method");
    }

    #[test]
    fn test_run_script_async_flag() {
        let method = Method::parse("run_script", json!({"code": "print(1)", "async": true})).unwrap();
        match method {
            Method::RunScript(p) => {
                assert_eq!(p.code, "print(1)");
                assert!(p.background);
            }
            other => panic!("unexpected method: {other:?}"),
        }
    }

    #[test]
    fn test_run_processing_defaults() {
        let method = Method::parse("run_processing", json!({"algorithm": "native:buffer"})).unwrap();
        match method {
            Method::RunProcessing(p) => {
                assert_eq!(p.algorithm, "native:buffer");
                assert!(p.parameters.is_empty());
                assert!(!p.background);
            }
            other => panic!("unexpected method: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_params() {
        let err = Method::parse("run_script", json!({"source": "x"})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidParams(_)));
    }

    #[test]
    fn test_missing_run_id() {
        let method = Method::parse("cancel_run", Value::Null).unwrap();
        match method {
            Method::CancelRun(p) => assert!(matches!(p.require(), Err(CoreError::MissingRunId))),
            other => panic!("unexpected method: {other:?}"),
        }
    }

    #[test]
    fn test_names_round_trip() {
        for name in Method::NAMES {
            let params = match name {
                "run_processing" => json!({"algorithm": "a"}),
                "run_script" => json!({"code": ""}),
                _ => json!({}),
            };
            assert_eq!(Method::parse(name, params).unwrap().name(), name);
        }
    }
}
