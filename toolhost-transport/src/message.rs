//! JSON-RPC 2.0 envelopes exchanged with tool servers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Tool enumeration method.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// Tool invocation method taking `{name, arguments}`.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// Host request a sandbox may send back to capture the visible tab.
pub const METHOD_CAPTURE_VISIBLE_TAB: &str = "host/captureVisibleTab";

/// Standard error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Standard error code for malformed parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Standard error code for internal failures.
pub const INTERNAL_ERROR: i64 = -32603;
/// Host-defined code for a request refused by policy.
pub const FORBIDDEN: i64 = -32001;

/// Outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Correlation id. Transports assign it when the request is sent.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a request; the id is filled in by the transport.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: 0,
            method: method.into(),
            params,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Creates an error without data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Error for an unsupported method.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method `{method}` not found"))
    }
}

/// Incoming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request this answers.
    pub id: Value,
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Builds a success response.
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Builds a failure response.
    #[must_use]
    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Returns the correlation id as an integer, accepting numeric strings.
    #[must_use]
    pub fn numeric_id(&self) -> Option<u64> {
        match &self.id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Converts the response into its result, surfacing the error object.
    ///
    /// # Errors
    ///
    /// Returns the embedded [`JsonRpcError`] when present.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Answer to one of our requests.
    Response(JsonRpcResponse),
    /// Request originating from the sandbox that expects an answer.
    Request {
        /// Peer-chosen id, echoed back verbatim.
        id: Value,
        /// Method name.
        method: String,
        /// Parameters.
        params: Option<Value>,
    },
    /// Fire-and-forget message from the sandbox.
    Notification {
        /// Method name.
        method: String,
    },
}

impl Incoming {
    /// Parses and classifies one JSON message.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the line is not valid JSON or does
    /// not resemble any JSON-RPC message.
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        let mut value: Value = serde_json::from_str(line)?;
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match method {
            Some(method) => match value.get_mut("id").map(Value::take) {
                Some(id) if !id.is_null() => Ok(Self::Request {
                    id,
                    method,
                    params: value.get_mut("params").map(Value::take),
                }),
                _ => Ok(Self::Notification { method }),
            },
            None => serde_json::from_value(value).map(Self::Response),
        }
    }
}
