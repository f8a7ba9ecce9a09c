//! JSON-RPC wire types
//!
//! Requests are POSTed to [`RPC_PATH`] as
//! `{"method": ..., "params": [...], "jsonrpc": "2.0", "id": N}`. A reply
//! carries either `result` or `error`; error replies usually come with a
//! non-success HTTP status.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Path of the JSON-RPC endpoint
pub const RPC_PATH: &str = "/rpc";

/// Protocol version string sent with every request
pub const JSONRPC_VERSION: &str = "2.0";

/// Lightweight status call used to probe readiness
pub const STATUS_METHOD: &str = "get_info";

/// Method that runs one line of the service's own command syntax
pub const EXECUTE_COMMAND_METHOD: &str = "execute_command_line";

/// JSON-RPC request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: u64,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

impl Request {
    pub fn new(method: &str, params: Vec<Value>, id: u64) -> Self {
        Self {
            method: method.to_string(),
            params,
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(default)]
    pub id: Value,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id: Value::from(id),
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            id: Value::from(id),
        }
    }

    /// Whether the response echoes request `id`
    pub fn echoes(&self, id: u64) -> bool {
        self.id.as_u64() == Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::new("execute_command_line", vec![Value::from("help")], 3);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "method": "execute_command_line",
                "params": ["help"],
                "jsonrpc": "2.0",
                "id": 3
            })
        );
    }

    #[test]
    fn test_error_response_parses() {
        let body = r#"{"error": {"code": 20005, "message": "unknown command", "data": "x"}, "id": 9}"#;
        let response: Response = serde_json::from_str(body).unwrap();
        assert!(response.result.is_none());
        assert!(response.echoes(9));
        let error = response.error.unwrap();
        assert_eq!(error.code, 20005);
        assert_eq!(error.data, Some(Value::from("x")));
    }

    #[test]
    fn test_monetary_amounts_stay_exact() {
        let body = r#"{"result": {"balance": 0.10000000000000000001}, "id": 1}"#;
        let response: Response = serde_json::from_str(body).unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["balance"].to_string(), "0.10000000000000000001");
    }
}
