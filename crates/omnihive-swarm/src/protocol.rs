//! Line-delimited JSON-RPC 2.0 over worker stdio.
//!
//! Request:  `{"jsonrpc":"2.0","id":N,"method":"tools/call","params":{"name":...,"arguments":...}}`
//! Response: `{"jsonrpc":"2.0","id":N,"result":...}` or `{..., "error":{"code":...,"message":...}}`
//! Reserved method `"ping"` returns `{"pong": true}`.

use serde::{Deserialize, Serialize};

pub const METHOD_CALL: &str = "tools/call";
pub const METHOD_LIST: &str = "tools/list";
pub const METHOD_PING: &str = "ping";

/// `-32601` = unknown tool, `-32602` = bad args; everything else maps to
/// a handler error.
pub const CODE_UNKNOWN_TOOL: i64 = -32601;
pub const CODE_BAD_ARGS: i64 = -32602;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RpcRequest {
    pub fn call(id: u64, name: &str, arguments: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: METHOD_CALL.into(),
            params: Some(serde_json::json!({ "name": name, "arguments": arguments })),
        }
    }

    pub fn list(id: u64) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: METHOD_LIST.into(),
            params: None,
        }
    }

    pub fn ping(id: u64) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: METHOD_PING.into(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// A tool advertised by a worker in response to `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_request_wire_shape() {
        let request = RpcRequest::call(7, "git.commit", serde_json::json!({"message": "fix"}));
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["jsonrpc"], "2.0");
        assert_eq!(wire["id"], 7);
        assert_eq!(wire["method"], "tools/call");
        assert_eq!(wire["params"]["name"], "git.commit");
        assert_eq!(wire["params"]["arguments"]["message"], "fix");
    }

    #[test]
    fn response_parses_result_or_error() {
        let ok: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"pong":true}}"#).unwrap();
        assert!(ok.error.is_none());
        assert_eq!(ok.result.unwrap()["pong"], true);

        let err: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"unknown tool"}}"#,
        )
        .unwrap();
        assert_eq!(err.error.unwrap().code, CODE_UNKNOWN_TOOL);
    }

    #[test]
    fn ping_request_has_no_params() {
        let wire = serde_json::to_string(&RpcRequest::ping(1)).unwrap();
        assert!(!wire.contains("params"));
    }
}
