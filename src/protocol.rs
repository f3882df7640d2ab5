//! JSON-RPC 2.0 envelope and MCP payload types.
//!
//! The same dialect is spoken on both sides of the gateway: clients talk
//! JSON-RPC to us, and we talk JSON-RPC to the upstream tool servers. The
//! envelope types here are shared by the dispatcher and the upstream
//! transports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision advertised during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A JSON-RPC 2.0 request or notification (notifications carry no id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Build a request with an integer id.
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: method.into(),
            params,
        }
    }

    /// Build a notification (no id, no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A JSON-RPC 2.0 response. Exactly one of `result`/`error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Canonicalize a wire id to an integer.
///
/// Dynamically typed peers round-trip JSON integers as floats (`1` comes
/// back as `1.0`). Pending-request correlation is keyed by `u64`, so both
/// encodings must land on the same key. String ids of digits are accepted
/// for the same reason.
pub fn normalize_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(u)
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                    .map(|f| f as u64)
            }
        }
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Tool descriptor as listed to MCP clients (`tools/list`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// A single content block of a `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Result payload of `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Value,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl InitializeResult {
    /// The gateway's own capability set, as advertised to clients.
    pub fn gateway() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({
                "tools": { "listChanged": true }
            }),
            server_info: ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_roundtrip() {
        let req = JsonRpcRequest::new(7, "tools/call", Some(serde_json::json!({"name": "x"})));
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: JsonRpcRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.method, "tools/call");
        assert_eq!(normalize_id(decoded.id.as_ref().unwrap()), Some(7));
    }

    #[test]
    fn notification_has_no_id() {
        let note = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(note.is_notification());
        let encoded = serde_json::to_value(&note).unwrap();
        assert!(encoded.get("id").is_none());
    }

    #[test]
    fn normalize_id_canonicalizes_floats() {
        assert_eq!(normalize_id(&serde_json::json!(3)), Some(3));
        assert_eq!(normalize_id(&serde_json::json!(3.0)), Some(3));
        assert_eq!(normalize_id(&serde_json::json!("3")), Some(3));
        assert_eq!(normalize_id(&serde_json::json!(3.5)), None);
        assert_eq!(normalize_id(&serde_json::json!(null)), None);
    }

    #[test]
    fn error_response_shape() {
        let resp = JsonRpcResponse::error(Value::from(1), -32601, "method not found: nope");
        let encoded = serde_json::to_value(&resp).unwrap();
        assert_eq!(encoded["error"]["code"], -32601);
        assert!(encoded.get("result").is_none());
    }

    #[test]
    fn content_block_tagging() {
        let block = ContentBlock::text("hi");
        let encoded = serde_json::to_value(&block).unwrap();
        assert_eq!(encoded, serde_json::json!({"type": "text", "text": "hi"}));
    }
}
