//! Common types and data structures

use serde::{Deserialize, Serialize};

/// MCP protocol version spoken during the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC protocol version carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    pub jsonrpc: String,
    /// Absent for notifications, which expect no reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl McpRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(serde_json::Value::String(id.into())),
            method: method.into(),
            params: Some(params),
        }
    }

    /// A request without an ID; the peer must not reply.
    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// MCP JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

impl McpResponse {
    /// Response ID normalized to its textual form.
    ///
    /// The codec generates decimal-string IDs, but some servers echo them
    /// back as JSON numbers; correlation is textual so both forms match.
    pub fn id_str(&self) -> Option<String> {
        match &self.id {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// MCP error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Tool descriptor from a `tools/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

/// Server identifier
pub type ServerId = String;

/// Tool name
pub type ToolName = String;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_serializes_without_id() {
        let req = McpRequest::notification("notifications/initialized");
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("params").is_none());
        assert_eq!(value["jsonrpc"], "2.0");
    }

    #[test]
    fn response_id_normalizes_numbers() {
        let resp: McpResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 7, "result": {}})).unwrap();
        assert_eq!(resp.id_str().as_deref(), Some("7"));

        let resp: McpResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": "7", "result": {}})).unwrap();
        assert_eq!(resp.id_str().as_deref(), Some("7"));
    }
}
