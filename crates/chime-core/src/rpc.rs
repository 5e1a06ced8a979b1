//! JSON-RPC 2.0 protocol types.

use serde::{Deserialize, Serialize};

/// Protocol version tag carried by every document.
pub const VERSION: &str = "2.0";

/// Reserved method name routing a request to the signal bridge.
pub const REGISTER_SIGNAL_HANDLER: &str = "registerSignalHandler";

/// JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// JSON-RPC version.
    pub jsonrpc: String,
    /// Method name, optionally `domain/`-qualified.
    pub method: String,
    /// Request parameters (positional array or named map).
    #[serde(default)]
    pub params: serde_json::Value,
    /// Request ID; absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Request {
    /// Create a request expecting a response.
    #[must_use]
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: impl Into<String>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    /// Create a notification (no response expected).
    #[must_use]
    pub fn notification(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Whether this request is a notification.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version.
    pub jsonrpc: String,
    /// Result (if success). Serialized even when the value is JSON null.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error (if failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// ID of the request this responds to.
    pub id: Option<String>,
}

impl Response {
    /// Create a success response.
    #[must_use]
    pub fn success(id: Option<String>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    #[must_use]
    pub fn error(id: Option<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Additional data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// Standard JSON-RPC error codes
/// Parse error.
pub const PARSE_ERROR: i32 = -32700;
/// Invalid request.
pub const INVALID_REQUEST: i32 = -32600;
/// Method not found.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Invalid params.
pub const INVALID_PARAMS: i32 = -32602;
/// Internal error.
pub const INTERNAL_ERROR: i32 = -32603;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let request = Request::new("math/sqrt", json!([16]), "abc-123");
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["jsonrpc"], "2.0");
        assert_eq!(encoded["method"], "math/sqrt");
        assert_eq!(encoded["id"], "abc-123");

        let decoded: Request = serde_json::from_value(encoded).unwrap();
        assert!(!decoded.is_notification());
    }

    #[test]
    fn test_notification_has_no_id() {
        let notification = Request::notification("tick", json!([]));
        let encoded = serde_json::to_value(&notification).unwrap();
        assert!(encoded.get("id").is_none());
        assert!(notification.is_notification());
    }

    #[test]
    fn test_success_response_keeps_null_result() {
        let response = Response::success(Some("1".to_string()), json!(null));
        let encoded = serde_json::to_value(&response).unwrap();
        assert!(encoded.get("result").is_some());
        assert!(encoded.get("error").is_none());
    }

    #[test]
    fn test_error_response() {
        let response = Response::error(Some("1".to_string()), METHOD_NOT_FOUND, "no such method");
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["error"]["code"], -32601);
        assert_eq!(encoded["error"]["message"], "no such method");
    }
}
