//! JSON-RPC 2.0 wire model.
//!
//! The transport core does not interpret request params or results; payloads
//! stay as raw [`serde_json::Value`]s and are routed by envelope shape only.

use std::{borrow::Cow, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Zero-sized marker for the `"jsonrpc": "2.0"` field. Deserialization fails
/// on any other version string, so envelope parsing doubles as validation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let version: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        if version == "2.0" {
            Ok(JsonRpcVersion2_0)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported JSON-RPC version: {version}"
            )))
        }
    }
}

/// A JSON-RPC request id: a string or an integer, compared structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(i64),
    String(Arc<str>),
}

pub type RequestId = NumberOrString;

impl fmt::Display for NumberOrString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumberOrString::Number(n) => n.fmt(f),
            NumberOrString::String(s) => s.fmt(f),
        }
    }
}

impl From<i64> for NumberOrString {
    fn from(value: i64) -> Self {
        NumberOrString::Number(value)
    }
}

impl From<String> for NumberOrString {
    fn from(value: String) -> Self {
        NumberOrString::String(value.into())
    }
}

/// Standard JSON-RPC error codes, plus the session-not-found code shared
/// with the peer SDKs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    /// Non-standard: the presented `mcp-session-id` is unknown.
    pub const SESSION_NOT_FOUND: Self = Self(-32001);
}

/// Error payload of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn session_not_found() -> Self {
        Self::new(ErrorCode::SESSION_NOT_FOUND, "Session not found", None)
    }
}

impl fmt::Display for ErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({data})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub error: ErrorData,
}

/// One JSON-RPC message. Batches are handled at the transport layer as
/// `Vec<JsonRpcMessage>` (see [`body_is_batch`]).
///
/// Variant order matters for untagged deserialization: a request has both
/// `id` and `method`, a notification has `method` only, a response has
/// `result`, an error has `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        })
    }

    pub fn error(id: RequestId, error: ErrorData) -> Self {
        JsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error,
        })
    }

    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    /// The id of a request, if this message is one.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(request) => Some(&request.id),
            _ => None,
        }
    }

    /// The id a response or error message answers, if this message is one.
    pub fn response_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Response(response) => Some(&response.id),
            JsonRpcMessage::Error(error) => Some(&error.id),
            _ => None,
        }
    }
}

/// True when the first non-whitespace byte of a POST body opens a JSON array,
/// i.e. the body carries a batch. Does not consume or validate the body.
pub fn body_is_batch(body: &[u8]) -> bool {
    body.iter()
        .find(|b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
        .is_some_and(|b| *b == b'[')
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_round_trip() {
        let value = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"message": "hi"}}
        });
        let message: JsonRpcMessage = serde_json::from_value(value.clone()).unwrap();
        assert!(message.is_request());
        assert_eq!(message.request_id(), Some(&NumberOrString::Number(1)));
        assert_eq!(serde_json::to_value(&message).unwrap(), value);
    }

    #[test]
    fn test_notification_has_no_id() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(matches!(message, JsonRpcMessage::Notification(_)));
        assert!(message.request_id().is_none());
    }

    #[test]
    fn test_response_and_error_discrimination() {
        let response: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "result": {}
        }))
        .unwrap();
        assert_eq!(
            response.response_id(),
            Some(&NumberOrString::String("abc".into()))
        );

        let error: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .unwrap();
        match error {
            JsonRpcMessage::Error(e) => assert_eq!(e.error.code, ErrorCode::METHOD_NOT_FOUND),
            other => panic!("expected error message, got {other:?}"),
        }
    }

    #[test]
    fn test_null_message_is_rejected() {
        assert!(serde_json::from_str::<JsonRpcMessage>("null").is_err());
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let result = serde_json::from_value::<JsonRpcMessage>(json!({
            "jsonrpc": "1.0",
            "id": 1,
            "method": "ping"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_batch_detection_skips_whitespace() {
        assert!(body_is_batch(b"  \r\n\t[{\"jsonrpc\":\"2.0\"}]"));
        assert!(!body_is_batch(b" {\"jsonrpc\":\"2.0\"}"));
        assert!(!body_is_batch(b""));
    }

    #[test]
    fn test_request_ids_compare_structurally() {
        assert_eq!(NumberOrString::Number(1), NumberOrString::Number(1));
        assert_ne!(
            NumberOrString::Number(1),
            NumberOrString::String("1".into())
        );
    }
}
