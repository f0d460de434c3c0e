//! JSON-RPC 2.0 message model.
//!
//! One message per frame. Requests carry an `id`, notifications do not;
//! responses are either `{id, result}` or `{id, error}`. The daemon
//! allocates descending negative IDs for its driver-directed requests,
//! clients allocate ascending positive IDs; inbound IDs are echoed back
//! verbatim whatever their JSON type.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Protocol version marker required on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes.
pub const ERR_PARSE: i64 = -32700;
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;

/// gaovm-specific error codes.
pub const ERR_HANDSHAKE_FAILED: i64 = -32010;
pub const ERR_AUTH_FAILED: i64 = -32011;
pub const ERR_CAPABILITY_MISMATCH: i64 = -32012;

/// The `error` member of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(ERR_METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ERR_INTERNAL, message)
    }

    /// Rejection for any request arriving before the `hello` exchange.
    #[must_use]
    pub fn handshake_required() -> Self {
        Self::new(ERR_HANDSHAKE_FAILED, "handshake required before this method")
    }
}

impl std::fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// A single decoded JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Success {
        id: Value,
        result: Value,
    },
    Error {
        id: Value,
        error: RpcErrorObject,
    },
}

impl RpcMessage {
    #[must_use]
    pub fn request(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        RpcMessage::Request {
            id,
            method: method.into(),
            params,
        }
    }

    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        RpcMessage::Notification {
            method: method.into(),
            params,
        }
    }

    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        RpcMessage::Success { id, result }
    }

    #[must_use]
    pub fn error(id: Value, error: RpcErrorObject) -> Self {
        RpcMessage::Error { id, error }
    }

    /// Classify a decoded top-level object.
    ///
    /// # Errors
    /// Returns an [`RpcErrorObject`] with code −32600 when the object is not
    /// a well-formed JSON-RPC 2.0 message.
    pub fn from_value(value: Value) -> Result<Self, RpcErrorObject> {
        let Value::Object(map) = value else {
            return Err(RpcErrorObject::new(
                ERR_INVALID_REQUEST,
                "message must be a JSON object",
            ));
        };
        if map.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(RpcErrorObject::new(
                ERR_INVALID_REQUEST,
                "missing or unsupported jsonrpc version",
            ));
        }

        if let Some(method) = map.get("method") {
            let Some(method) = method.as_str() else {
                return Err(RpcErrorObject::new(
                    ERR_INVALID_REQUEST,
                    "method must be a string",
                ));
            };
            let params = map.get("params").cloned();
            return Ok(match map.get("id") {
                Some(id) => RpcMessage::Request {
                    id: id.clone(),
                    method: method.to_owned(),
                    params,
                },
                None => RpcMessage::Notification {
                    method: method.to_owned(),
                    params,
                },
            });
        }

        let Some(id) = map.get("id").cloned() else {
            return Err(RpcErrorObject::new(
                ERR_INVALID_REQUEST,
                "response is missing an id",
            ));
        };
        if let Some(result) = map.get("result").cloned() {
            return Ok(RpcMessage::Success { id, result });
        }
        if let Some(error) = map.get("error").cloned() {
            let error: RpcErrorObject = serde_json::from_value(error).map_err(|e| {
                RpcErrorObject::new(ERR_INVALID_REQUEST, format!("malformed error object: {e}"))
            })?;
            return Ok(RpcMessage::Error { id, error });
        }
        Err(RpcErrorObject::new(
            ERR_INVALID_REQUEST,
            "message carries neither method, result, nor error",
        ))
    }

    /// Render back to the wire representation.
    #[must_use]
    pub fn into_value(self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".to_owned(), json!(JSONRPC_VERSION));
        match self {
            RpcMessage::Request { id, method, params } => {
                map.insert("id".to_owned(), id);
                map.insert("method".to_owned(), json!(method));
                if let Some(params) = params {
                    map.insert("params".to_owned(), params);
                }
            }
            RpcMessage::Notification { method, params } => {
                map.insert("method".to_owned(), json!(method));
                if let Some(params) = params {
                    map.insert("params".to_owned(), params);
                }
            }
            RpcMessage::Success { id, result } => {
                map.insert("id".to_owned(), id);
                map.insert("result".to_owned(), result);
            }
            RpcMessage::Error { id, error } => {
                map.insert("id".to_owned(), id);
                map.insert(
                    "error".to_owned(),
                    serde_json::to_value(error).unwrap_or_else(|_| json!(null)),
                );
            }
        }
        Value::Object(map)
    }
}

/// A lifecycle or configuration event fanned out to subscribed sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            ts: Utc::now(),
        }
    }
}

/// Synchronous, non-blocking event emission callback.
///
/// Producers (config store, supervisor) call this from their own task;
/// delivery to subscribers is the consumer's problem and must never block
/// the emitter.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// A sink that discards every event. Useful for tests and tools.
#[must_use]
pub fn null_event_sink() -> EventSink {
    Arc::new(|_| {})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip_preserves_fields() {
        let msg = RpcMessage::request(json!(7), "vm.status", Some(json!({"a": 1})));
        let value = msg.clone().into_value();
        assert_eq!(value["jsonrpc"], "2.0");
        let back = RpcMessage::from_value(value).expect("classification failed");
        assert_eq!(back, msg);
    }

    #[test]
    fn notification_has_no_id() {
        let msg = RpcMessage::notification("event", Some(json!({"type": "x"})));
        let value = msg.into_value();
        assert!(value.get("id").is_none(), "notification must not carry an id");
    }

    #[test]
    fn missing_jsonrpc_version_is_invalid_request() {
        let err = RpcMessage::from_value(json!({"id": 1, "method": "ping"}))
            .expect_err("must reject missing version");
        assert_eq!(err.code, ERR_INVALID_REQUEST);
    }

    #[test]
    fn error_response_parses_code_and_message() {
        let value = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {"code": -32601, "message": "method not found: nope"}
        });
        let msg = RpcMessage::from_value(value).expect("classification failed");
        match msg {
            RpcMessage::Error { id, error } => {
                assert_eq!(id, json!(3));
                assert_eq!(error.code, ERR_METHOD_NOT_FOUND);
            }
            other => panic!("expected error message, got {other:?}"),
        }
    }

    #[test]
    fn response_without_id_is_rejected() {
        let err = RpcMessage::from_value(json!({"jsonrpc": "2.0", "result": {}}))
            .expect_err("must reject id-less response");
        assert_eq!(err.code, ERR_INVALID_REQUEST);
    }

    #[test]
    fn event_serializes_type_field() {
        let event = Event::new("driver.exited", json!({"code": 1}));
        let value = serde_json::to_value(&event).expect("serialize failed");
        assert_eq!(value["type"], "driver.exited");
        assert!(value["ts"].is_string(), "ts must serialize as a timestamp string");
    }
}
