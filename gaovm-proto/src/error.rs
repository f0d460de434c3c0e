//! Error types for the protocol crate.

use std::time::Duration;

use serde_json::Value;

use crate::message::RpcErrorObject;

/// Errors that can occur on a control-socket conversation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// The byte stream violated the framing rules. Terminal for the stream.
    #[error("framing error: {0}")]
    Framing(String),

    /// The channel is closed; no further traffic is possible.
    #[error("channel closed")]
    ChannelClosed,

    /// An outbound request did not receive a response in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The `hello` exchange was rejected or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer answered a request with a JSON-RPC error object.
    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<RpcErrorObject> for ProtoError {
    fn from(err: RpcErrorObject) -> Self {
        ProtoError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}
