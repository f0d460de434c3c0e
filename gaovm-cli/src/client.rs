//! Client-side connection to the daemon: handshake, calls, event stream.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use gaovm_proto::channel::{IdRange, InboundHandler, RpcChannel};
use gaovm_proto::handshake::{self, HandshakeConfig, HelloParams};
use gaovm_proto::message::{Event, RpcErrorObject};
use gaovm_proto::ProtoError;

/// Methods this client serves to the daemon (its reciprocal `hello` and
/// liveness pings).
const CLIENT_CAPABILITIES: [&str; 2] = ["hello", "ping"];

/// Errors surfaced to the terminal.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CliError {
    /// Malformed command-line input; exits with the usage status.
    #[error("{0}")]
    Usage(String),

    /// The daemon socket could not be reached.
    #[error("cannot connect to daemon at {path}: {source} (is gaovmd running?)")]
    Connect {
        path: String,
        source: std::io::Error,
    },

    /// An error propagated from the RPC layer.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

struct ClientHandler {
    events_tx: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl InboundHandler for ClientHandler {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcErrorObject> {
        match method {
            "hello" => {
                let params: HelloParams = serde_json::from_value(
                    params
                        .ok_or_else(|| RpcErrorObject::invalid_params("hello params are required"))?,
                )
                .map_err(|e| {
                    RpcErrorObject::invalid_params(format!("malformed hello params: {e}"))
                })?;
                let supported: Vec<String> =
                    CLIENT_CAPABILITIES.iter().map(|s| (*s).to_owned()).collect();
                let reply = handshake::validate_hello(&params, &supported, None)?;
                serde_json::to_value(reply).map_err(|e| RpcErrorObject::internal(e.to_string()))
            }
            "ping" => Ok(serde_json::json!({"ok": true})),
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        if method != "event" {
            return;
        }
        if let Some(event) = params.and_then(|p| serde_json::from_value::<Event>(p).ok()) {
            let _ = self.events_tx.send(event);
        }
    }
}

/// One authenticated conversation with the daemon.
pub struct DaemonClient {
    channel: RpcChannel,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl DaemonClient {
    /// Connect and perform the client handshake.
    ///
    /// # Errors
    /// [`CliError::Connect`] when the socket is unreachable,
    /// [`CliError::Proto`] when the handshake is rejected.
    pub async fn connect(socket_path: &Path) -> Result<Self, CliError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|source| CliError::Connect {
                path: socket_path.display().to_string(),
                source,
            })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = RpcChannel::with_handler(
            stream,
            IdRange::ClientAscending,
            Arc::new(ClientHandler { events_tx }),
        );

        let cfg = HandshakeConfig {
            capabilities: CLIENT_CAPABILITIES.iter().map(|s| (*s).to_owned()).collect(),
            required: CLIENT_CAPABILITIES.iter().map(|s| (*s).to_owned()).collect(),
            ..HandshakeConfig::default()
        };
        handshake::initiate(&channel, &cfg).await?;
        tracing::debug!("daemon handshake complete");

        Ok(Self { channel, events_rx })
    }

    /// One RPC round-trip.
    ///
    /// # Errors
    /// Propagates channel and remote errors.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CliError> {
        Ok(self.channel.call(method, params).await?)
    }

    /// Next `event` notification; `None` once the channel is gone.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }
}
