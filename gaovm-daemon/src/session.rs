//! Per-connection client sessions.
//!
//! Every accepted connection gets a [`Session`]: an RPC channel whose
//! inbound handler gates all methods behind the `hello` handshake, a
//! subscribed-to-events flag, and a forwarder task pushing bus events as
//! `event` notifications. Sessions share the daemon state but own nothing
//! of each other; a slow or dead session only ever loses its own events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::sync::broadcast;

use gaovm_proto::channel::{IdRange, InboundHandler, RpcChannel};
use gaovm_proto::handshake::{self, HandshakeConfig, HelloParams};
use gaovm_proto::message::RpcErrorObject;
use gaovm_store::{ActualState, StoreError};

use crate::error::{store_error_to_rpc, supervisor_error_to_rpc};
use crate::server::DaemonState;

/// Methods the daemon serves to clients.
pub const CLIENT_CAPABILITIES: [&str; 14] = [
    "hello",
    "ping",
    "subscribe_events",
    "doctor",
    "driver.exec",
    "list_vms",
    "vm.start",
    "vm.stop",
    "vm.status",
    "vm.open_display",
    "vm.close_display",
    "vm.config.get",
    "vm.config.set",
    "vm.config.patch",
];

/// Methods the daemon requires every client to serve.
const REQUIRED_CLIENT_CAPABILITIES: [&str; 2] = ["hello", "ping"];

pub struct Session {
    id: u64,
    state: Arc<DaemonState>,
    channel: OnceLock<RpcChannel>,
    handshaken: AtomicBool,
    subscribed: AtomicBool,
}

impl Session {
    /// Wire a fresh connection: build the channel with this session as its
    /// handler and start the event forwarder.
    pub fn spawn(id: u64, state: Arc<DaemonState>, stream: UnixStream) {
        let session = Arc::new(Session {
            id,
            state,
            channel: OnceLock::new(),
            handshaken: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
        });
        let channel = RpcChannel::with_handler(
            stream,
            IdRange::DaemonDescending,
            Arc::clone(&session) as Arc<dyn InboundHandler>,
        );
        let _ = session.channel.set(channel.clone());
        tracing::debug!(session = id, "client connected");

        let events = session.state.events.subscribe();
        tokio::spawn(Self::forward_events(session, channel, events));
    }

    async fn forward_events(
        session: Arc<Session>,
        channel: RpcChannel,
        mut events: broadcast::Receiver<gaovm_proto::message::Event>,
    ) {
        loop {
            tokio::select! {
                () = channel.closed() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        if !session.subscribed.load(Ordering::SeqCst)
                            || !session.handshaken.load(Ordering::SeqCst)
                        {
                            continue;
                        }
                        let params = match serde_json::to_value(&event) {
                            Ok(params) => params,
                            Err(e) => {
                                tracing::warn!(error = %e, "unserializable event");
                                continue;
                            }
                        };
                        if channel.notify("event", Some(params)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(session = session.id, missed, "session lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!(session = session.id, "client disconnected");
    }

    // ── Method handlers ──────────────────────────────────────────────────────

    async fn handle_hello(&self, params: Option<Value>) -> Result<Value, RpcErrorObject> {
        let params: HelloParams = serde_json::from_value(
            params.ok_or_else(|| RpcErrorObject::invalid_params("hello params are required"))?,
        )
        .map_err(|e| RpcErrorObject::invalid_params(format!("malformed hello params: {e}")))?;

        let supported = string_vec(&CLIENT_CAPABILITIES);
        let reply = handshake::validate_hello(&params, &supported, None)?;
        self.handshaken.store(true, Ordering::SeqCst);
        tracing::debug!(session = self.id, "client handshake complete");

        // Reciprocate with our own hello, best-effort and without holding up
        // the reply.
        if let Some(channel) = self.channel.get() {
            let channel = channel.clone();
            tokio::spawn(async move {
                let cfg = HandshakeConfig {
                    capabilities: string_vec(&CLIENT_CAPABILITIES),
                    required: string_vec(&REQUIRED_CLIENT_CAPABILITIES),
                    ..HandshakeConfig::default()
                };
                if let Err(e) = handshake::initiate(&channel, &cfg).await {
                    tracing::debug!(error = %e, "reciprocal hello failed");
                }
            });
        }

        serde_json::to_value(reply).map_err(|e| RpcErrorObject::internal(e.to_string()))
    }

    async fn is_running(&self) -> bool {
        self.state.supervisor.status().await.actual == ActualState::Running
    }

    async fn vm_start(&self) -> Result<Value, RpcErrorObject> {
        if !self.is_running().await {
            self.state
                .store
                .activate_pending_if_present()
                .await
                .map_err(|e| store_error_to_rpc(&e))?;
        }
        let status = self
            .state
            .supervisor
            .start()
            .await
            .map_err(|e| supervisor_error_to_rpc(&e))?;
        to_result(&status)
    }

    async fn vm_stop(&self) -> Result<Value, RpcErrorObject> {
        let status = self
            .state
            .supervisor
            .stop()
            .await
            .map_err(|e| supervisor_error_to_rpc(&e))?;
        to_result(&status)
    }

    async fn list_vms(&self) -> Result<Value, RpcErrorObject> {
        let status = self.state.supervisor.status().await;
        Ok(json!([{"name": "default", "status": to_result(&status)?}]))
    }

    async fn config_get(&self) -> Result<Value, RpcErrorObject> {
        let current = self
            .state
            .store
            .current()
            .await
            .map_err(|e| store_error_to_rpc(&e))?;
        let pending = self
            .state
            .store
            .pending()
            .await
            .map_err(|e| store_error_to_rpc(&e))?;
        Ok(json!({
            "current": to_result(&current)?,
            "pending": pending.as_ref().map(to_result).transpose()?,
            "hasPending": pending.is_some(),
        }))
    }

    async fn config_set(&self, params: Option<Value>) -> Result<Value, RpcErrorObject> {
        let config = require_param(params, "config")?;
        let running = self.is_running().await;
        let outcome: Result<_, StoreError> = self.state.store.set(&config, running).await;
        to_result(&outcome.map_err(|e| store_error_to_rpc(&e))?)
    }

    async fn config_patch(&self, params: Option<Value>) -> Result<Value, RpcErrorObject> {
        let patch = require_param(params, "patch")?;
        let running = self.is_running().await;
        let outcome: Result<_, StoreError> = self.state.store.patch(&patch, running).await;
        to_result(&outcome.map_err(|e| store_error_to_rpc(&e))?)
    }

    async fn driver_exec(&self, params: Option<Value>) -> Result<Value, RpcErrorObject> {
        let params =
            params.ok_or_else(|| RpcErrorObject::invalid_params("params are required"))?;
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcErrorObject::invalid_params("method must be a string"))?
            .to_owned();
        let driver_params = params.get("params").cloned();
        let result = self
            .state
            .supervisor
            .driver_exec(&method, driver_params)
            .await
            .map_err(|e| supervisor_error_to_rpc(&e))?;
        Ok(json!({"method": method, "driverResult": result}))
    }

    async fn forward_display(&self, method: &str) -> Result<Value, RpcErrorObject> {
        self.state
            .supervisor
            .driver_exec(method, None)
            .await
            .map_err(|e| supervisor_error_to_rpc(&e))
    }
}

#[async_trait]
impl InboundHandler for Session {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcErrorObject> {
        if method == "hello" {
            return self.handle_hello(params).await;
        }
        if !self.handshaken.load(Ordering::SeqCst) {
            return Err(RpcErrorObject::handshake_required());
        }
        match method {
            "ping" => Ok(json!({"ok": true, "ts": chrono::Utc::now().to_rfc3339()})),
            "subscribe_events" => {
                self.subscribed.store(true, Ordering::SeqCst);
                Ok(json!({"subscribed": true}))
            }
            "list_vms" => self.list_vms().await,
            "vm.start" => self.vm_start().await,
            "vm.stop" => self.vm_stop().await,
            "vm.status" => to_result(&self.state.supervisor.status().await),
            "vm.config.get" => self.config_get().await,
            "vm.config.set" => self.config_set(params).await,
            "vm.config.patch" => self.config_patch(params).await,
            "doctor" => to_result(&self.state.supervisor.doctor().await),
            "driver.exec" => self.driver_exec(params).await,
            "vm.open_display" | "vm.close_display" => self.forward_display(method).await,
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }
}

fn require_param(params: Option<Value>, key: &str) -> Result<Value, RpcErrorObject> {
    params
        .as_ref()
        .and_then(|p| p.get(key))
        .cloned()
        .ok_or_else(|| RpcErrorObject::invalid_params(format!("{key} is required")))
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, RpcErrorObject> {
    serde_json::to_value(value).map_err(|e| RpcErrorObject::internal(e.to_string()))
}

fn string_vec(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_owned()).collect()
}
