//! The driver's control-socket runtime.
//!
//! Listens for exactly one daemon connection, handshakes with the token
//! from the environment, serves control methods, and enforces the liveness
//! contract. Every inbound daemon request re-arms the idle timer; the
//! daemon's 5-second heartbeat keeps a healthy channel well inside the
//! window.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::UnixListener;
use tokio::sync::watch;

use gaovm_proto::channel::{IdRange, InboundHandler, RpcChannel};
use gaovm_proto::handshake::{self, HandshakeConfig};
use gaovm_proto::message::RpcErrorObject;
use gaovm_store::{LogLevel, RotatingLogSink};

use crate::error::DriverError;

/// Exit non-zero if no authenticated daemon RPC arrives within this window
/// after the handshake completes.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Methods the driver serves to the daemon.
const DRIVER_CAPABILITIES: [&str; 6] = [
    "hello",
    "ping",
    "shutdown",
    "vm.status",
    "vm.open_display",
    "vm.close_display",
];

/// Methods the driver requires from the daemon.
const REQUIRED_DAEMON_CAPABILITIES: [&str; 2] = ["hello", "ping"];

pub struct DriverOptions {
    /// Where to listen for the daemon's connection.
    pub socket_path: PathBuf,
    /// The per-invocation secret, from `AUTH_TOKEN`.
    pub auth_token: String,
    /// Liveness window; [`IDLE_TIMEOUT`] outside tests.
    pub idle_timeout: Duration,
    /// The driver's own rotating log, from `DRIVER_LOG_PATH`.
    pub log: Option<Arc<RotatingLogSink>>,
}

/// Run the driver to completion.
///
/// Returns `Ok(())` only for a daemon-requested shutdown; every other way
/// out is an error the binary maps to a non-zero exit status.
///
/// # Errors
/// [`DriverError::ControlEof`] on socket EOF, [`DriverError::IdleTimeout`]
/// when the daemon goes quiet, [`DriverError::Proto`] on a failed
/// handshake.
pub async fn run(opts: DriverOptions) -> Result<(), DriverError> {
    let _ = std::fs::remove_file(&opts.socket_path);
    let listener = UnixListener::bind(&opts.socket_path).map_err(|source| DriverError::Bind {
        path: opts.socket_path.clone(),
        source,
    })?;
    log_line(&opts.log, LogLevel::Info, "driver listening for daemon");
    tracing::info!(path = %opts.socket_path.display(), "driver listening");

    let (stream, _addr) = listener.accept().await?;
    let (channel, interceptor) =
        RpcChannel::with_hello_interceptor(stream, IdRange::ClientAscending);

    let handshake_cfg = HandshakeConfig {
        capabilities: string_vec(&DRIVER_CAPABILITIES),
        required: string_vec(&REQUIRED_DAEMON_CAPABILITIES),
        auth_token: Some(opts.auth_token.clone()),
        expected_token: Some(opts.auth_token.clone()),
    };
    handshake::initiate(&channel, &handshake_cfg).await?;
    handshake::accept(&channel, interceptor, &handshake_cfg).await?;
    log_line(&opts.log, LogLevel::Info, "daemon authenticated");
    tracing::info!("daemon authenticated");

    let (activity_tx, mut activity_rx) = watch::channel(tokio::time::Instant::now());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    channel.set_handler(Arc::new(DriverHandler {
        vm: std::sync::Mutex::new(VmState {
            running: true,
            display_open: false,
        }),
        activity_tx,
        shutdown_tx,
    }));

    loop {
        let armed_at = *activity_rx.borrow_and_update();
        let deadline = armed_at + opts.idle_timeout;
        tokio::select! {
            () = channel.closed() => {
                log_line(&opts.log, LogLevel::Error, "control socket closed by daemon");
                return Err(DriverError::ControlEof);
            }
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    // Give the shutdown reply a moment to flush.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    log_line(&opts.log, LogLevel::Info, "shutting down on daemon request");
                    channel.close();
                    return Ok(());
                }
            }
            changed = activity_rx.changed() => {
                if changed.is_err() {
                    return Err(DriverError::ControlEof);
                }
                // Timer re-armed by fresh daemon traffic.
            }
            () = tokio::time::sleep_until(deadline) => {
                log_line(&opts.log, LogLevel::Error, "idle timeout, daemon unreachable");
                return Err(DriverError::IdleTimeout(opts.idle_timeout));
            }
        }
    }
}

struct VmState {
    running: bool,
    display_open: bool,
}

struct DriverHandler {
    vm: std::sync::Mutex<VmState>,
    activity_tx: watch::Sender<tokio::time::Instant>,
    shutdown_tx: watch::Sender<bool>,
}

impl DriverHandler {
    fn touch(&self) {
        let _ = self.activity_tx.send(tokio::time::Instant::now());
    }

    fn with_vm<T>(&self, f: impl FnOnce(&mut VmState) -> T) -> T {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut vm = self.vm.lock().expect("vm state lock poisoned");
        f(&mut vm)
    }
}

#[async_trait]
impl InboundHandler for DriverHandler {
    async fn handle_request(
        &self,
        method: &str,
        _params: Option<Value>,
    ) -> Result<Value, RpcErrorObject> {
        self.touch();
        match method {
            "ping" => Ok(json!({"ok": true, "ts": chrono::Utc::now().to_rfc3339()})),
            "shutdown" => {
                self.with_vm(|vm| vm.running = false);
                let _ = self.shutdown_tx.send(true);
                Ok(json!({"stopping": true}))
            }
            "vm.status" => Ok(self.with_vm(|vm| {
                json!({"running": vm.running, "displayOpen": vm.display_open})
            })),
            "vm.open_display" => Ok(self.with_vm(|vm| {
                vm.display_open = true;
                json!({"ok": true, "displayOpen": true})
            })),
            "vm.close_display" => Ok(self.with_vm(|vm| {
                vm.display_open = false;
                json!({"ok": true, "displayOpen": false})
            })),
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }
}

fn log_line(log: &Option<Arc<RotatingLogSink>>, level: LogLevel, line: &str) {
    if let Some(log) = log {
        let _ = log.append(level, line);
    }
}

fn string_vec(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_owned()).collect()
}
