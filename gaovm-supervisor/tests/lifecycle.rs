//! Lifecycle tests against an in-process fake driver that speaks the real
//! wire protocol over a real Unix socket: spawn, mutual handshake, exec,
//! graceful stop, and crash-triggered restart.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use gaovm_proto::channel::{IdRange, InboundHandler, RpcChannel};
use gaovm_proto::handshake::{self, HandshakeConfig};
use gaovm_proto::message::{Event, EventSink, RpcErrorObject};
use gaovm_store::{ActualState, DesiredState, StateLayout};
use gaovm_supervisor::{
    DriverControl, DriverLauncher, DriverSupervisor, LaunchSpec, LaunchedDriver, SupervisorConfig,
    SupervisorError,
};

fn caps(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_owned()).collect()
}

struct FakeControl {
    exit_tx: mpsc::UnboundedSender<i32>,
    obey_sigterm: bool,
}

impl DriverControl for FakeControl {
    fn signal_terminate(&self) -> std::io::Result<()> {
        if self.obey_sigterm {
            let _ = self.exit_tx.send(143);
        }
        Ok(())
    }
    fn signal_kill(&self) -> std::io::Result<()> {
        let _ = self.exit_tx.send(137);
        Ok(())
    }
}

struct FakeDriverHandler {
    exit_tx: mpsc::UnboundedSender<i32>,
    obey_shutdown: bool,
}

#[async_trait]
impl InboundHandler for FakeDriverHandler {
    async fn handle_request(
        &self,
        method: &str,
        _params: Option<Value>,
    ) -> Result<Value, RpcErrorObject> {
        match method {
            "ping" => Ok(json!({"ok": true})),
            "shutdown" => {
                if self.obey_shutdown {
                    let _ = self.exit_tx.send(0);
                }
                Ok(json!({"stopping": self.obey_shutdown}))
            }
            "vm.status" => Ok(json!({"running": true})),
            "vm.open_display" => Ok(json!({"display": "open"})),
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }
}

/// Launcher whose "child" is an in-process task speaking the driver side of
/// the protocol.
struct FakeDriverLauncher {
    spawns: Arc<AtomicU32>,
    obey_shutdown: bool,
    obey_sigterm: bool,
}

#[async_trait]
impl DriverLauncher for FakeDriverLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedDriver, SupervisorError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let listener = UnixListener::bind(&spec.socket_path)
            .map_err(|e| SupervisorError::Spawn(format!("bind fake driver socket: {e}")))?;
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<i32>();

        tokio::spawn(run_fake_driver(
            listener,
            spec.auth_token.clone(),
            exit_tx.clone(),
            self.obey_shutdown,
        ));

        Ok(LaunchedDriver {
            pid: Some(7777),
            control: Arc::new(FakeControl {
                exit_tx,
                obey_sigterm: self.obey_sigterm,
            }),
            exited: Box::pin(async move { exit_rx.recv().await }),
        })
    }
}

async fn run_fake_driver(
    listener: UnixListener,
    token: String,
    exit_tx: mpsc::UnboundedSender<i32>,
    obey_shutdown: bool,
) {
    let Ok((stream, _)) = listener.accept().await else {
        let _ = exit_tx.send(1);
        return;
    };
    let (channel, interceptor) = RpcChannel::with_hello_interceptor(stream, IdRange::ClientAscending);
    let cfg = HandshakeConfig {
        capabilities: caps(&["hello", "ping", "shutdown", "vm.status", "vm.open_display"]),
        required: caps(&["hello", "ping"]),
        auth_token: Some(token.clone()),
        expected_token: Some(token),
    };
    if handshake::initiate(&channel, &cfg).await.is_err() {
        let _ = exit_tx.send(1);
        return;
    }
    if handshake::accept(&channel, interceptor, &cfg).await.is_err() {
        let _ = exit_tx.send(1);
        return;
    }
    channel.set_handler(Arc::new(FakeDriverHandler {
        exit_tx: exit_tx.clone(),
        obey_shutdown,
    }));
    // Control-socket EOF means the daemon is gone.
    channel.closed().await;
    let _ = exit_tx.send(1);
}

struct Fixture {
    _dir: tempfile::TempDir,
    supervisor: Arc<DriverSupervisor>,
    events: mpsc::UnboundedReceiver<Event>,
    spawns: Arc<AtomicU32>,
}

fn fixture(obey_shutdown: bool, obey_sigterm: bool) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = StateLayout::new(dir.path().join("state"));
    layout.ensure_dirs().expect("ensure_dirs");
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: EventSink = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    let spawns = Arc::new(AtomicU32::new(0));
    let launcher = Arc::new(FakeDriverLauncher {
        spawns: Arc::clone(&spawns),
        obey_shutdown,
        obey_sigterm,
    });
    let cfg = SupervisorConfig::from_layout(&layout, "/nonexistent/gaovm-driver".into());
    Fixture {
        supervisor: DriverSupervisor::new(cfg, launcher, sink),
        events: rx,
        spawns,
        _dir: dir,
    }
}

async fn wait_for_event(rx: &mut mpsc::UnboundedReceiver<Event>, kind: &str) -> Event {
    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(15), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
            .expect("event channel closed");
        if event.kind == kind {
            return event;
        }
    }
}

#[tokio::test]
async fn start_connects_and_reports_running() {
    let mut fx = fixture(true, true);
    let status = fx.supervisor.start().await.expect("start");
    assert_eq!(status.desired, DesiredState::Running);
    assert_eq!(status.actual, ActualState::Running);
    assert_eq!(status.restart_attempts, 0);
    assert_eq!(status.driver_pid, Some(7777));
    assert!(status.driver_socket_path.is_some());
    assert!(status.last_failure.is_none(), "successful start clears lastFailure");

    wait_for_event(&mut fx.events, "driver.connected").await;
    fx.supervisor.stop().await.expect("stop");
}

#[tokio::test]
async fn start_is_idempotent_while_running() {
    let fx = fixture(true, true);
    fx.supervisor.start().await.expect("first start");
    let spawns_after_first = fx.spawns.load(Ordering::SeqCst);
    let status = fx.supervisor.start().await.expect("second start");
    assert_eq!(status.actual, ActualState::Running);
    assert_eq!(
        fx.spawns.load(Ordering::SeqCst),
        spawns_after_first,
        "second start must not respawn"
    );
    fx.supervisor.stop().await.expect("stop");
}

#[tokio::test]
async fn driver_exec_forwards_to_the_driver() {
    let fx = fixture(true, true);
    fx.supervisor.start().await.expect("start");

    let result = fx
        .supervisor
        .driver_exec("vm.status", None)
        .await
        .expect("exec failed");
    assert_eq!(result["running"], true);

    let err = fx
        .supervisor
        .driver_exec("vm.snapshot", None)
        .await
        .expect_err("unknown driver method must fail");
    assert!(matches!(err, SupervisorError::Rpc(_)), "got {err}");

    fx.supervisor.stop().await.expect("stop");
}

#[tokio::test]
async fn graceful_stop_uses_the_polite_request() {
    let mut fx = fixture(true, true);
    fx.supervisor.start().await.expect("start");
    let status = fx.supervisor.stop().await.expect("stop");
    assert_eq!(status.desired, DesiredState::Stopped);
    assert_eq!(status.actual, ActualState::Stopped);

    let exited = wait_for_event(&mut fx.events, "driver.exited").await;
    assert_eq!(
        exited.payload["code"], 0,
        "polite shutdown must exit cleanly, not via signal"
    );
}

#[tokio::test]
async fn stop_escalates_to_sigterm_when_request_is_ignored() {
    let mut fx = fixture(false, true);
    fx.supervisor.start().await.expect("start");
    let status = fx.supervisor.stop().await.expect("stop");
    assert_eq!(status.actual, ActualState::Stopped);

    let exited = wait_for_event(&mut fx.events, "driver.exited").await;
    assert_eq!(exited.payload["code"], 143, "SIGTERM path must have fired");
}

#[tokio::test]
async fn unexpected_exit_schedules_restart_and_reconnects() {
    let mut fx = fixture(true, true);
    fx.supervisor.start().await.expect("start");
    wait_for_event(&mut fx.events, "driver.connected").await;
    assert_eq!(fx.spawns.load(Ordering::SeqCst), 1);

    // Simulate a crash: kill the fake child out-of-band.
    let killed = fx
        .supervisor
        .driver_exec("shutdown", None)
        .await
        .expect("shutdown exec");
    assert_eq!(killed["stopping"], true);

    wait_for_event(&mut fx.events, "driver.exited").await;
    let scheduled = wait_for_event(&mut fx.events, "driver.restart_scheduled").await;
    assert_eq!(scheduled.payload["attempt"], 1);
    assert_eq!(scheduled.payload["delaySeconds"], 1);

    wait_for_event(&mut fx.events, "driver.connected").await;
    assert_eq!(fx.spawns.load(Ordering::SeqCst), 2, "driver must be respawned");

    let status = fx.supervisor.status().await;
    assert_eq!(status.actual, ActualState::Running);
    assert_eq!(status.restart_attempts, 0, "successful reconnect resets the budget");

    fx.supervisor.stop().await.expect("stop");
}
