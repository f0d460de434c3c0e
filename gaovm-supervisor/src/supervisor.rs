//! The driver supervisor state machine.
//!
//! Desired state is `running` or `stopped`; the observed child moves through
//! absent → starting → connected → stopping/exited. Lifecycle operations are
//! mutually non-reentrant: `start_in_progress` and `stop_in_progress` guards
//! make a second concurrent operation a no-op that still reports current
//! status. A driver that keeps dying is restarted with exponential backoff
//! until the attempt budget is exhausted, at which point desired state flips
//! to `stopped` and a `driver.permanent_failure` event is emitted.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use gaovm_proto::channel::{IdRange, InboundHandler, RpcChannel};
use gaovm_proto::handshake::{self, HandshakeConfig, HelloParams};
use gaovm_proto::message::{Event, EventSink, RpcErrorObject};
use gaovm_proto::ProtoError;

use gaovm_store::{
    write_json_atomic, ActualState, DesiredState, DesiredStateRecord, RuntimeStateRecord,
    StateLayout,
};

use crate::error::SupervisorError;
use crate::launcher::{DriverControl, DriverLauncher, LaunchSpec};

const CONNECT_RETRY: Duration = Duration::from_millis(200);
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const DRIVER_EXEC_TIMEOUT: Duration = Duration::from_secs(5);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);
const STOP_REQUEST_WAIT: Duration = Duration::from_millis(500);
const STOP_TERM_WAIT: Duration = Duration::from_secs(2);
const STOP_KILL_WAIT: Duration = Duration::from_secs(2);
const MAX_RESTART_DELAY_SECS: u64 = 30;

/// Methods the daemon serves on the driver channel.
const DAEMON_DRIVER_CAPABILITIES: [&str; 2] = ["hello", "ping"];

/// Methods the daemon requires from the driver.
const REQUIRED_DRIVER_CAPABILITIES: [&str; 2] = ["hello", "ping"];

/// What to do about repeated heartbeat failures.
///
/// The default never tears the channel down: a failed ping records
/// `lastFailure` and leaves detection to the next EOF or exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatPolicy {
    /// Close the driver channel after this many consecutive failures.
    pub teardown_after: Option<u32>,
}

/// Static supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub driver_bin: std::path::PathBuf,
    pub state_dir: std::path::PathBuf,
    pub run_dir: std::path::PathBuf,
    pub driver_socket_path: std::path::PathBuf,
    pub driver_log_path: std::path::PathBuf,
    pub desired_state_path: std::path::PathBuf,
    pub runtime_state_path: std::path::PathBuf,
    pub max_restart_attempts: u32,
    pub heartbeat: HeartbeatPolicy,
}

impl SupervisorConfig {
    /// Derive every path from the state-directory layout.
    #[must_use]
    pub fn from_layout(layout: &StateLayout, driver_bin: std::path::PathBuf) -> Self {
        Self {
            driver_bin,
            state_dir: layout.state_dir().to_owned(),
            run_dir: layout.run_dir(),
            driver_socket_path: layout.driver_socket_path(),
            driver_log_path: layout.driver_log_path(),
            desired_state_path: layout.desired_state_path(),
            runtime_state_path: layout.runtime_state_path(),
            max_restart_attempts: 5,
            heartbeat: HeartbeatPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Absent,
    Starting,
    Connected,
    Stopping,
    Exited,
}

#[derive(Clone)]
struct DriverSession {
    channel: RpcChannel,
    control: Arc<dyn DriverControl>,
    pid: Option<u32>,
    exited_rx: watch::Receiver<bool>,
}

struct Inner {
    desired: DesiredState,
    phase: Phase,
    restart_attempts: u32,
    restart_pending: bool,
    restart_task: Option<JoinHandle<()>>,
    start_in_progress: bool,
    stop_in_progress: bool,
    last_failure: Option<String>,
    session: Option<DriverSession>,
    // Incremented per spawn so stale watcher and heartbeat tasks notice
    // they outlived their driver.
    epoch: u64,
    // The most recent epoch whose handshake completed; exits of such an
    // epoch are reportable, exits of never-connected spawns belong to the
    // start path's own failure handling.
    connected_epoch: u64,
}

/// Owner of the single driver child and its restart policy.
pub struct DriverSupervisor {
    cfg: SupervisorConfig,
    launcher: Arc<dyn DriverLauncher>,
    events: EventSink,
    inner: Mutex<Inner>,
    // Bumped when a lifecycle operation finishes; a rejected concurrent
    // caller waits on it so its status reply reflects the settled state.
    op_seq: watch::Sender<u64>,
}

impl DriverSupervisor {
    #[must_use]
    pub fn new(
        cfg: SupervisorConfig,
        launcher: Arc<dyn DriverLauncher>,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            launcher,
            events,
            op_seq: watch::channel(0).0,
            inner: Mutex::new(Inner {
                desired: DesiredState::Stopped,
                phase: Phase::Absent,
                restart_attempts: 0,
                restart_pending: false,
                restart_task: None,
                start_in_progress: false,
                stop_in_progress: false,
                last_failure: None,
                session: None,
                epoch: 0,
                connected_epoch: 0,
            }),
        })
    }

    /// Re-read the persisted desired state, so a daemon restart resumes a VM
    /// that was left running. Missing or corrupt files leave the default
    /// (`stopped`) in place.
    pub async fn load_persisted_desired(self: &Arc<Self>) {
        let record = match tokio::fs::read(&self.cfg.desired_state_path).await {
            Ok(bytes) => match serde_json::from_slice::<DesiredStateRecord>(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring corrupt desired-state record");
                    return;
                }
            },
            Err(_) => return,
        };
        let mut inner = self.inner.lock().await;
        inner.desired = record.desired;
        inner.last_failure = record.last_failure;
        tracing::info!(desired = ?record.desired, "desired state restored from disk");
    }

    /// Set desired state to running and start the driver if needed.
    ///
    /// A second concurrent lifecycle operation is a no-op that still returns
    /// current status.
    ///
    /// # Errors
    /// Propagates desired-state persistence failures; spawn failures are
    /// absorbed into the restart policy, not returned.
    pub async fn start(self: &Arc<Self>) -> Result<RuntimeStateRecord, SupervisorError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.start_in_progress || inner.stop_in_progress {
                let mut rx = self.op_seq.subscribe();
                let seen = *rx.borrow();
                drop(inner);
                // No-op for this caller, but report status only once the
                // in-flight operation settles.
                let _ = tokio::time::timeout(
                    Duration::from_secs(30),
                    rx.wait_for(|seq| *seq > seen),
                )
                .await;
                return Ok(self.status().await);
            }
            inner.desired = DesiredState::Running;
            inner.restart_attempts = 0;
        }
        self.persist_desired().await?;
        self.start_if_needed().await;
        Ok(self.status().await)
    }

    /// Set desired state to stopped, cancel any scheduled restart, and
    /// terminate the child with the request→SIGTERM→SIGKILL escalation.
    ///
    /// # Errors
    /// Propagates desired-state persistence failures.
    pub async fn stop(self: &Arc<Self>) -> Result<RuntimeStateRecord, SupervisorError> {
        let session = loop {
            let mut inner = self.inner.lock().await;
            if inner.stop_in_progress {
                return Ok(self.status_locked(&inner));
            }
            if inner.start_in_progress {
                // Let the in-flight start settle so the child it may be
                // producing does not escape this stop.
                let mut rx = self.op_seq.subscribe();
                let seen = *rx.borrow();
                drop(inner);
                let _ = tokio::time::timeout(
                    Duration::from_secs(30),
                    rx.wait_for(|seq| *seq > seen),
                )
                .await;
                continue;
            }
            inner.desired = DesiredState::Stopped;
            inner.stop_in_progress = true;
            inner.restart_pending = false;
            if let Some(task) = inner.restart_task.take() {
                task.abort();
            }
            let session = inner.session.clone();
            if session.is_some() {
                inner.phase = Phase::Stopping;
            }
            break session;
        };
        self.persist_desired().await?;
        self.persist_runtime().await;

        if let Some(session) = session {
            let exited = self.terminate_session(&session).await;
            session.channel.close();
            if !exited {
                let mut inner = self.inner.lock().await;
                inner.last_failure = Some("driver did not exit after SIGKILL".to_owned());
            }
        }

        {
            let mut inner = self.inner.lock().await;
            inner.stop_in_progress = false;
            inner.session = None;
            inner.phase = Phase::Absent;
        }
        self.persist_runtime().await;
        self.op_seq.send_modify(|seq| *seq += 1);
        Ok(self.status().await)
    }

    /// Terminate the child on daemon shutdown without touching desired
    /// state, so a restarted daemon resumes where it left off.
    pub async fn shutdown(self: &Arc<Self>) {
        let session = {
            let mut inner = self.inner.lock().await;
            inner.stop_in_progress = true;
            inner.restart_pending = false;
            if let Some(task) = inner.restart_task.take() {
                task.abort();
            }
            inner.session.take()
        };
        if let Some(session) = session {
            let _ = self.terminate_session(&session).await;
            session.channel.close();
        }
        let mut inner = self.inner.lock().await;
        inner.phase = Phase::Absent;
    }

    /// Current status snapshot.
    pub async fn status(&self) -> RuntimeStateRecord {
        let inner = self.inner.lock().await;
        self.status_locked(&inner)
    }

    /// Forward one RPC to the driver channel with the standard timeout.
    ///
    /// # Errors
    /// [`SupervisorError::DriverUnavailable`] without an authenticated
    /// channel; RPC failures record `lastFailure` and propagate without
    /// tearing the session down.
    pub async fn driver_exec(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, SupervisorError> {
        let channel = {
            let inner = self.inner.lock().await;
            match (&inner.session, inner.phase) {
                (Some(session), Phase::Connected) => session.channel.clone(),
                _ => return Err(SupervisorError::DriverUnavailable),
            }
        };
        match channel
            .call_with_timeout(method, params, DRIVER_EXEC_TIMEOUT)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.last_failure = Some(format!("driver rpc {method} failed: {e}"));
                }
                self.persist_runtime().await;
                Err(SupervisorError::Rpc(e))
            }
        }
    }

    /// Spawn the periodic reconcile tick: if the VM should be running but no
    /// child exists and no restart is scheduled, start one.
    #[must_use]
    pub fn spawn_reconcile(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let should_start = {
                    let inner = supervisor.inner.lock().await;
                    inner.desired == DesiredState::Running
                        && matches!(inner.phase, Phase::Absent | Phase::Exited)
                        && !inner.restart_pending
                        && !inner.start_in_progress
                        && !inner.stop_in_progress
                };
                if should_start {
                    supervisor.start_if_needed().await;
                }
            }
        })
    }

    // ── Start path ───────────────────────────────────────────────────────────

    /// Guarded start: at most one start is in flight at any time.
    fn start_if_needed(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if inner.start_in_progress || inner.stop_in_progress {
                return;
            }
            if inner.desired != DesiredState::Running {
                return;
            }
            if !matches!(inner.phase, Phase::Absent | Phase::Exited) {
                return;
            }
            inner.start_in_progress = true;
            inner.phase = Phase::Starting;
            inner.epoch += 1;
            inner.epoch
        };
        self.persist_runtime().await;

        match self.spawn_and_connect(epoch).await {
            Ok(session) => {
                let channel = session.channel.clone();
                let pid = session.pid;
                {
                    let mut inner = self.inner.lock().await;
                    inner.phase = Phase::Connected;
                    inner.connected_epoch = epoch;
                    inner.restart_attempts = 0;
                    inner.last_failure = None;
                    inner.session = Some(session);
                    inner.start_in_progress = false;
                }
                if let Err(e) = self.persist_desired().await {
                    tracing::warn!(error = %e, "failed to persist desired state");
                }
                self.persist_runtime().await;
                self.emit("driver.connected", json!({"pid": pid}));
                tracing::info!(pid, "driver connected and authenticated");

                let supervisor = Arc::clone(self);
                tokio::spawn(async move {
                    supervisor.heartbeat_loop(epoch, channel).await;
                });
            }
            Err(e) => {
                let failure = e.to_string();
                tracing::warn!(error = %failure, "driver start failed");
                {
                    let mut inner = self.inner.lock().await;
                    inner.phase = Phase::Absent;
                    inner.last_failure = Some(failure);
                    inner.start_in_progress = false;
                    inner.session = None;
                }
                if let Err(e) = self.persist_desired().await {
                    tracing::warn!(error = %e, "failed to persist desired state");
                }
                self.persist_runtime().await;
                self.schedule_restart().await;
            }
        }
        self.op_seq.send_modify(|seq| *seq += 1);
        })
    }

    /// Steps 1–7 of a driver start: socket prep, token, spawn, connect with
    /// retry, mutual handshake, handler installation. Any failure kills the
    /// child and cleans the socket before returning.
    fn spawn_and_connect(
        self: &Arc<Self>,
        epoch: u64,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<DriverSession, SupervisorError>> + Send + '_>,
    > {
        Box::pin(async move {
        tokio::fs::create_dir_all(&self.cfg.run_dir).await?;
        remove_stale_socket(&self.cfg.driver_socket_path).await;

        let token = generate_auth_token();
        let spec = LaunchSpec {
            socket_path: self.cfg.driver_socket_path.clone(),
            auth_token: token.clone(),
            log_path: self.cfg.driver_log_path.clone(),
        };
        let launched = self.launcher.launch(&spec).await?;
        let pid = launched.pid;
        let control = launched.control;

        let (exit_tx, exited_rx) = watch::channel(false);
        {
            let supervisor = Arc::clone(self);
            let exited = launched.exited;
            tokio::spawn(async move {
                let code = exited.await;
                let _ = exit_tx.send(true);
                supervisor.on_exit(epoch, code).await;
            });
        }

        let stream = match self.connect_with_retry().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = control.signal_kill();
                remove_stale_socket(&self.cfg.driver_socket_path).await;
                return Err(e);
            }
        };

        let (channel, interceptor) =
            RpcChannel::with_hello_interceptor(stream, IdRange::DaemonDescending);
        let handshake_cfg = HandshakeConfig {
            capabilities: string_vec(&DAEMON_DRIVER_CAPABILITIES),
            required: string_vec(&REQUIRED_DRIVER_CAPABILITIES),
            auth_token: Some(token.clone()),
            expected_token: Some(token.clone()),
        };
        let handshake_result: Result<(), ProtoError> = async {
            handshake::accept(&channel, interceptor, &handshake_cfg).await?;
            handshake::initiate(&channel, &handshake_cfg).await?;
            Ok(())
        }
        .await;
        if let Err(e) = handshake_result {
            channel.close();
            let _ = control.signal_kill();
            remove_stale_socket(&self.cfg.driver_socket_path).await;
            return Err(SupervisorError::Handshake(e.to_string()));
        }

        channel.set_handler(Arc::new(DriverChannelHandler {
            capabilities: string_vec(&DAEMON_DRIVER_CAPABILITIES),
            expected_token: token,
        }));

        Ok(DriverSession {
            channel,
            control,
            pid,
            exited_rx,
        })
        })
    }

    async fn connect_with_retry(&self) -> Result<UnixStream, SupervisorError> {
        let deadline = tokio::time::Instant::now() + CONNECT_DEADLINE;
        loop {
            match UnixStream::connect(&self.cfg.driver_socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(SupervisorError::Connect(format!(
                            "driver socket {} not reachable within {CONNECT_DEADLINE:?}: {e}",
                            self.cfg.driver_socket_path.display()
                        )));
                    }
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        }
    }

    // ── Exit and restart ─────────────────────────────────────────────────────

    async fn on_exit(self: &Arc<Self>, epoch: u64, code: Option<i32>) {
        let was_connected = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            inner.session = None;
            if matches!(inner.phase, Phase::Connected | Phase::Stopping) {
                inner.phase = Phase::Exited;
            }
            inner.connected_epoch == epoch
        };
        if !was_connected {
            // Failures before the handshake completed are handled by the
            // start path itself.
            return;
        }

        remove_stale_socket(&self.cfg.driver_socket_path).await;
        self.emit("driver.exited", json!({"code": code}));
        tracing::warn!(?code, "driver exited");

        let unexpected = {
            let mut inner = self.inner.lock().await;
            let unexpected =
                inner.desired == DesiredState::Running && !inner.stop_in_progress;
            if unexpected {
                inner.last_failure = Some(match code {
                    Some(code) => format!("driver exited unexpectedly with status {code}"),
                    None => "driver was killed by a signal".to_owned(),
                });
            }
            unexpected
        };
        if unexpected {
            if let Err(e) = self.persist_desired().await {
                tracing::warn!(error = %e, "failed to persist desired state");
            }
            self.persist_runtime().await;
            self.schedule_restart().await;
        } else {
            self.persist_runtime().await;
        }
    }

    async fn schedule_restart(self: &Arc<Self>) {
        enum Decision {
            Skip,
            Permanent(Option<String>),
            Schedule { attempt: u32, delay: Duration },
        }

        let decision = {
            let mut inner = self.inner.lock().await;
            if inner.desired != DesiredState::Running
                || inner.stop_in_progress
                || inner.restart_pending
            {
                Decision::Skip
            } else if inner.restart_attempts >= self.cfg.max_restart_attempts {
                inner.desired = DesiredState::Stopped;
                Decision::Permanent(inner.last_failure.clone())
            } else {
                inner.restart_attempts += 1;
                let attempt = inner.restart_attempts;
                let delay =
                    Duration::from_secs((1u64 << (attempt - 1)).min(MAX_RESTART_DELAY_SECS));
                inner.restart_pending = true;
                Decision::Schedule { attempt, delay }
            }
        };

        match decision {
            Decision::Skip => {}
            Decision::Permanent(last_failure) => {
                if let Err(e) = self.persist_desired().await {
                    tracing::warn!(error = %e, "failed to persist desired state");
                }
                self.persist_runtime().await;
                self.emit(
                    "driver.permanent_failure",
                    json!({
                        "attempts": self.cfg.max_restart_attempts,
                        "lastFailure": last_failure,
                    }),
                );
                tracing::error!(
                    attempts = self.cfg.max_restart_attempts,
                    "driver restart budget exhausted, giving up"
                );
            }
            Decision::Schedule { attempt, delay } => {
                self.persist_runtime().await;
                self.emit(
                    "driver.restart_scheduled",
                    json!({"attempt": attempt, "delaySeconds": delay.as_secs()}),
                );
                tracing::info!(attempt, delay_secs = delay.as_secs(), "driver restart scheduled");
                let supervisor = Arc::clone(self);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    {
                        let mut inner = supervisor.inner.lock().await;
                        inner.restart_pending = false;
                        inner.restart_task = None;
                    }
                    let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                        Box::pin(supervisor.start_if_needed());
                    fut.await;
                });
                self.inner.lock().await.restart_task = Some(handle);
            }
        }
    }

    // ── Stop escalation ──────────────────────────────────────────────────────

    /// Request stop, then escalate: 500 ms after the polite request, SIGTERM;
    /// 2 s later, SIGKILL; 2 s later, give up. Returns whether the child is
    /// known to have exited.
    async fn terminate_session(&self, session: &DriverSession) -> bool {
        {
            let channel = session.channel.clone();
            tokio::spawn(async move {
                let _ = channel
                    .call_with_timeout("shutdown", None, STOP_REQUEST_WAIT)
                    .await;
            });
        }
        if wait_exited(session, STOP_REQUEST_WAIT).await {
            return true;
        }
        tracing::info!("driver ignored stop request, sending SIGTERM");
        let _ = session.control.signal_terminate();
        if wait_exited(session, STOP_TERM_WAIT).await {
            return true;
        }
        tracing::warn!("driver ignored SIGTERM, sending SIGKILL");
        let _ = session.control.signal_kill();
        wait_exited(session, STOP_KILL_WAIT).await
    }

    // ── Heartbeat ────────────────────────────────────────────────────────────

    async fn heartbeat_loop(self: Arc<Self>, epoch: u64, channel: RpcChannel) {
        let mut consecutive_failures: u32 = 0;
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would ping during connection setup.
        interval.tick().await;
        loop {
            interval.tick().await;
            {
                let inner = self.inner.lock().await;
                if inner.epoch != epoch || inner.session.is_none() {
                    return;
                }
            }
            if channel.is_closed() {
                return;
            }
            match channel
                .call_with_timeout("ping", None, HEARTBEAT_TIMEOUT)
                .await
            {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        error = %e,
                        failures = consecutive_failures,
                        "driver heartbeat failed"
                    );
                    {
                        let mut inner = self.inner.lock().await;
                        if inner.epoch != epoch {
                            return;
                        }
                        inner.last_failure = Some(format!("heartbeat failed: {e}"));
                    }
                    self.persist_runtime().await;
                    if let Some(limit) = self.cfg.heartbeat.teardown_after {
                        if consecutive_failures >= limit {
                            tracing::warn!(limit, "heartbeat failure limit reached, closing channel");
                            channel.close();
                            return;
                        }
                    }
                }
            }
        }
    }

    // ── Persistence and status ───────────────────────────────────────────────

    fn status_locked(&self, inner: &Inner) -> RuntimeStateRecord {
        RuntimeStateRecord {
            desired: inner.desired,
            actual: if inner.phase == Phase::Connected {
                ActualState::Running
            } else {
                ActualState::Stopped
            },
            restart_attempts: inner.restart_attempts,
            restart_pending: inner.restart_pending,
            driver_pid: inner.session.as_ref().and_then(|s| s.pid),
            driver_socket_path: inner.session.as_ref().map(|_| {
                self.cfg.driver_socket_path.to_string_lossy().into_owned()
            }),
            last_failure: inner.last_failure.clone(),
        }
    }

    async fn persist_desired(&self) -> Result<(), SupervisorError> {
        let record = {
            let inner = self.inner.lock().await;
            DesiredStateRecord::new(inner.desired, inner.last_failure.clone())
        };
        write_json_atomic(&self.cfg.desired_state_path, &record).await?;
        Ok(())
    }

    /// Observational only; a persistence failure here must not disturb the
    /// state machine.
    async fn persist_runtime(&self) {
        let record = self.status().await;
        if let Err(e) = write_json_atomic(&self.cfg.runtime_state_path, &record).await {
            tracing::warn!(error = %e, "failed to persist runtime state");
        }
    }

    fn emit(&self, kind: &str, payload: Value) {
        (self.events)(Event::new(kind, payload));
    }

    pub(crate) fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }
}

/// Post-handshake handler for the driver channel: answers `ping` and
/// repeated `hello`, rejects everything else.
struct DriverChannelHandler {
    capabilities: Vec<String>,
    expected_token: String,
}

#[async_trait::async_trait]
impl InboundHandler for DriverChannelHandler {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcErrorObject> {
        match method {
            "ping" => Ok(json!({"ok": true, "ts": chrono_now()})),
            "hello" => {
                let params: HelloParams = serde_json::from_value(
                    params.ok_or_else(|| RpcErrorObject::invalid_params("hello params are required"))?,
                )
                .map_err(|e| RpcErrorObject::invalid_params(format!("malformed hello params: {e}")))?;
                let reply = handshake::validate_hello(
                    &params,
                    &self.capabilities,
                    Some(&self.expected_token),
                )?;
                serde_json::to_value(reply)
                    .map_err(|e| RpcErrorObject::internal(e.to_string()))
            }
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }
}

fn chrono_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

async fn wait_exited(session: &DriverSession, timeout: Duration) -> bool {
    let mut rx = session.exited_rx.clone();
    if *rx.borrow() {
        return true;
    }
    let result = tokio::time::timeout(timeout, rx.wait_for(|exited| *exited)).await;
    matches!(result, Ok(Ok(_)))
}

async fn remove_stale_socket(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove socket file"),
    }
}

fn string_vec(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_owned()).collect()
}

/// Fresh 128-bit base64url token (no padding), one per driver spawn.
fn generate_auth_token() -> String {
    use base64::Engine as _;
    use rand::RngCore as _;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
