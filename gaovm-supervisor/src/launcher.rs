//! The driver-launch seam.
//!
//! [`DriverLauncher`] abstracts how the driver child comes to exist, so the
//! supervisor's restart and escalation policy can be exercised against mock
//! drivers in tests. [`BinaryDriverLauncher`] is the real thing: it spawns
//! the configured driver binary with the socket path on the command line and
//! the auth token in the environment, and pipes the child's stdout/stderr
//! into the rotating driver log.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use gaovm_store::{LogLevel, RotatingLogSink};

use crate::error::SupervisorError;

/// Resolves with the child's exit code (`None` when killed by a signal).
pub type ExitFuture = Pin<Box<dyn Future<Output = Option<i32>> + Send>>;

/// Everything the supervisor passes to a driver spawn.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Where the driver must listen for the daemon's connection.
    pub socket_path: PathBuf,
    /// Fresh 128-bit per-invocation secret, shared via `AUTH_TOKEN` only.
    pub auth_token: String,
    /// Target for the driver's own structured log (`DRIVER_LOG_PATH`).
    pub log_path: PathBuf,
}

/// Signal-level control over a launched driver.
///
/// Signals address the process by PID, so control outlives the exclusive
/// `wait` ownership held by the exit watcher.
pub trait DriverControl: Send + Sync {
    /// Request graceful termination (SIGTERM).
    ///
    /// # Errors
    /// Propagates the signal delivery failure.
    fn signal_terminate(&self) -> io::Result<()>;

    /// Force termination (SIGKILL).
    ///
    /// # Errors
    /// Propagates the signal delivery failure.
    fn signal_kill(&self) -> io::Result<()>;
}

/// A freshly spawned driver child.
pub struct LaunchedDriver {
    pub pid: Option<u32>,
    pub control: Arc<dyn DriverControl>,
    /// Resolves exactly once, when the child exits.
    pub exited: ExitFuture,
}

/// How driver children are brought into existence.
#[async_trait]
pub trait DriverLauncher: Send + Sync + 'static {
    /// Spawn one driver child per the launch spec.
    ///
    /// # Errors
    /// Returns [`SupervisorError::Spawn`] when the child cannot be started.
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedDriver, SupervisorError>;
}

/// Spawns the real driver binary.
pub struct BinaryDriverLauncher {
    driver_bin: PathBuf,
    log: Arc<RotatingLogSink>,
}

impl BinaryDriverLauncher {
    #[must_use]
    pub fn new(driver_bin: PathBuf, log: Arc<RotatingLogSink>) -> Self {
        Self { driver_bin, log }
    }
}

#[async_trait]
impl DriverLauncher for BinaryDriverLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedDriver, SupervisorError> {
        if !binary_exists(&self.driver_bin) {
            return Err(SupervisorError::Spawn(format!(
                "driver binary not found at {}",
                self.driver_bin.display()
            )));
        }

        let mut child = Command::new(&self.driver_bin)
            .arg("--socket-path")
            .arg(&spec.socket_path)
            .env("AUTH_TOKEN", &spec.auth_token)
            .env("DRIVER_LOG_PATH", &spec.log_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SupervisorError::Spawn(format!("exec {}: {e}", self.driver_bin.display()))
            })?;

        let pid = child.id();
        tracing::info!(pid, bin = %self.driver_bin.display(), "driver spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(copy_lines(stdout, Arc::clone(&self.log), LogLevel::Info));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(copy_lines(stderr, Arc::clone(&self.log), LogLevel::Warn));
        }

        let control: Arc<dyn DriverControl> = Arc::new(PidControl { pid });
        let exited: ExitFuture =
            Box::pin(async move { child.wait().await.ok().and_then(|status| status.code()) });

        Ok(LaunchedDriver { pid, control, exited })
    }
}

/// Copy one std stream of the child into the rotating log, line by line.
async fn copy_lines<R>(reader: R, log: Arc<RotatingLogSink>, level: LogLevel)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = log.append(level, &line);
    }
}

struct PidControl {
    pid: Option<u32>,
}

impl DriverControl for PidControl {
    fn signal_terminate(&self) -> io::Result<()> {
        send_signal(self.pid, libc::SIGTERM)
    }

    fn signal_kill(&self) -> io::Result<()> {
        send_signal(self.pid, libc::SIGKILL)
    }
}

fn send_signal(pid: Option<u32>, signal: i32) -> io::Result<()> {
    let Some(pid) = pid else {
        return Ok(());
    };
    #[allow(clippy::cast_possible_wrap)]
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Check that a binary exists at the given path, or anywhere on `PATH` when
/// the path is a bare name.
#[must_use]
pub fn binary_exists(path: &Path) -> bool {
    if path.is_absolute() || path.components().count() > 1 {
        return path.exists();
    }
    std::env::var("PATH")
        .unwrap_or_default()
        .split(':')
        .map(|dir| Path::new(dir).join(path))
        .any(|candidate| candidate.exists())
}
