//! Restart-policy tests against mock launchers, under a paused clock so the
//! full 1/2/4/8/16-second backoff ladder runs in milliseconds of real time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use gaovm_proto::message::{Event, EventSink};
use gaovm_store::{DesiredState, StateLayout};
use gaovm_supervisor::{
    DriverControl, DriverLauncher, DriverSupervisor, LaunchSpec, LaunchedDriver, SupervisorConfig,
    SupervisorError,
};

struct NoopControl;

impl DriverControl for NoopControl {
    fn signal_terminate(&self) -> std::io::Result<()> {
        Ok(())
    }
    fn signal_kill(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A driver that dies instantly and never binds its socket.
struct CrashingLauncher {
    spawns: Arc<AtomicU32>,
}

#[async_trait]
impl DriverLauncher for CrashingLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> Result<LaunchedDriver, SupervisorError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(LaunchedDriver {
            pid: Some(4242),
            control: Arc::new(NoopControl),
            exited: Box::pin(async { Some(1) }),
        })
    }
}

/// A launcher that tracks how many launches overlap.
struct GatedLauncher {
    spawns: Arc<AtomicU32>,
    in_flight: Arc<AtomicU32>,
    max_in_flight: Arc<AtomicU32>,
}

#[async_trait]
impl DriverLauncher for GatedLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> Result<LaunchedDriver, SupervisorError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Err(SupervisorError::Spawn("gated launcher always fails".to_owned()))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    supervisor: Arc<DriverSupervisor>,
    events: mpsc::UnboundedReceiver<Event>,
}

fn fixture(launcher: Arc<dyn DriverLauncher>) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = StateLayout::new(dir.path().join("state"));
    layout.ensure_dirs().expect("ensure_dirs");
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: EventSink = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    let cfg = SupervisorConfig::from_layout(&layout, "/nonexistent/gaovm-driver".into());
    Fixture {
        supervisor: DriverSupervisor::new(cfg, launcher, sink),
        events: rx,
        _dir: dir,
    }
}

#[tokio::test(start_paused = true)]
async fn failing_driver_exhausts_restart_budget_with_exponential_delays() {
    let spawns = Arc::new(AtomicU32::new(0));
    let mut fx = fixture(Arc::new(CrashingLauncher {
        spawns: Arc::clone(&spawns),
    }));

    fx.supervisor.start().await.expect("start");

    let mut scheduled_delays = Vec::new();
    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(600), fx.events.recv())
            .await
            .expect("event stream went quiet before permanent failure")
            .expect("event channel closed");
        match event.kind.as_str() {
            "driver.restart_scheduled" => {
                scheduled_delays.push(event.payload["delaySeconds"].as_u64().expect("delaySeconds"));
            }
            "driver.permanent_failure" => break,
            _ => {}
        }
    }

    assert_eq!(
        scheduled_delays,
        vec![1, 2, 4, 8, 16],
        "exactly five restarts with exponential delays"
    );
    assert_eq!(
        spawns.load(Ordering::SeqCst),
        6,
        "initial attempt plus five restarts"
    );

    let status = fx.supervisor.status().await;
    assert_eq!(status.desired, DesiredState::Stopped, "permanent failure flips desired");
    assert_eq!(status.restart_attempts, 5);
    assert!(status.last_failure.is_some(), "lastFailure must be recorded");
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_recoverable_by_explicit_start() {
    let spawns = Arc::new(AtomicU32::new(0));
    let mut fx = fixture(Arc::new(CrashingLauncher {
        spawns: Arc::clone(&spawns),
    }));

    fx.supervisor.start().await.expect("start");
    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(600), fx.events.recv())
            .await
            .expect("event stream went quiet")
            .expect("event channel closed");
        if event.kind == "driver.permanent_failure" {
            break;
        }
    }

    // An explicit start resets the budget and tries again.
    let status = fx.supervisor.start().await.expect("restart");
    assert_eq!(status.desired, DesiredState::Running);
    assert!(
        spawns.load(Ordering::SeqCst) > 6,
        "explicit start must spawn again after permanent failure"
    );

    fx.supervisor.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_keep_at_most_one_launch_in_flight() {
    let spawns = Arc::new(AtomicU32::new(0));
    let in_flight = Arc::new(AtomicU32::new(0));
    let max_in_flight = Arc::new(AtomicU32::new(0));
    let fx = fixture(Arc::new(GatedLauncher {
        spawns: Arc::clone(&spawns),
        in_flight: Arc::clone(&in_flight),
        max_in_flight: Arc::clone(&max_in_flight),
    }));

    let a = {
        let supervisor = Arc::clone(&fx.supervisor);
        tokio::spawn(async move { supervisor.start().await })
    };
    let b = {
        let supervisor = Arc::clone(&fx.supervisor);
        tokio::spawn(async move { supervisor.start().await })
    };

    let status_a = a.await.expect("task a").expect("start a");
    let status_b = b.await.expect("task b").expect("start b");
    assert_eq!(status_a.desired, DesiredState::Running);
    assert_eq!(status_b.desired, DesiredState::Running);

    assert_eq!(
        max_in_flight.load(Ordering::SeqCst),
        1,
        "lifecycle operations must be serialized"
    );
    assert!(spawns.load(Ordering::SeqCst) >= 1);

    fx.supervisor.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_scheduled_restart() {
    let spawns = Arc::new(AtomicU32::new(0));
    let mut fx = fixture(Arc::new(CrashingLauncher {
        spawns: Arc::clone(&spawns),
    }));

    fx.supervisor.start().await.expect("start");
    // Wait for the first restart to be scheduled, then stop.
    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(60), fx.events.recv())
            .await
            .expect("event stream went quiet")
            .expect("event channel closed");
        if event.kind == "driver.restart_scheduled" {
            break;
        }
    }
    fx.supervisor.stop().await.expect("stop");
    let spawns_at_stop = spawns.load(Ordering::SeqCst);

    // Let plenty of virtual time pass; the cancelled timer must not fire.
    tokio::time::sleep(std::time::Duration::from_secs(120)).await;
    assert_eq!(
        spawns.load(Ordering::SeqCst),
        spawns_at_stop,
        "no further spawns after stop"
    );
    let status = fx.supervisor.status().await;
    assert_eq!(status.desired, DesiredState::Stopped);
    assert!(!status.restart_pending);
}

#[tokio::test]
async fn driver_exec_without_driver_reports_unavailable() {
    let fx = fixture(Arc::new(CrashingLauncher {
        spawns: Arc::new(AtomicU32::new(0)),
    }));
    let err = fx
        .supervisor
        .driver_exec("vm.status", None)
        .await
        .expect_err("must fail without a driver");
    assert!(
        matches!(err, SupervisorError::DriverUnavailable),
        "got {err}"
    );
}
