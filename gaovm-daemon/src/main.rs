//! Entry point for the `gaovmd` daemon.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use gaovm_daemon::{DaemonError, DaemonServer, DaemonState, EventBus};
use gaovm_store::{ConfigStore, RotatingLogSink, StateLayout};
use gaovm_supervisor::{BinaryDriverLauncher, DriverSupervisor, SupervisorConfig};

/// gaovm daemon — local VM manager control plane.
#[derive(Parser)]
#[command(name = "gaovmd", version, about)]
struct Args {
    /// Path of the client-facing socket; derived from the state directory
    /// when omitted.
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Directory holding configuration, state records, sockets, and logs.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Path of the hypervisor driver binary.
    #[arg(long, default_value = "gaovm-driver")]
    driver_bin: PathBuf,

    /// Enable debug logging on stderr.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "daemon failed");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run(args: Args) -> Result<(), DaemonError> {
    let layout = args
        .state_dir
        .map_or_else(StateLayout::default_dir, StateLayout::new);
    layout.ensure_dirs()?;

    let daemon_log = Arc::new(RotatingLogSink::open(layout.daemon_log_path())?);
    let driver_log = Arc::new(RotatingLogSink::open(layout.driver_log_path())?);

    let events = EventBus::new(daemon_log);
    let store = ConfigStore::new(layout.clone(), events.sink());

    let launcher = Arc::new(BinaryDriverLauncher::new(args.driver_bin.clone(), driver_log));
    let supervisor = DriverSupervisor::new(
        SupervisorConfig::from_layout(&layout, args.driver_bin),
        launcher,
        events.sink(),
    );
    supervisor.load_persisted_desired().await;
    let reconcile = supervisor.spawn_reconcile();

    let socket_path = args
        .socket_path
        .unwrap_or_else(|| layout.daemon_socket_path());
    let state = Arc::new(DaemonState {
        store,
        supervisor: Arc::clone(&supervisor),
        events,
    });
    let server = DaemonServer::bind(state, &socket_path)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.serve(shutdown_rx).await?;

    reconcile.abort();
    supervisor.shutdown().await;
    tracing::info!("daemon stopped");
    Ok(())
}
