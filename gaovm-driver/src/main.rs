//! Entry point for the `gaovm-driver` binary.
//!
//! The auth token comes from the `AUTH_TOKEN` environment variable only; a
//! `--auth-token` flag is refused so the secret can never land in `ps`
//! output or shell history.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gaovm_driver::{run, DriverOptions, IDLE_TIMEOUT};
use gaovm_store::RotatingLogSink;

/// gaovm hypervisor driver.
#[derive(Parser)]
#[command(name = "gaovm-driver", version, about)]
struct Args {
    /// Control socket to listen on for the daemon.
    #[arg(long)]
    socket_path: PathBuf,

    /// Refused. The token must come from the AUTH_TOKEN environment
    /// variable.
    #[arg(long, hide = true)]
    auth_token: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.auth_token.is_some() {
        eprintln!("error: --auth-token is not accepted; pass the token via AUTH_TOKEN");
        return ExitCode::from(2);
    }
    let Ok(auth_token) = std::env::var("AUTH_TOKEN") else {
        eprintln!("error: AUTH_TOKEN is not set");
        return ExitCode::from(2);
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let log = std::env::var("DRIVER_LOG_PATH")
        .ok()
        .and_then(|path| match RotatingLogSink::open(path) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                tracing::warn!(error = %e, "cannot open driver log, continuing without it");
                None
            }
        });

    let opts = DriverOptions {
        socket_path: args.socket_path,
        auth_token,
        idle_timeout: IDLE_TIMEOUT,
        log,
    };
    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "driver exiting");
            ExitCode::from(1)
        }
    }
}
