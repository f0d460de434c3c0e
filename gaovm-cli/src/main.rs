//! Entry point for the `gaovm` client tool.
//!
//! Exit codes: 0 on success, 1 on runtime errors, 2 on usage errors
//! (including malformed `--json` input).

mod client;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use client::{CliError, DaemonClient};
use gaovm_store::StateLayout;

/// gaovm — local VM manager client.
#[derive(Parser)]
#[command(name = "gaovm", version, about)]
struct Args {
    /// Daemon socket; defaults to the state directory's run/daemon.sock.
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Enable debug logging on stderr.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check daemon liveness.
    Ping,
    /// Show VM status.
    Status,
    /// List VMs.
    List,
    /// Start the VM (activates any pending configuration first).
    Start,
    /// Stop the VM.
    Stop,
    /// Subscribe and stream events until interrupted.
    Events,
    /// Show environment diagnostics.
    Doctor,
    /// Forward a raw method to the hypervisor driver.
    DriverExec {
        /// Driver method name.
        #[arg(long)]
        method: String,
        /// JSON value passed as the method's params.
        #[arg(long)]
        params_json: Option<String>,
    },
    /// Print current and pending configuration.
    ConfigGet,
    /// Replace the full configuration.
    ConfigSet {
        /// The complete configuration object.
        #[arg(long)]
        json: String,
    },
    /// Apply a sparse configuration patch.
    ConfigPatch {
        /// The patch object.
        #[arg(long)]
        json: String,
    },
    /// Open the VM display window.
    OpenDisplay,
    /// Close the VM display window.
    CloseDisplay,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Usage(message)) => {
            eprintln!("error: {message}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let socket_path = args
        .socket_path
        .unwrap_or_else(|| StateLayout::default_dir().daemon_socket_path());
    let mut client = DaemonClient::connect(&socket_path).await?;

    let result = match args.command {
        Command::Ping => client.call("ping", None).await?,
        Command::Status => client.call("vm.status", None).await?,
        Command::List => client.call("list_vms", None).await?,
        Command::Start => client.call("vm.start", None).await?,
        Command::Stop => client.call("vm.stop", None).await?,
        Command::Doctor => client.call("doctor", None).await?,
        Command::ConfigGet => client.call("vm.config.get", None).await?,
        Command::ConfigSet { json } => {
            let config = parse_json_object(&json)?;
            client
                .call("vm.config.set", Some(json!({"config": config})))
                .await?
        }
        Command::ConfigPatch { json } => {
            let patch = parse_json_object(&json)?;
            client
                .call("vm.config.patch", Some(json!({"patch": patch})))
                .await?
        }
        Command::DriverExec { method, params_json } => {
            let params = params_json
                .as_deref()
                .map(parse_json_value)
                .transpose()?;
            client
                .call(
                    "driver.exec",
                    Some(json!({"method": method, "params": params})),
                )
                .await?
        }
        Command::OpenDisplay => client.call("vm.open_display", None).await?,
        Command::CloseDisplay => client.call("vm.close_display", None).await?,
        Command::Events => return stream_events(&mut client).await,
    };

    print_value(&result);
    Ok(())
}

async fn stream_events(client: &mut DaemonClient) -> Result<(), CliError> {
    client.call("subscribe_events", None).await?;
    eprintln!("subscribed; streaming events (ctrl-c to stop)");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = client.next_event() => match event {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "unprintable event"),
                },
                None => {
                    eprintln!("daemon closed the connection");
                    return Ok(());
                }
            }
        }
    }
}

fn parse_json_object(raw: &str) -> Result<Value, CliError> {
    let value = parse_json_value(raw)?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(CliError::Usage(format!(
            "--json expects a JSON object, got: {raw}"
        )))
    }
}

fn parse_json_value(raw: &str) -> Result<Value, CliError> {
    serde_json::from_str(raw).map_err(|e| CliError::Usage(format!("invalid JSON: {e}")))
}
