//! Driver child-process supervision for gaovm.
//!
//! The supervisor owns at most one hypervisor-driver child: it spawns the
//! binary with a fresh per-invocation auth token, performs the mutual
//! handshake over the driver socket, runs heartbeats, observes exits, and
//! applies the bounded exponential-backoff restart policy.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod doctor;
pub mod error;
pub mod launcher;
pub mod supervisor;

pub use doctor::DoctorReport;
pub use error::SupervisorError;
pub use launcher::{
    BinaryDriverLauncher, DriverControl, DriverLauncher, ExitFuture, LaunchSpec, LaunchedDriver,
};
pub use supervisor::{DriverSupervisor, HeartbeatPolicy, SupervisorConfig};
