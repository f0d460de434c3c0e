//! The gaovm hypervisor driver.
//!
//! The driver is a short-lived child of the daemon: it listens on the
//! driver socket, performs the mutual token handshake, serves the daemon's
//! control methods, and honors the liveness contract — exit non-zero when
//! the control socket reports EOF or when no authenticated daemon RPC has
//! arrived within the idle window after the handshake.
//!
//! Building the actual hypervisor VM object (boot loader, disk attachment,
//! graphics window) lives behind this runtime and is stubbed here.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod runtime;

pub use error::DriverError;
pub use runtime::{run, DriverOptions, IDLE_TIMEOUT};
