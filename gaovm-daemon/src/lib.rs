//! The gaovm control-plane daemon.
//!
//! Accepts client connections on a local Unix socket, gates every session
//! behind the `hello` handshake, routes RPC methods to the driver
//! supervisor and the config store, and fans lifecycle/config events out to
//! subscribed sessions.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod events;
pub mod server;
pub mod session;

pub use error::DaemonError;
pub use events::EventBus;
pub use server::{DaemonServer, DaemonState};
pub use session::Session;
