//! Error types for the driver crate.

use std::path::PathBuf;
use std::time::Duration;

use gaovm_proto::ProtoError;

/// Conditions under which the driver gives up and exits non-zero.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DriverError {
    /// The control socket could not be created.
    #[error("failed to bind control socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The daemon closed the control socket.
    #[error("control socket closed by daemon")]
    ControlEof,

    /// No authenticated daemon RPC arrived within the idle window.
    #[error("no daemon rpc within {0:?} after handshake")]
    IdleTimeout(Duration),

    /// An error propagated from the RPC channel or handshake.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
