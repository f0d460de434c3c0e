//! Error types for the supervisor crate.

use gaovm_proto::ProtoError;
use gaovm_store::StoreError;

/// Errors that can occur during driver lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// The driver binary could not be started.
    #[error("driver spawn failed: {0}")]
    Spawn(String),

    /// The driver socket never became reachable.
    #[error("driver connect failed: {0}")]
    Connect(String),

    /// The mutual `hello` exchange with the driver was rejected.
    #[error("driver handshake failed: {0}")]
    Handshake(String),

    /// An RPC was attempted while no authenticated driver channel exists.
    #[error("driver is not connected")]
    DriverUnavailable,

    /// An error propagated from the RPC channel.
    #[error(transparent)]
    Rpc(#[from] ProtoError),

    /// An error propagated from the persistence layer.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
