//! Error types for the daemon crate, and their mapping onto JSON-RPC error
//! objects.

use std::path::PathBuf;

use gaovm_proto::message::RpcErrorObject;
use gaovm_proto::ProtoError;
use gaovm_store::StoreError;
use gaovm_supervisor::SupervisorError;

/// Errors that can occur while running the daemon.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DaemonError {
    /// The listener socket could not be created.
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An error propagated from the supervisor.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// An error propagated from the persistence layer.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Map a store failure onto the wire: validation errors become −32602 with
/// the offending field's message, everything else is internal.
#[must_use]
pub fn store_error_to_rpc(err: &StoreError) -> RpcErrorObject {
    match err {
        StoreError::Config(config) => RpcErrorObject::invalid_params(config.to_string()),
        other => RpcErrorObject::internal(other.to_string()),
    }
}

/// Map a supervisor failure onto the wire. Driver-side RPC errors and an
/// unavailable driver both surface as internal errors per the error policy.
#[must_use]
pub fn supervisor_error_to_rpc(err: &SupervisorError) -> RpcErrorObject {
    match err {
        SupervisorError::Rpc(ProtoError::Remote { code, message, .. }) => {
            RpcErrorObject::internal(format!("driver error {code}: {message}"))
        }
        SupervisorError::Store(store) => store_error_to_rpc(store),
        other => RpcErrorObject::internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use gaovm_proto::message::{ERR_INTERNAL, ERR_INVALID_PARAMS};
    use gaovm_store::VmConfig;

    use super::*;

    #[test]
    fn config_validation_maps_to_invalid_params() {
        let config_err = VmConfig::validate(&serde_json::json!({"cpu": 0}))
            .expect_err("cpu-less config must not validate");
        let rpc = store_error_to_rpc(&StoreError::Config(config_err));
        assert_eq!(rpc.code, ERR_INVALID_PARAMS);
        assert!(rpc.message.contains("cpu"), "message must name the field: {}", rpc.message);
    }

    #[test]
    fn unavailable_driver_maps_to_internal() {
        let rpc = supervisor_error_to_rpc(&SupervisorError::DriverUnavailable);
        assert_eq!(rpc.code, ERR_INTERNAL);
    }
}
