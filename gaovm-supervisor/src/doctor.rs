//! Environment diagnostics for the `doctor` RPC.

use serde::Serialize;

use gaovm_store::RuntimeStateRecord;

use crate::launcher::binary_exists;
use crate::supervisor::DriverSupervisor;

/// Snapshot of everything that commonly goes wrong in a deployment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorReport {
    pub driver_bin: String,
    pub driver_bin_exists: bool,
    pub driver_socket: String,
    pub driver_socket_exists: bool,
    pub state_dir: String,
    pub state_dir_exists: bool,
    pub status: RuntimeStateRecord,
}

impl DriverSupervisor {
    /// Collect the diagnostics snapshot.
    pub async fn doctor(&self) -> DoctorReport {
        let cfg = self.config();
        DoctorReport {
            driver_bin: cfg.driver_bin.to_string_lossy().into_owned(),
            driver_bin_exists: binary_exists(&cfg.driver_bin),
            driver_socket: cfg.driver_socket_path.to_string_lossy().into_owned(),
            driver_socket_exists: cfg.driver_socket_path.exists(),
            state_dir: cfg.state_dir.to_string_lossy().into_owned(),
            state_dir_exists: cfg.state_dir.is_dir(),
            status: self.status().await,
        }
    }
}
