//! Desired-state and runtime-state records.
//!
//! The desired record is authoritative and is re-read at daemon start; the
//! runtime record is observational only and is never read back to drive
//! behavior.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

/// What the supervisor currently observes, collapsed for external viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActualState {
    Running,
    Stopped,
}

/// Persisted to `desired_state.json` whenever `desired` or the
/// terminal-failure status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredStateRecord {
    pub desired: DesiredState,
    pub last_failure: Option<String>,
    pub max_restart_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl DesiredStateRecord {
    #[must_use]
    pub fn new(desired: DesiredState, last_failure: Option<String>) -> Self {
        Self {
            desired,
            last_failure,
            max_restart_attempts: 5,
            updated_at: Utc::now(),
        }
    }
}

/// Persisted to `daemon_state.json` on every supervisor state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStateRecord {
    pub desired: DesiredState,
    pub actual: ActualState,
    pub restart_attempts: u32,
    pub restart_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_socket_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_record_pins_max_restart_attempts() {
        let record = DesiredStateRecord::new(DesiredState::Running, None);
        assert_eq!(record.max_restart_attempts, 5);
    }

    #[test]
    fn states_serialize_lowercase() {
        assert_eq!(
            serde_json::to_value(DesiredState::Running).expect("serialize"),
            serde_json::json!("running")
        );
        assert_eq!(
            serde_json::to_value(ActualState::Stopped).expect("serialize"),
            serde_json::json!("stopped")
        );
    }

    #[test]
    fn runtime_record_omits_absent_driver_fields() {
        let record = RuntimeStateRecord {
            desired: DesiredState::Stopped,
            actual: ActualState::Stopped,
            restart_attempts: 0,
            restart_pending: false,
            driver_pid: None,
            driver_socket_path: None,
            last_failure: None,
        };
        let value = serde_json::to_value(&record).expect("serialize");
        assert!(value.get("driverPid").is_none(), "absent pid must be omitted");
        assert_eq!(value["restartAttempts"], 0);
    }
}
