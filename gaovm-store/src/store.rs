//! The configuration store: current and pending VM config.
//!
//! Invariant: `config.json` is always valid or absent; `pending_config.json`
//! is either absent or valid and differs from current in at least one
//! restart-required field. While the VM runs, restart-required changes are
//! staged to the pending file and promoted on the next start.
//!
//! The store emits events through an injected callback; it knows nothing
//! about subscribers.

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use gaovm_proto::message::{Event, EventSink};

use crate::atomic::write_json_atomic;
use crate::config::{deep_merge, VmConfig};
use crate::error::StoreError;
use crate::paths::StateLayout;

/// Result of a `set` or `patch` operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetOutcome {
    /// Whether the change landed in the current config.
    pub applied: bool,
    /// Whether the change was staged for the next restart instead.
    pub restart_required: bool,
    /// Whether an existing pending config was replaced.
    pub pending_replaced: bool,
    pub current: VmConfig,
    pub pending: Option<VmConfig>,
}

/// Owner of `config.json` and `pending_config.json`.
pub struct ConfigStore {
    layout: StateLayout,
    events: EventSink,
    // Serialises read-modify-write cycles across concurrent sessions.
    lock: Mutex<()>,
}

impl ConfigStore {
    #[must_use]
    pub fn new(layout: StateLayout, events: EventSink) -> Self {
        Self {
            layout,
            events,
            lock: Mutex::new(()),
        }
    }

    /// The committed configuration; a hard-coded default when no file exists.
    ///
    /// # Errors
    /// Propagates I/O failures and validation failures of a corrupt file.
    pub async fn current(&self) -> Result<VmConfig, StoreError> {
        Ok(read_config_file(&self.layout.config_path())
            .await?
            .unwrap_or_default())
    }

    /// The staged configuration, if any.
    ///
    /// # Errors
    /// Propagates I/O failures and validation failures of a corrupt file.
    pub async fn pending(&self) -> Result<Option<VmConfig>, StoreError> {
        read_config_file(&self.layout.pending_config_path()).await
    }

    /// Validate and apply a complete replacement configuration.
    ///
    /// When the VM is running and the diff against current touches a
    /// restart-required field, the new config is staged to the pending file
    /// and current stays untouched. Otherwise it lands in current (and, when
    /// the VM is stopped, clears any stale pending file).
    ///
    /// # Errors
    /// Validation failures carry the first offending field; I/O failures
    /// propagate.
    pub async fn set(&self, next: &Value, is_running: bool) -> Result<SetOutcome, StoreError> {
        let _guard = self.lock.lock().await;
        self.set_locked(next, is_running).await
    }

    /// Validate and deep-merge a sparse patch, then apply with the same
    /// semantics as [`set`](Self::set). The merge base is the pending config
    /// when the VM is running and one exists, else current.
    ///
    /// # Errors
    /// Validation failures carry the first offending field; I/O failures
    /// propagate.
    pub async fn patch(&self, patch: &Value, is_running: bool) -> Result<SetOutcome, StoreError> {
        let _guard = self.lock.lock().await;
        VmConfig::validate_patch(patch)?;
        let base = if is_running {
            match self.pending().await? {
                Some(pending) => pending,
                None => self.current().await?,
            }
        } else {
            self.current().await?
        };
        let merged = deep_merge(&serde_json::to_value(&base)?, patch);
        self.set_locked(&merged, is_running).await
    }

    /// Promote a staged configuration to current, if one exists. Invoked on
    /// the stopped→start transition. Returns whether activation occurred.
    ///
    /// # Errors
    /// Propagates I/O and validation failures.
    pub async fn activate_pending_if_present(&self) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let Some(pending) = self.pending().await? else {
            return Ok(false);
        };
        write_json_atomic(&self.layout.config_path(), &pending).await?;
        remove_if_exists(&self.layout.pending_config_path()).await?;
        self.emit(
            "config.pending_applied",
            json!({"config": serde_json::to_value(&pending)?}),
        );
        tracing::info!("pending configuration activated");
        Ok(true)
    }

    async fn set_locked(&self, next: &Value, is_running: bool) -> Result<SetOutcome, StoreError> {
        let next_config = VmConfig::validate(next)?;
        let current = self.current().await?;
        let changed = current.changed_restart_fields(&next_config);

        if is_running && !changed.is_empty() {
            let had_pending = self.pending().await?.is_some();
            write_json_atomic(&self.layout.pending_config_path(), &next_config).await?;
            let kind = if had_pending {
                "pending_config_replaced"
            } else {
                "pending_config_written"
            };
            self.emit(kind, json!({"fields": changed}));
            tracing::info!(fields = ?changed, replaced = had_pending, "restart-required change staged");
            return Ok(SetOutcome {
                applied: false,
                restart_required: true,
                pending_replaced: had_pending,
                current,
                pending: Some(next_config),
            });
        }

        write_json_atomic(&self.layout.config_path(), &next_config).await?;
        if !is_running {
            remove_if_exists(&self.layout.pending_config_path()).await?;
        }
        self.emit("config.updated", json!({"config": next}));
        tracing::info!("configuration updated");
        let pending = self.pending().await?;
        Ok(SetOutcome {
            applied: true,
            restart_required: false,
            pending_replaced: false,
            current: next_config,
            pending,
        })
    }

    fn emit(&self, kind: &str, payload: Value) {
        (self.events)(Event::new(kind, payload));
    }
}

async fn read_config_file(path: &std::path::Path) -> Result<Option<VmConfig>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let value: Value = serde_json::from_slice(&bytes)?;
            Ok(Some(VmConfig::validate(&value)?))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_exists(path: &std::path::Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
