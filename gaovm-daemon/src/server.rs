//! The Unix-socket listener and shared daemon state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::watch;

use gaovm_store::ConfigStore;
use gaovm_supervisor::DriverSupervisor;

use crate::error::DaemonError;
use crate::events::EventBus;
use crate::session::Session;

/// Everything a session needs, shared across connections.
pub struct DaemonState {
    pub store: ConfigStore,
    pub supervisor: Arc<DriverSupervisor>,
    pub events: Arc<EventBus>,
}

/// The client-facing listener.
pub struct DaemonServer {
    listener: UnixListener,
    state: Arc<DaemonState>,
    socket_path: PathBuf,
    next_session: AtomicU64,
}

impl DaemonServer {
    /// Bind the listener, removing any stale socket file first. The parent
    /// directory must already exist.
    ///
    /// # Errors
    /// Returns [`DaemonError::Bind`] when the socket cannot be created.
    pub fn bind(state: Arc<DaemonState>, socket_path: &Path) -> Result<Self, DaemonError> {
        match socket_path.parent() {
            Some(parent) if parent.is_dir() => {}
            _ => {
                return Err(DaemonError::Bind {
                    path: socket_path.to_owned(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "parent directory does not exist",
                    ),
                });
            }
        }
        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }
        let listener = UnixListener::bind(socket_path).map_err(|source| DaemonError::Bind {
            path: socket_path.to_owned(),
            source,
        })?;
        tracing::info!(path = %socket_path.display(), "daemon listening");
        Ok(Self {
            listener,
            state,
            socket_path: socket_path.to_owned(),
            next_session: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the shutdown signal flips, then remove the
    /// socket file.
    ///
    /// # Errors
    /// Currently infallible past bind; the signature leaves room for fatal
    /// accept-loop conditions.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DaemonError> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                        Session::spawn(id, Arc::clone(&self.state), stream);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("listener closed");
        Ok(())
    }
}
