//! Layout of the daemon's state directory.
//!
//! ```text
//! <state-dir>/
//!   config.json              current VM config
//!   pending_config.json      staged config, absent when none
//!   desired_state.json       desired/lastFailure record
//!   daemon_state.json        observational runtime record
//!   run/daemon.sock          client-facing socket
//!   run/driver.sock          driver-facing socket, recreated per spawn
//!   logs/daemon.log[.1..3]   rotated daemon log
//!   logs/driver.log[.1..3]   rotated driver log
//! ```

use std::path::{Path, PathBuf};

/// Resolved paths under one state directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    state_dir: PathBuf,
}

impl StateLayout {
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Default state directory: `$HOME/.gaovm` (falling back to `/tmp/gaovm`
    /// when `HOME` is unset).
    #[must_use]
    pub fn default_dir() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_owned());
        Self::new(PathBuf::from(home).join(".gaovm"))
    }

    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.json")
    }

    #[must_use]
    pub fn pending_config_path(&self) -> PathBuf {
        self.state_dir.join("pending_config.json")
    }

    #[must_use]
    pub fn desired_state_path(&self) -> PathBuf {
        self.state_dir.join("desired_state.json")
    }

    #[must_use]
    pub fn runtime_state_path(&self) -> PathBuf {
        self.state_dir.join("daemon_state.json")
    }

    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        self.state_dir.join("run")
    }

    #[must_use]
    pub fn daemon_socket_path(&self) -> PathBuf {
        self.run_dir().join("daemon.sock")
    }

    #[must_use]
    pub fn driver_socket_path(&self) -> PathBuf {
        self.run_dir().join("driver.sock")
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    #[must_use]
    pub fn daemon_log_path(&self) -> PathBuf {
        self.log_dir().join("daemon.log")
    }

    #[must_use]
    pub fn driver_log_path(&self) -> PathBuf {
        self.log_dir().join("driver.log")
    }

    /// Create the state, run, and log directories.
    ///
    /// # Errors
    /// Propagates directory-creation failures.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(self.run_dir())?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_rooted_in_the_state_dir() {
        let layout = StateLayout::new("/var/lib/gaovm");
        assert_eq!(layout.config_path(), PathBuf::from("/var/lib/gaovm/config.json"));
        assert_eq!(
            layout.daemon_socket_path(),
            PathBuf::from("/var/lib/gaovm/run/daemon.sock")
        );
        assert_eq!(
            layout.driver_log_path(),
            PathBuf::from("/var/lib/gaovm/logs/driver.log")
        );
    }

    #[test]
    fn ensure_dirs_creates_run_and_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = StateLayout::new(dir.path().join("state"));
        layout.ensure_dirs().expect("ensure_dirs failed");
        assert!(layout.run_dir().is_dir());
        assert!(layout.log_dir().is_dir());
    }
}
