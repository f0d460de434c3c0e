//! Size-rotated, line-oriented log files.
//!
//! The daemon and driver logs are plain append-only files: one level-tagged
//! line per entry. When a write would push the live file to the size
//! threshold, generations shift (`.2` → `.3`, `.1` → `.2`, live → `.1`) and
//! a fresh live file is started. Appends are serialised by an internal lock
//! so concurrent callers never interleave bytes within a line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

/// Rotate once the live file would reach this size.
pub const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Rotated generations kept on disk.
pub const KEEP_GENERATIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// One rotating log file.
pub struct RotatingLogSink {
    inner: Mutex<SinkInner>,
}

struct SinkInner {
    path: PathBuf,
    file: File,
    size: u64,
}

impl RotatingLogSink {
    /// Open (or create) the live log file in append mode.
    ///
    /// # Errors
    /// Propagates open/metadata failures; the parent directory must exist.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            inner: Mutex::new(SinkInner { path, file, size }),
        })
    }

    /// Append one level-tagged line, rotating first if the write would reach
    /// the size threshold.
    ///
    /// # Errors
    /// Propagates append failures. Rotation itself is best-effort: a failed
    /// generation shift falls back to appending to the live file.
    pub fn append(&self, level: LogLevel, line: &str) -> std::io::Result<()> {
        let entry = format!("{} {} {}\n", Utc::now().to_rfc3339(), level.as_str(), line);
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut inner = self.inner.lock().expect("log sink lock poisoned");
        if inner.size + entry.len() as u64 >= MAX_LOG_SIZE {
            inner.rotate();
        }
        inner.file.write_all(entry.as_bytes())?;
        inner.size += entry.len() as u64;
        Ok(())
    }

    /// Current size of the live file in bytes.
    #[must_use]
    pub fn live_size(&self) -> u64 {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let inner = self.inner.lock().expect("log sink lock poisoned");
        inner.size
    }
}

impl SinkInner {
    fn rotate(&mut self) {
        let _ = self.file.flush();
        for generation in (1..KEEP_GENERATIONS).rev() {
            let from = generation_path(&self.path, generation);
            let to = generation_path(&self.path, generation + 1);
            let _ = std::fs::rename(&from, &to);
        }
        let _ = std::fs::rename(&self.path, generation_path(&self.path, 1));
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => {
                self.file = file;
                self.size = 0;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "log rotation reopen failed");
            }
        }
    }
}

fn generation_path(path: &Path, generation: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}
