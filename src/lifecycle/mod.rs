//! PID file, socket file and status file bookkeeping, plus stale-instance
//! recovery.
//!
//! The liveness probe uses `nix::sys::signal::kill(pid, None)` — a
//! null-signal `kill` is the standard Unix idiom for "is this pid still
//! alive" and needs no library beyond it.

use crate::error::SweepError;
use fs2::FileExt;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const PID_FILE: &str = "sweep.pid";
const SOCKET_FILE: &str = "sweep.sock";
const STATUS_FILE: &str = "sweep.status";

/// The `sweep.status` file's exact shape (spec.md §6): launcher tools poll
/// for this to learn whether the daemon finished initializing, without
/// needing to connect to the IPC socket at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFile {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusFile {
    pub fn ready(pid: u32) -> Self {
        Self {
            status: "ready".to_string(),
            pid: Some(pid),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            pid: Some(std::process::id()),
            error: Some(message.into()),
        }
    }
}

/// Holds the advisory lock on the PID file for the lifetime of the daemon
/// process; dropping it releases the lock and is the last thing that
/// happens on clean shutdown (see `src/main.rs`).
pub struct Lifecycle {
    run_dir: PathBuf,
    _lock: File,
}

impl Lifecycle {
    /// Acquires ownership of `run_dir`, recovering from a previous crashed
    /// instance if its PID is no longer alive, or returning
    /// `SweepError::AlreadyRunning` if it is.
    pub fn acquire(run_dir: &Path) -> Result<Self, SweepError> {
        fs::create_dir_all(run_dir).map_err(|e| SweepError::Unavailable(e.to_string()))?;
        let pid_path = run_dir.join(PID_FILE);

        if let Some(existing_pid) = read_pid(&pid_path) {
            if is_alive(existing_pid) {
                return Err(SweepError::AlreadyRunning(existing_pid));
            }
            warn!(pid = existing_pid, "recovering from a stale instance");
            cleanup_stale(run_dir);
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&pid_path)
            .map_err(|e| SweepError::Unavailable(e.to_string()))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            SweepError::AlreadyRunning(read_pid(&pid_path).unwrap_or(0))
        })?;
        lock_file
            .set_len(0)
            .map_err(|e| SweepError::Unavailable(e.to_string()))?;

        use std::io::{Seek, SeekFrom, Write};
        let mut writer = &lock_file;
        writer
            .seek(SeekFrom::Start(0))
            .map_err(|e| SweepError::Unavailable(e.to_string()))?;
        write!(writer, "{}", std::process::id())
            .map_err(|e| SweepError::Unavailable(e.to_string()))?;

        info!(pid = std::process::id(), run_dir = %run_dir.display(), "acquired daemon lifecycle lock");

        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            _lock: lock_file,
        })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.run_dir.join(SOCKET_FILE)
    }

    /// Removes a pre-existing socket file so binding doesn't fail with
    /// `AddrInUse`; safe because `acquire` already established this
    /// process is the sole live owner of `run_dir`.
    pub fn prepare_socket(&self) -> std::io::Result<PathBuf> {
        let path = self.socket_path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(path)
    }

    pub fn write_status(&self, status: &StatusFile) -> std::io::Result<()> {
        let encoded = serde_json::to_vec_pretty(status)?;
        fs::write(self.run_dir.join(STATUS_FILE), encoded)
    }

    pub fn read_status(run_dir: &Path) -> Option<StatusFile> {
        let bytes = fs::read(run_dir.join(STATUS_FILE)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Removes the socket and status files. The PID file is removed when
    /// `self._lock` drops and releases its `flock`.
    pub fn shutdown(&self) {
        let _ = fs::remove_file(self.socket_path());
        let _ = fs::remove_file(self.run_dir.join(STATUS_FILE));
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.run_dir.join(PID_FILE));
    }
}

fn read_pid(pid_path: &Path) -> Option<u32> {
    fs::read_to_string(pid_path).ok()?.trim().parse().ok()
}

/// Null-signal liveness probe: `kill(pid, None)` delivers no signal but
/// fails with `ESRCH` if the process doesn't exist, which is the standard
/// Unix way to check for liveness without permission to actually signal.
fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn cleanup_stale(run_dir: &Path) {
    for name in [PID_FILE, SOCKET_FILE, STATUS_FILE] {
        let _ = fs::remove_file(run_dir.join(name));
    }
    let _ = crate::store::Store::remove_stale_lock(run_dir);
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
