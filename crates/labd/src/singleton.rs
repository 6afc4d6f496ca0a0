//! One daemon per user.
//!
//! The daemon holds an exclusive lock on `labd.lock` for its lifetime and
//! describes itself in `labd.json` next to it, so a second instance (or the
//! `status` command) can find out who is running.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE_NAME: &str = "labd.lock";
pub const INFO_FILE_NAME: &str = "labd.json";

/// Information about a running daemon instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    /// Socket endpoint the daemon is listening on.
    pub endpoint: String,
    /// Process ID of the daemon.
    pub pid: u32,
    /// Version of the daemon.
    pub version: String,
    /// When the daemon started.
    pub started_at: DateTime<Utc>,
}

impl DaemonInfo {
    fn unknown() -> Self {
        Self {
            endpoint: "unknown".to_string(),
            pid: 0,
            version: "unknown".to_string(),
            started_at: Utc::now(),
        }
    }
}

/// Held for as long as this process is the daemon.
pub struct DaemonLock {
    _lock_file: File,
    info_path: PathBuf,
}

impl DaemonLock {
    /// Try to become the daemon for `lock_dir`.
    ///
    /// Returns the running daemon's info if another process holds the lock.
    pub fn try_acquire(lock_dir: &Path) -> Result<Self, DaemonInfo> {
        let lock_path = lock_dir.join(LOCK_FILE_NAME);
        let info_path = lock_dir.join(INFO_FILE_NAME);
        let running = || read_daemon_info(&info_path).unwrap_or_else(DaemonInfo::unknown);

        if let Err(e) = std::fs::create_dir_all(lock_dir) {
            warn!("[singleton] Failed to create {:?}: {}", lock_dir, e);
        }

        let lock_file = match OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
        {
            Ok(f) => f,
            Err(e) => {
                warn!("[singleton] Failed to open lock file: {}", e);
                return Err(running());
            }
        };

        if !lock_exclusive(&lock_file) {
            info!("[singleton] Another daemon is already running");
            return Err(running());
        }

        info!("[singleton] Acquired daemon lock {:?}", lock_path);
        Ok(Self {
            _lock_file: lock_file,
            info_path,
        })
    }

    /// Write daemon info after successful startup.
    pub fn write_info(&self, endpoint: &str) -> std::io::Result<()> {
        let info = DaemonInfo {
            endpoint: endpoint.to_string(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&info).map_err(std::io::Error::other)?;
        std::fs::write(&self.info_path, json)?;
        info!("[singleton] Wrote daemon info to {:?}", self.info_path);
        Ok(())
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        // The lock itself goes away with the file handle.
        if self.info_path.exists() {
            std::fs::remove_file(&self.info_path).ok();
        }
        info!("[singleton] Released daemon lock");
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    result == 0
}

#[cfg(windows)]
fn lock_exclusive(file: &File) -> bool {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };

    let handle = file.as_raw_handle() as HANDLE;
    let result = unsafe {
        let mut overlapped = std::mem::zeroed();
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    result != 0
}

/// Default directory for the lock and info files.
pub fn default_lock_dir() -> PathBuf {
    crate::daemon_base_dir()
}

/// Read daemon info from the info file.
pub fn read_daemon_info(path: &Path) -> Option<DaemonInfo> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

/// Info of the daemon running for the default lock directory, if any.
pub fn get_running_daemon_info() -> Option<DaemonInfo> {
    read_daemon_info(&default_lock_dir().join(INFO_FILE_NAME))
}
