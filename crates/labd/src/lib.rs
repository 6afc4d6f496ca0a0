//! labd - session daemon for JupyterLab desktop.
//!
//! The daemon owns every local JupyterLab server the desktop app starts:
//! it picks a port, mints a token, writes an activation script for the
//! chosen Python environment, supervises the resulting process, and keeps
//! the running and recently used server lists that the UI shows.
//!
//! The UI talks to the daemon over a Unix socket (named pipe on Windows)
//! using newline-delimited JSON. See [`protocol`] for the message types.

use std::path::PathBuf;

pub mod client;
pub mod daemon;
pub mod discovery;
pub mod health;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod settings;
pub mod singleton;
pub mod store;
pub mod supervisor;

/// Directory name shared by the cache and config locations.
pub const APP_DIR_NAME: &str = "jlab-desktop";

/// Get the base directory for daemon runtime files (socket, lock, info).
///
/// `~/.cache/jlab-desktop/` on Linux.
pub fn daemon_base_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR_NAME)
}

/// Get the directory holding persisted state and settings.
///
/// `~/.config/jlab-desktop/` on Linux.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Get the default endpoint path for labd.
///
/// On Unix, this returns a Unix socket path (e.g., ~/.cache/jlab-desktop/labd.sock).
#[cfg(unix)]
pub fn default_socket_path() -> PathBuf {
    daemon_base_dir().join("labd.sock")
}

/// Get the default endpoint path for labd.
///
/// On Windows, this returns a named pipe path (\\.\pipe\labd).
#[cfg(windows)]
pub fn default_socket_path() -> PathBuf {
    PathBuf::from(r"\\.\pipe\labd")
}

/// Get the path of the persisted running/recent session lists.
pub fn default_sessions_path() -> PathBuf {
    config_dir().join("sessions.json")
}

/// Get the path of the user settings file.
pub fn default_settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

