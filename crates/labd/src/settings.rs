//! Daemon settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/jlab-desktop/settings.json
//! - Linux: ~/.config/jlab-desktop/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\jlab-desktop\settings.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::health::DEFAULT_HEALTH_TIMEOUT;
use crate::registry::DEFAULT_MAX_RECENT;

/// User preferences for launching servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabSettings {
    /// Interpreter used when a launch does not name one (falls back to PATH)
    #[serde(default)]
    pub default_python: Option<PathBuf>,

    /// Conda installation used to activate conda environments
    #[serde(default)]
    pub conda_base: Option<PathBuf>,

    /// Extra server arguments appended to every launch
    #[serde(default)]
    pub extra_args: String,

    /// Skip the default `config_file_name`/`allow_hidden` arguments
    #[serde(default)]
    pub override_default_args: bool,

    /// Size of the recently used list
    #[serde(default = "default_max_recent")]
    pub max_recent: usize,

    /// `jupyter` executable used to list and stop servers
    #[serde(default = "default_jupyter_command")]
    pub jupyter_command: String,

    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,

    /// Install roots read from the Windows registry
    #[serde(default)]
    pub registry_roots: Vec<PathBuf>,
}

fn default_max_recent() -> usize {
    DEFAULT_MAX_RECENT
}

fn default_jupyter_command() -> String {
    "jupyter".to_string()
}

fn default_health_timeout_secs() -> u64 {
    DEFAULT_HEALTH_TIMEOUT.as_secs()
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            default_python: None,
            conda_base: None,
            extra_args: String::new(),
            override_default_args: false,
            max_recent: default_max_recent(),
            jupyter_command: default_jupyter_command(),
            health_timeout_secs: default_health_timeout_secs(),
            registry_roots: Vec::new(),
        }
    }
}

impl LabSettings {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs.max(1))
    }
}

/// Load settings from `path`, returning defaults if the file doesn't exist
/// or can't be parsed
pub fn load_settings_from(path: &Path) -> LabSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("[settings] Ignoring invalid {:?}: {}", path, e);
            LabSettings::default()
        }),
        Err(_) => LabSettings::default(),
    }
}

/// Load settings from the default location
pub fn load_settings() -> LabSettings {
    load_settings_from(&crate::default_settings_path())
}

/// Save settings to `path`
pub fn save_settings_to(path: &Path, settings: &LabSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = LabSettings::default();
        assert_eq!(settings.max_recent, 20);
        assert_eq!(settings.jupyter_command, "jupyter");
        assert_eq!(settings.health_timeout(), Duration::from_secs(3));
        assert!(!settings.override_default_args);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let parsed: LabSettings =
            serde_json::from_str(r#"{"default_python": "/usr/bin/python3"}"#).unwrap();
        assert_eq!(parsed.default_python, Some(PathBuf::from("/usr/bin/python3")));
        assert_eq!(parsed.max_recent, 20);
        assert_eq!(parsed.jupyter_command, "jupyter");
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfg").join("settings.json");
        let settings = LabSettings {
            extra_args: "--ServerApp.ip=127.0.0.1".to_string(),
            max_recent: 5,
            ..Default::default()
        };
        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path), settings);
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert_eq!(load_settings_from(&path), LabSettings::default());
        assert_eq!(
            load_settings_from(&tmp.path().join("absent.json")),
            LabSettings::default()
        );
    }
}
