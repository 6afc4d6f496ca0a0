//! Pluggable environment-kind detectors.
//!
//! Each detector recognises exactly one [`EnvKind`] from markers on disk.
//! The resolver runs them in a fixed priority order and takes the first
//! match, so more specific detectors (conda) must come before looser ones
//! (virtual-env, catch-all).

use std::path::{Path, PathBuf};

use crate::environment::{EnvKind, Platform};

/// Everything a detector may look at.
#[derive(Debug, Clone, Copy)]
pub struct EnvProbe<'a> {
    pub python: &'a Path,
    pub root: &'a Path,
    pub platform: Platform,
}

/// Recognises one kind of Python environment.
pub trait EnvDetector: Send + Sync {
    /// The kind reported when [`EnvDetector::matches`] returns true.
    fn kind(&self) -> EnvKind;

    fn matches(&self, probe: &EnvProbe<'_>) -> bool;
}

fn has_conda_meta(root: &Path) -> bool {
    root.join("conda-meta").is_dir()
}

/// Base conda installation: `conda-meta/` plus the `condabin/` launcher dir.
pub struct CondaRootDetector;

impl EnvDetector for CondaRootDetector {
    fn kind(&self) -> EnvKind {
        EnvKind::CondaRoot
    }

    fn matches(&self, probe: &EnvProbe<'_>) -> bool {
        has_conda_meta(probe.root) && probe.root.join("condabin").is_dir()
    }
}

/// Environment created by `conda create`; has `conda-meta/` but no `condabin/`.
pub struct CondaEnvDetector;

impl EnvDetector for CondaEnvDetector {
    fn kind(&self) -> EnvKind {
        EnvKind::CondaEnv
    }

    fn matches(&self, probe: &EnvProbe<'_>) -> bool {
        has_conda_meta(probe.root)
    }
}

/// PEP 405 virtual environment, identified by `pyvenv.cfg`.
///
/// On Windows a venv interpreter sits in `Scripts\`, so for those the marker
/// is one level above the interpreter's directory.
pub struct VirtualEnvDetector;

impl EnvDetector for VirtualEnvDetector {
    fn kind(&self) -> EnvKind {
        EnvKind::VirtualEnv
    }

    fn matches(&self, probe: &EnvProbe<'_>) -> bool {
        if probe.root.join("pyvenv.cfg").is_file() {
            return true;
        }
        if probe.platform != Platform::Windows {
            return false;
        }
        let Some(bin_dir) = probe.python.parent() else {
            return false;
        };
        let in_scripts = bin_dir
            .file_name()
            .is_some_and(|name| name.eq_ignore_ascii_case("Scripts"));
        in_scripts
            && bin_dir
                .parent()
                .is_some_and(|venv| venv.join("pyvenv.cfg").is_file())
    }
}

/// Interpreters whose install root was listed under the PythonCore registry keys.
///
/// The registry itself is read by the caller; this detector only checks
/// provenance against the roots it was handed.
pub struct WindowsRegistryDetector {
    install_roots: Vec<PathBuf>,
}

impl WindowsRegistryDetector {
    pub fn new(install_roots: Vec<PathBuf>) -> Self {
        Self { install_roots }
    }
}

impl EnvDetector for WindowsRegistryDetector {
    fn kind(&self) -> EnvKind {
        EnvKind::WindowsRegistry
    }

    fn matches(&self, probe: &EnvProbe<'_>) -> bool {
        if probe.platform != Platform::Windows {
            return false;
        }
        // Windows paths compare case-insensitively
        let root = normalize_windows(probe.root);
        self.install_roots
            .iter()
            .any(|known| normalize_windows(known) == root)
    }
}

fn normalize_windows(path: &Path) -> String {
    path.to_string_lossy()
        .replace('/', "\\")
        .trim_end_matches('\\')
        .to_lowercase()
}

/// Catch-all: any interpreter that nothing more specific claimed.
pub struct SystemPathDetector;

impl EnvDetector for SystemPathDetector {
    fn kind(&self) -> EnvKind {
        EnvKind::SystemPath
    }

    fn matches(&self, _probe: &EnvProbe<'_>) -> bool {
        true
    }
}

/// The detector chain in priority order, first match wins.
pub fn default_detectors(registry_roots: Vec<PathBuf>) -> Vec<Box<dyn EnvDetector>> {
    vec![
        Box::new(CondaRootDetector),
        Box::new(CondaEnvDetector),
        Box::new(VirtualEnvDetector),
        Box::new(WindowsRegistryDetector::new(registry_roots)),
        Box::new(SystemPathDetector),
    ]
}
