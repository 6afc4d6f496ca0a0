//! Environment data model shared by the resolver and the launch script builder.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Kernel name used when an environment does not report its own.
pub const DEFAULT_KERNEL: &str = "python3";

/// Different kinds of Python environments.
///
/// The kind decides which activation strategy the launch script needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvKind {
    /// Catch-all for interpreters found on PATH or entered by hand
    #[serde(rename = "path")]
    SystemPath,
    /// The base installation of a conda distribution
    #[serde(rename = "conda-root")]
    CondaRoot,
    /// A named environment living under a conda installation
    #[serde(rename = "conda-env")]
    CondaEnv,
    /// An interpreter discovered through the Windows registry
    #[serde(rename = "windows-reg")]
    WindowsRegistry,
    /// A `python -m venv` / virtualenv environment
    #[serde(rename = "venv")]
    VirtualEnv,
}

impl EnvKind {
    /// Whether activation goes through `conda activate`.
    pub fn is_conda(self) -> bool {
        matches!(self, EnvKind::CondaRoot | EnvKind::CondaEnv)
    }

    /// Short label shown next to an environment in pickers.
    pub fn type_name(self) -> &'static str {
        match self {
            EnvKind::SystemPath => "system",
            EnvKind::CondaRoot | EnvKind::CondaEnv => "conda",
            EnvKind::WindowsRegistry => "win",
            EnvKind::VirtualEnv => "venv",
        }
    }
}

impl std::fmt::Display for EnvKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvKind::SystemPath => write!(f, "path"),
            EnvKind::CondaRoot => write!(f, "conda-root"),
            EnvKind::CondaEnv => write!(f, "conda-env"),
            EnvKind::WindowsRegistry => write!(f, "windows-reg"),
            EnvKind::VirtualEnv => write!(f, "venv"),
        }
    }
}

/// Target operating system family for path layout and script flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Posix,
    Windows,
}

impl Platform {
    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }

    /// Derive the environment root from an interpreter path.
    ///
    /// POSIX interpreters live in `<root>/bin/python`, so the root is two
    /// levels up. On Windows the interpreter's directory is the root.
    pub fn environment_root(self, python: &Path) -> Option<PathBuf> {
        let dir = python.parent()?;
        match self {
            Platform::Windows => Some(dir.to_path_buf()),
            Platform::Posix => dir.parent().map(Path::to_path_buf),
        }
    }
}

/// A resolved Python interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PythonEnvironment {
    /// Path of the python executable
    pub path: PathBuf,
    /// Environment root directory derived from `path`
    pub root: PathBuf,
    /// Display name, not guaranteed to be unique
    pub name: String,
    pub kind: EnvKind,
    /// Package name to version, including `python` itself once introspected
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
    #[serde(default = "default_kernel")]
    pub default_kernel: String,
}

fn default_kernel() -> String {
    DEFAULT_KERNEL.to_string()
}

impl PythonEnvironment {
    pub fn new(path: PathBuf, root: PathBuf, kind: EnvKind) -> Self {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path,
            root,
            name,
            kind,
            versions: BTreeMap::new(),
            default_kernel: default_kernel(),
        }
    }

    pub fn with_versions(mut self, versions: BTreeMap<String, String>) -> Self {
        self.versions = versions;
        self
    }

    /// Version of a package, if introspection found it.
    pub fn version_of(&self, package: &str) -> Option<&str> {
        self.versions.get(package).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_kind_serde_names() {
        assert_eq!(serde_json::to_string(&EnvKind::SystemPath).unwrap(), "\"path\"");
        assert_eq!(serde_json::to_string(&EnvKind::CondaRoot).unwrap(), "\"conda-root\"");
        assert_eq!(serde_json::to_string(&EnvKind::CondaEnv).unwrap(), "\"conda-env\"");
        assert_eq!(
            serde_json::to_string(&EnvKind::WindowsRegistry).unwrap(),
            "\"windows-reg\""
        );
        assert_eq!(serde_json::to_string(&EnvKind::VirtualEnv).unwrap(), "\"venv\"");

        let parsed: EnvKind = serde_json::from_str("\"conda-env\"").unwrap();
        assert_eq!(parsed, EnvKind::CondaEnv);
    }

    #[test]
    fn test_env_kind_display_matches_serde() {
        for kind in [
            EnvKind::SystemPath,
            EnvKind::CondaRoot,
            EnvKind::CondaEnv,
            EnvKind::WindowsRegistry,
            EnvKind::VirtualEnv,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json.trim_matches('"'), kind.to_string());
        }
    }

    #[test]
    fn test_is_conda() {
        assert!(EnvKind::CondaRoot.is_conda());
        assert!(EnvKind::CondaEnv.is_conda());
        assert!(!EnvKind::VirtualEnv.is_conda());
        assert!(!EnvKind::SystemPath.is_conda());
        assert!(!EnvKind::WindowsRegistry.is_conda());
    }

    #[test]
    fn test_posix_root_skips_bin() {
        let root = Platform::Posix
            .environment_root(Path::new("/home/u/.venvs/proj/bin/python"))
            .unwrap();
        assert_eq!(root, PathBuf::from("/home/u/.venvs/proj"));
    }

    #[test]
    fn test_windows_root_is_interpreter_dir() {
        let root = Platform::Windows
            .environment_root(Path::new("C:/Miniconda3/envs/lab/python.exe"))
            .unwrap();
        assert_eq!(root, PathBuf::from("C:/Miniconda3/envs/lab"));
    }

    #[test]
    fn test_new_environment_defaults() {
        let env = PythonEnvironment::new(
            PathBuf::from("/opt/conda/envs/lab/bin/python"),
            PathBuf::from("/opt/conda/envs/lab"),
            EnvKind::CondaEnv,
        );
        assert_eq!(env.name, "lab");
        assert_eq!(env.default_kernel, "python3");
        assert!(env.versions.is_empty());
        assert_eq!(env.version_of("jupyterlab"), None);
    }

    #[test]
    fn test_environment_deserialize_without_optional_fields() {
        let json = r#"{
            "path": "/usr/bin/python3",
            "root": "/usr",
            "name": "usr",
            "kind": "path"
        }"#;
        let env: PythonEnvironment = serde_json::from_str(json).unwrap();
        assert_eq!(env.kind, EnvKind::SystemPath);
        assert_eq!(env.default_kernel, "python3");
    }
}
