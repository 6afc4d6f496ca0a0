//! Interpreter path → [`PythonEnvironment`] resolution.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::detect::{default_detectors, EnvDetector, EnvProbe};
use crate::environment::{Platform, PythonEnvironment};

/// Errors raised while resolving an interpreter.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("Python interpreter not found at {path}: {reason}")]
    EnvironmentNotFound { path: PathBuf, reason: String },

    #[error("Unsupported environment kind for {0}")]
    UnsupportedEnvironmentKind(PathBuf),
}

/// Resolves interpreter paths using an ordered chain of detectors.
pub struct EnvironmentResolver {
    platform: Platform,
    detectors: Vec<Box<dyn EnvDetector>>,
}

impl Default for EnvironmentResolver {
    fn default() -> Self {
        Self::for_platform(Platform::current())
    }
}

impl EnvironmentResolver {
    /// Create a resolver with a custom detector chain.
    ///
    /// Detectors are tried in order. Without a catch-all at the end, an
    /// interpreter nothing recognises is rejected.
    pub fn new(platform: Platform, detectors: Vec<Box<dyn EnvDetector>>) -> Self {
        Self {
            platform,
            detectors,
        }
    }

    /// The standard detector chain for a platform.
    pub fn for_platform(platform: Platform) -> Self {
        Self::new(platform, default_detectors(Vec::new()))
    }

    /// The standard chain plus install roots read from the Windows registry.
    pub fn with_registry_roots(platform: Platform, roots: Vec<PathBuf>) -> Self {
        Self::new(platform, default_detectors(roots))
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Resolve and classify the environment owning `python`.
    pub fn resolve(&self, python: &Path) -> Result<PythonEnvironment, EnvError> {
        check_interpreter(python)?;

        let root = self
            .platform
            .environment_root(python)
            .ok_or_else(|| EnvError::EnvironmentNotFound {
                path: python.to_path_buf(),
                reason: "interpreter has no parent directory".to_string(),
            })?;

        let probe = EnvProbe {
            python,
            root: &root,
            platform: self.platform,
        };

        let kind = self
            .detectors
            .iter()
            .find(|d| d.matches(&probe))
            .map(|d| d.kind())
            .ok_or_else(|| EnvError::UnsupportedEnvironmentKind(python.to_path_buf()))?;

        info!(
            "[env-resolver] {} resolved as {} (root {})",
            python.display(),
            kind,
            root.display()
        );

        Ok(PythonEnvironment::new(python.to_path_buf(), root, kind))
    }
}

fn check_interpreter(python: &Path) -> Result<(), EnvError> {
    let not_found = |reason: &str| EnvError::EnvironmentNotFound {
        path: python.to_path_buf(),
        reason: reason.to_string(),
    };

    let metadata = std::fs::metadata(python).map_err(|e| not_found(&e.to_string()))?;
    if !metadata.is_file() {
        return Err(not_found("not a file"));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(not_found("not executable"));
        }
    }

    debug!("[env-resolver] interpreter ok: {}", python.display());
    Ok(())
}

/// Find the first Python interpreter on `PATH`.
///
/// Used when a launch does not name an interpreter and no default is
/// configured.
pub fn find_interpreter_on_path() -> Option<PathBuf> {
    let names: &[&str] = if cfg!(windows) {
        &["python.exe"]
    } else {
        &["python3", "python"]
    };
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| check_interpreter(candidate).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{CondaEnvDetector, VirtualEnvDetector};
    use crate::environment::EnvKind;

    /// Lay out `<root>/bin/python` and return the interpreter path.
    fn fake_interpreter(root: &Path) -> PathBuf {
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join("python");
        std::fs::write(&python, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        python
    }

    #[test]
    fn test_missing_interpreter() {
        let resolver = EnvironmentResolver::for_platform(Platform::Posix);
        let err = resolver
            .resolve(Path::new("/definitely/not/here/bin/python"))
            .unwrap_err();
        assert!(matches!(err, EnvError::EnvironmentNotFound { .. }));
    }

    #[test]
    fn test_directory_is_not_an_interpreter() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = EnvironmentResolver::for_platform(Platform::Posix);
        let err = resolver.resolve(tmp.path()).unwrap_err();
        assert!(matches!(err, EnvError::EnvironmentNotFound { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_interpreter() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let python = fake_interpreter(tmp.path());
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o644)).unwrap();

        let resolver = EnvironmentResolver::for_platform(Platform::Posix);
        let err = resolver.resolve(&python).unwrap_err();
        assert!(err.to_string().contains("not executable"));
    }

    #[test]
    fn test_resolve_virtualenv() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proj");
        let python = fake_interpreter(&root);
        std::fs::write(root.join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();

        let env = EnvironmentResolver::for_platform(Platform::Posix)
            .resolve(&python)
            .unwrap();
        assert_eq!(env.kind, EnvKind::VirtualEnv);
        assert_eq!(env.root, root);
        assert_eq!(env.name, "proj");
    }

    #[test]
    fn test_resolve_conda_root_and_env() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("miniconda3");
        let base_python = fake_interpreter(&base);
        std::fs::create_dir_all(base.join("conda-meta")).unwrap();
        std::fs::create_dir_all(base.join("condabin")).unwrap();

        let env_root = base.join("envs").join("lab");
        let env_python = fake_interpreter(&env_root);
        std::fs::create_dir_all(env_root.join("conda-meta")).unwrap();

        let resolver = EnvironmentResolver::for_platform(Platform::Posix);
        assert_eq!(resolver.resolve(&base_python).unwrap().kind, EnvKind::CondaRoot);
        assert_eq!(resolver.resolve(&env_python).unwrap().kind, EnvKind::CondaEnv);
    }

    #[test]
    fn test_conda_takes_priority_over_venv_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let python = fake_interpreter(tmp.path());
        std::fs::create_dir_all(tmp.path().join("conda-meta")).unwrap();
        std::fs::write(tmp.path().join("pyvenv.cfg"), "").unwrap();

        let env = EnvironmentResolver::for_platform(Platform::Posix)
            .resolve(&python)
            .unwrap();
        assert_eq!(env.kind, EnvKind::CondaEnv);
    }

    #[test]
    fn test_plain_interpreter_is_system_path() {
        let tmp = tempfile::tempdir().unwrap();
        let python = fake_interpreter(tmp.path());
        let env = EnvironmentResolver::for_platform(Platform::Posix)
            .resolve(&python)
            .unwrap();
        assert_eq!(env.kind, EnvKind::SystemPath);
    }

    #[test]
    fn test_without_catch_all_unclassified_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let python = fake_interpreter(tmp.path());
        let resolver = EnvironmentResolver::new(
            Platform::Posix,
            vec![Box::new(CondaEnvDetector), Box::new(VirtualEnvDetector)],
        );
        let err = resolver.resolve(&python).unwrap_err();
        assert!(matches!(err, EnvError::UnsupportedEnvironmentKind(_)));
    }
}
