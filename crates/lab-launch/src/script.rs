//! Launch script generation.
//!
//! The script activates the session's Python environment and then starts
//! `jupyterlab` with the rendered [`LaunchArgs`]. It is written to a fixed
//! location under the OS temp directory (`jlab_desktop/launch.sh` or
//! `jlab_desktop\launch.bat`) and handed to the process supervisor; the
//! builder never runs it.

use std::path::{Path, PathBuf};

use lab_env::{EnvKind, Platform, PythonEnvironment};
use log::debug;

use crate::args::LaunchArgs;
use crate::LaunchError;

/// Subdirectory of the OS temp dir holding generated scripts.
pub const SCRIPT_DIR_NAME: &str = "jlab_desktop";

/// Default directory for launch scripts.
pub fn default_script_dir() -> PathBuf {
    std::env::temp_dir().join(SCRIPT_DIR_NAME)
}

/// File name of the launch script for a platform.
pub fn script_file_name(platform: Platform) -> &'static str {
    match platform {
        Platform::Posix => "launch.sh",
        Platform::Windows => "launch.bat",
    }
}

/// Escape a value for use inside POSIX double quotes.
fn dquote_posix(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn dquote_cmd(value: &str) -> String {
    format!("\"{}\"", value.replace('%', "%%"))
}

/// How the environment gets activated before the server starts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Activation {
    /// `conda activate` through the base installation's hook
    Conda { base: PathBuf, env_root: PathBuf },
    /// The environment's own activate script
    Own { env_root: PathBuf },
    /// No activation; the interpreter is called by absolute path
    Direct { python: PathBuf },
}

/// Renders and writes launch scripts for one platform.
#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    platform: Platform,
    script_dir: PathBuf,
}

impl Default for ScriptBuilder {
    fn default() -> Self {
        Self::new(Platform::current())
    }
}

impl ScriptBuilder {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            script_dir: default_script_dir(),
        }
    }

    /// Write scripts somewhere other than the temp directory.
    pub fn with_script_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_dir = dir.into();
        self
    }

    /// Where [`ScriptBuilder::build`] writes the script.
    pub fn script_path(&self) -> PathBuf {
        self.script_dir.join(script_file_name(self.platform))
    }

    fn activation(
        &self,
        env: &PythonEnvironment,
        conda_base: Option<&Path>,
    ) -> Result<Activation, LaunchError> {
        let unsupported = |reason: &str| LaunchError::UnsupportedEnvironmentKind {
            kind: env.kind,
            platform: self.platform,
            reason: reason.to_string(),
        };

        match env.kind {
            EnvKind::CondaRoot | EnvKind::CondaEnv => {
                let base = match conda_base {
                    Some(base) => base.to_path_buf(),
                    None => infer_conda_base(env)
                        .ok_or_else(|| unsupported("conda base path is not known"))?,
                };
                Ok(Activation::Conda {
                    base,
                    env_root: env.root.clone(),
                })
            }
            EnvKind::VirtualEnv => Ok(Activation::Own {
                env_root: env.root.clone(),
            }),
            EnvKind::SystemPath => Ok(Activation::Direct {
                python: env.path.clone(),
            }),
            EnvKind::WindowsRegistry => match self.platform {
                Platform::Windows => Ok(Activation::Direct {
                    python: env.path.clone(),
                }),
                Platform::Posix => Err(unsupported("registry interpreters only exist on Windows")),
            },
        }
    }

    /// Render the script text. Pure: identical inputs give identical output.
    pub fn render(
        &self,
        args: &LaunchArgs,
        env: &PythonEnvironment,
        conda_base: Option<&Path>,
    ) -> Result<String, LaunchError> {
        let activation = self.activation(env, conda_base)?;
        let rendered_args = args.render(self.platform)?;

        let lines: Vec<String> = match self.platform {
            Platform::Posix => {
                let mut lines = vec!["#!/usr/bin/env bash".to_string()];
                let interpreter = match &activation {
                    Activation::Conda { base, env_root } => {
                        let hook = format!("{}/bin/activate", base.display());
                        lines.push(format!("source {}", dquote_posix(&hook)));
                        lines.push(format!(
                            "conda activate {}",
                            dquote_posix(&env_root.display().to_string())
                        ));
                        "python".to_string()
                    }
                    Activation::Own { env_root } => {
                        let hook = format!("{}/bin/activate", env_root.display());
                        lines.push(format!("source {}", dquote_posix(&hook)));
                        "python".to_string()
                    }
                    Activation::Direct { python } => dquote_posix(&python.display().to_string()),
                };
                lines.push(format!("exec {} -m jupyterlab {}", interpreter, rendered_args));
                lines
            }
            Platform::Windows => {
                let mut lines = vec!["@echo off".to_string()];
                let interpreter = match &activation {
                    Activation::Conda { base, env_root } => {
                        let hook = format!("{}\\condabin\\activate.bat", base.display());
                        lines.push(format!("CALL {}", dquote_cmd(&hook)));
                        lines.push(format!(
                            "CALL conda activate {}",
                            dquote_cmd(&env_root.display().to_string())
                        ));
                        "python".to_string()
                    }
                    Activation::Own { env_root } => {
                        let hook = format!("{}\\activate.bat", env_root.display());
                        lines.push(format!("CALL {}", dquote_cmd(&hook)));
                        "python".to_string()
                    }
                    Activation::Direct { python } => dquote_cmd(&python.display().to_string()),
                };
                lines.push(format!("CALL {} -m jupyterlab {}", interpreter, rendered_args));
                lines
            }
        };

        let newline = match self.platform {
            Platform::Posix => "\n",
            Platform::Windows => "\r\n",
        };
        let mut script = lines.join(newline);
        script.push_str(newline);
        Ok(script)
    }

    /// Render the script and write it to [`ScriptBuilder::script_path`].
    pub async fn build(
        &self,
        args: &LaunchArgs,
        env: &PythonEnvironment,
        conda_base: Option<&Path>,
    ) -> Result<PathBuf, LaunchError> {
        let script = self.render(args, env, conda_base)?;
        let path = self.script_path();
        let write_failed = |source: std::io::Error| LaunchError::TempFileWriteFailed {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.script_dir)
            .await
            .map_err(write_failed)?;
        tokio::fs::write(&path, &script).await.map_err(write_failed)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(write_failed)?;
        }

        debug!("[launch-script] Wrote {:?}:\n{}", path, script);
        Ok(path)
    }
}

/// Find the conda installation an environment belongs to.
///
/// A conda root is its own base; a named env lives in `<base>/envs/<name>`.
fn infer_conda_base(env: &PythonEnvironment) -> Option<PathBuf> {
    match env.kind {
        EnvKind::CondaRoot => Some(env.root.clone()),
        EnvKind::CondaEnv => {
            let envs_dir = env.root.parent()?;
            if envs_dir.file_name()? == "envs" {
                envs_dir.parent().map(Path::to_path_buf)
            } else {
                None
            }
        }
        _ => None,
    }
}
