//! Shared launch plumbing for JupyterLab desktop sessions.
//!
//! This crate provides everything needed to turn a resolved Python
//! environment into a runnable server script:
//!
//! - Free local port allocation with reservation tracking
//! - Session token generation from the OS random source
//! - Typed server arguments rendered with per-shell quoting
//! - Activation + launch script generation for POSIX shells and `cmd.exe`
//!
//! # Example
//!
//! ```ignore
//! use lab_launch::{generate_token, LaunchArgs, PortPool, ScriptBuilder};
//!
//! let mut ports = PortPool::new();
//! let port = ports.allocate().await?;
//! let args = LaunchArgs::builder(port, generate_token())
//!     .root_dir("/home/u/proj")
//!     .build()?;
//! let script = ScriptBuilder::default().build(&args, &env, None).await?;
//! ```

use std::path::PathBuf;

use lab_env::{EnvKind, Platform};

pub mod args;
pub mod port;
pub mod script;
pub mod token;

// Re-export commonly used items
pub use args::{LaunchArgs, LaunchArgsBuilder, ServerArg};
pub use port::PortPool;
pub use script::{default_script_dir, ScriptBuilder};
pub use token::{generate_token, TOKEN_PREFIX};

/// Errors raised while preparing a launch.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("No free local port after {attempts} attempts")]
    ResourceExhausted { attempts: usize },

    #[error("Cannot activate {kind} environment on {platform:?}: {reason}")]
    UnsupportedEnvironmentKind {
        kind: EnvKind,
        platform: Platform,
        reason: String,
    },

    #[error("Invalid server arguments: {0}")]
    InvalidServerArgs(String),

    #[error("Failed to write launch script {path}: {source}")]
    TempFileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
