//! Python environment resolution for JupyterLab desktop sessions.
//!
//! Given the path of a Python interpreter, this crate works out which
//! environment it belongs to and how that environment has to be activated
//! before a server can be launched from it:
//!
//! - Environment root discovery (POSIX `bin/` indirection vs. Windows layout)
//! - Classification into an [`EnvKind`] through pluggable [`EnvDetector`]s
//! - Package version introspection by asking the interpreter itself
//!
//! ```ignore
//! use lab_env::EnvironmentResolver;
//!
//! let resolver = EnvironmentResolver::default();
//! let env = resolver.resolve(Path::new("/home/u/.venvs/proj/bin/python"))?;
//! assert_eq!(env.kind, lab_env::EnvKind::VirtualEnv);
//! ```

pub mod detect;
pub mod environment;
pub mod resolver;
pub mod versions;

// Re-export key types
pub use detect::{EnvDetector, EnvProbe};
pub use environment::{EnvKind, Platform, PythonEnvironment};
pub use resolver::{find_interpreter_on_path, EnvError, EnvironmentResolver};
pub use versions::introspect_versions;
