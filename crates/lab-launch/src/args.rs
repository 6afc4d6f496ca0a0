//! Typed server command-line arguments.
//!
//! Every argument the launcher passes to `jupyterlab` is a [`ServerArg`]
//! built from structured values, then rendered for the target shell.
//! Order is significant: traitlets resolves conflicting flags by position,
//! so fixed arguments come first, then defaults, then the user's extras.
//!
//! traitlets<5.0 requires fully specified options to be joined to their
//! value with `=` and no space.

use std::path::{Path, PathBuf};

use lab_env::Platform;

use crate::LaunchError;

const FRAME_ANCESTORS_SETTINGS: &str =
    "{'headers': {'Content-Security-Policy': 'frame-ancestors *'}}";

/// One argument on the server command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerArg {
    NoBrowser,
    ExposeAppInBrowser,
    Port(u16),
    /// Disable password auth so only the token is accepted
    EmptyPassword,
    Token(String),
    QuitButton(bool),
    /// Allow the lab page to be embedded in the desktop shell's frame
    FrameAncestorsAny,
    AllowOriginAny,
    AllowCredentials(bool),
    RootDir(PathBuf),
    /// Do not read any jupyter config file
    NoConfigFile,
    AllowHidden(bool),
    /// A single word of the user's extra arguments
    Extra(String),
}

fn py_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

impl ServerArg {
    /// The argument as the server process will see it in `argv`.
    pub fn to_argv(&self) -> String {
        match self {
            ServerArg::NoBrowser => "--no-browser".to_string(),
            ServerArg::ExposeAppInBrowser => "--expose-app-in-browser".to_string(),
            ServerArg::Port(port) => format!("--ServerApp.port={}", port),
            ServerArg::EmptyPassword => "--ServerApp.password=".to_string(),
            ServerArg::Token(token) => format!("--ServerApp.token={}", token),
            ServerArg::QuitButton(v) => format!("--LabApp.quit_button={}", py_bool(*v)),
            ServerArg::FrameAncestorsAny => {
                format!("--ServerApp.tornado_settings={}", FRAME_ANCESTORS_SETTINGS)
            }
            ServerArg::AllowOriginAny => "--ServerApp.allow_origin=*".to_string(),
            ServerArg::AllowCredentials(v) => {
                format!("--ServerApp.allow_credentials={}", py_bool(*v))
            }
            ServerArg::RootDir(dir) => format!("--ServerApp.root_dir={}", dir.display()),
            ServerArg::NoConfigFile => "--JupyterApp.config_file_name=".to_string(),
            ServerArg::AllowHidden(v) => {
                format!("--ContentsManager.allow_hidden={}", py_bool(*v))
            }
            ServerArg::Extra(word) => word.clone(),
        }
    }

    /// The argument as written into a launch script for `platform`.
    pub fn render(&self, platform: Platform) -> Result<String, LaunchError> {
        let rendered = match self {
            ServerArg::EmptyPassword => "--ServerApp.password=\"\"".to_string(),
            ServerArg::Token(token) => format!("--ServerApp.token=\"{}\"", token),
            ServerArg::NoConfigFile => "--JupyterApp.config_file_name=\"\"".to_string(),
            ServerArg::FrameAncestorsAny => format!("\"{}\"", self.to_argv()),
            ServerArg::AllowOriginAny => match platform {
                Platform::Posix => format!("'{}'", self.to_argv()),
                Platform::Windows => self.to_argv(),
            },
            ServerArg::RootDir(_) | ServerArg::Extra(_) => quote_word(&self.to_argv(), platform)?,
            _ => self.to_argv(),
        };
        Ok(rendered)
    }
}

/// Quote a free-form word so the shell passes it through as one argument.
pub fn quote_word(word: &str, platform: Platform) -> Result<String, LaunchError> {
    match platform {
        Platform::Posix => shlex::try_quote(word)
            .map(|q| q.into_owned())
            .map_err(|e| LaunchError::InvalidServerArgs(format!("{}: {:?}", e, word))),
        Platform::Windows => quote_cmd_word(word),
    }
}

fn quote_cmd_word(word: &str) -> Result<String, LaunchError> {
    if word.contains('"') || word.contains('\0') {
        return Err(LaunchError::InvalidServerArgs(format!(
            "cannot pass {:?} through cmd.exe",
            word
        )));
    }
    // %VAR% expansion happens even inside quotes
    let escaped = word.replace('%', "%%");
    let needs_quotes = escaped.is_empty()
        || escaped
            .chars()
            .any(|c| c.is_whitespace() || "&|<>^()!,;=".contains(c));
    if needs_quotes {
        Ok(format!("\"{}\"", escaped))
    } else {
        Ok(escaped)
    }
}

/// Split the user's free-form argument string into words.
///
/// Uses POSIX shell word rules; unbalanced quotes are rejected rather than
/// passed through.
pub fn parse_extra_args(raw: &str) -> Result<Vec<String>, LaunchError> {
    shlex::split(raw).ok_or_else(|| {
        LaunchError::InvalidServerArgs(format!("unbalanced quoting in {:?}", raw))
    })
}

fn validate_token(token: &str) -> Result<(), LaunchError> {
    let ok = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(LaunchError::InvalidServerArgs(
            "token contains characters that cannot be embedded".to_string(),
        ))
    }
}

/// The full, ordered server argument list for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    port: u16,
    token: String,
    args: Vec<ServerArg>,
}

impl LaunchArgs {
    pub fn builder(port: u16, token: impl Into<String>) -> LaunchArgsBuilder {
        LaunchArgsBuilder {
            port,
            token: token.into(),
            root_dir: None,
            use_defaults: true,
            extra: None,
        }
    }

    /// Arguments every launch carries, in order.
    pub fn fixed(port: u16, token: &str, root_dir: Option<&Path>) -> Vec<ServerArg> {
        let mut args = vec![
            ServerArg::NoBrowser,
            ServerArg::ExposeAppInBrowser,
            ServerArg::Port(port),
            ServerArg::EmptyPassword,
            ServerArg::Token(token.to_string()),
            ServerArg::QuitButton(false),
            ServerArg::FrameAncestorsAny,
            ServerArg::AllowOriginAny,
            ServerArg::AllowCredentials(true),
        ];
        if let Some(dir) = root_dir {
            args.push(ServerArg::RootDir(dir.to_path_buf()));
        }
        args
    }

    /// Arguments added unless the caller overrides defaults.
    pub fn defaults() -> Vec<ServerArg> {
        vec![ServerArg::NoConfigFile, ServerArg::AllowHidden(true)]
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn args(&self) -> &[ServerArg] {
        &self.args
    }

    /// Arguments as the server will receive them.
    pub fn argv(&self) -> Vec<String> {
        self.args.iter().map(ServerArg::to_argv).collect()
    }

    /// Space-joined, shell-quoted arguments for a launch script.
    pub fn render(&self, platform: Platform) -> Result<String, LaunchError> {
        let words = self
            .args
            .iter()
            .map(|a| a.render(platform))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(words.join(" "))
    }
}

/// Builder for [`LaunchArgs`].
#[derive(Debug, Clone)]
pub struct LaunchArgsBuilder {
    port: u16,
    token: String,
    root_dir: Option<PathBuf>,
    use_defaults: bool,
    extra: Option<String>,
}

impl LaunchArgsBuilder {
    pub fn root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(dir.into());
        self
    }

    /// Skip the default argument set (config file suppression, hidden files).
    pub fn override_defaults(mut self, override_defaults: bool) -> Self {
        self.use_defaults = !override_defaults;
        self
    }

    /// The user's free-form extra arguments, appended last.
    pub fn extra_args(mut self, raw: impl Into<String>) -> Self {
        self.extra = Some(raw.into());
        self
    }

    pub fn build(self) -> Result<LaunchArgs, LaunchError> {
        validate_token(&self.token)?;

        let mut args = LaunchArgs::fixed(self.port, &self.token, self.root_dir.as_deref());
        if self.use_defaults {
            args.extend(LaunchArgs::defaults());
        }
        if let Some(raw) = self.extra.as_deref() {
            args.extend(parse_extra_args(raw)?.into_iter().map(ServerArg::Extra));
        }

        Ok(LaunchArgs {
            port: self.port,
            token: self.token,
            args,
        })
    }
}
