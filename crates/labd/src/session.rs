//! Session data model.
//!
//! A [`Session`] is one JupyterLab server the daemon knows about. Its
//! persisted form is a [`ServerItem`], the `{link, folder, title}` record
//! stored in the running and recent lists.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lab_env::PythonEnvironment;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    /// Registered but the last health probe failed
    Unreachable,
    Terminated,
}

/// Where a session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    /// Launched and supervised by this daemon
    Local,
    /// A server found already running (previous daemon run or `jupyter lab list`)
    Adopted,
    /// A remote server the user connected to by URL
    Remote,
}

/// Persisted entry in the running and recent lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerItem {
    pub link: String,
    /// Working directory; absent for remote servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default)]
    pub title: String,
}

impl ServerItem {
    /// Entry for a server serving `folder`.
    pub fn local(link: &Url, folder: &Path) -> Self {
        let folder = folder.display().to_string();
        Self {
            link: link.to_string(),
            title: folder_title(&folder),
            folder: Some(folder),
        }
    }

    /// Entry for a remote server known only by URL.
    pub fn remote(link: &Url) -> Self {
        Self {
            link: link.to_string(),
            folder: None,
            title: url_title(link),
        }
    }

    /// Deduplication key: the folder, or the link when there is none.
    pub fn key(&self) -> &str {
        self.folder.as_deref().unwrap_or(&self.link)
    }
}

/// Last non-empty segment of a `/` or `\` separated path.
pub fn folder_title(folder: &str) -> String {
    folder
        .split(['/', '\\'])
        .rev()
        .find(|segment| !segment.is_empty())
        .unwrap_or(folder)
        .to_string()
}

/// `host:port` label for servers without a folder.
pub fn url_title(url: &Url) -> String {
    match (url.host_str(), url.port_or_known_default()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => url.to_string(),
    }
}

/// Connect address of a locally launched server,
/// `http://localhost:<port>/lab?token=<token>`.
///
/// The token is embedded as is; launch tokens only use `[A-Za-z0-9:_.-]`.
pub fn connect_url(port: u16, token: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!("http://localhost:{}/lab?token={}", port, token))
}

/// Port and token carried by a server URL.
pub fn parse_port_and_token(url: &Url) -> (Option<u16>, Option<String>) {
    let token = url
        .query_pairs()
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
        .filter(|t| !t.is_empty());
    (url.port_or_known_default(), token)
}

/// A server the daemon knows about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub url: Url,
    pub port: Option<u16>,
    pub token: Option<String>,
    /// Root directory the server serves; absent for remote sessions
    pub working_directory: Option<PathBuf>,
    pub title: String,
    /// Interpreter the server was launched from, when this daemon launched it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<PythonEnvironment>,
    pub state: SessionState,
    pub origin: SessionOrigin,
    /// Supervised child process id, when owned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    /// A server launched by this daemon.
    pub fn local(
        port: u16,
        token: &str,
        working_directory: PathBuf,
        environment: PythonEnvironment,
        pid: Option<u32>,
    ) -> Result<Self, url::ParseError> {
        let url = connect_url(port, token)?;
        Ok(Self {
            id: Uuid::new_v4(),
            title: folder_title(&working_directory.display().to_string()),
            url,
            port: Some(port),
            token: Some(token.to_string()),
            working_directory: Some(working_directory),
            environment: Some(environment),
            state: SessionState::Starting,
            origin: SessionOrigin::Local,
            pid,
            started_at: Utc::now(),
        })
    }

    /// A server known only through its persisted or listed entry.
    ///
    /// Returns `None` when the link is not a valid URL.
    pub fn from_item(item: &ServerItem, origin: SessionOrigin) -> Option<Self> {
        let url = Url::parse(&item.link).ok()?;
        let (port, token) = parse_port_and_token(&url);
        let title = if item.title.is_empty() {
            match &item.folder {
                Some(folder) => folder_title(folder),
                None => url_title(&url),
            }
        } else {
            item.title.clone()
        };
        Some(Self {
            id: Uuid::new_v4(),
            url,
            port,
            token,
            working_directory: item.folder.as_ref().map(PathBuf::from),
            title,
            environment: None,
            state: SessionState::Starting,
            origin,
            pid: None,
            started_at: Utc::now(),
        })
    }

    /// Registry key: the working directory, or the URL for directory-less sessions.
    pub fn key(&self) -> String {
        match &self.working_directory {
            Some(dir) => dir.display().to_string(),
            None => self.url.to_string(),
        }
    }

    pub fn to_item(&self) -> ServerItem {
        ServerItem {
            link: self.url.to_string(),
            folder: self
                .working_directory
                .as_ref()
                .map(|d| d.display().to_string()),
            title: self.title.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }
}
