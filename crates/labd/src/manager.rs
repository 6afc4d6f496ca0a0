//! Session lifecycle orchestration.
//!
//! The [`SessionManager`] owns the port pool, the registry and the
//! supervised processes. Every mutation goes through `&mut self`, so the
//! daemon serializes them behind one mutex; only process output and exits
//! arrive asynchronously, through [`SessionManager::handle_event`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::join_all;
use lab_env::{find_interpreter_on_path, EnvError, EnvironmentResolver, Platform, PythonEnvironment};
use lab_launch::{generate_token, LaunchArgs, LaunchError, PortPool, ScriptBuilder};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

use crate::discovery;
use crate::health::HealthChecker;
use crate::registry::SessionRegistry;
use crate::session::{ServerItem, Session, SessionOrigin, SessionState};
use crate::settings::LabSettings;
use crate::store::{SessionStore, StoreError};
use crate::supervisor::{self, ProcessEvent, SupervisedProcess, SupervisorError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid server URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("No running session for {0}")]
    NotFound(String),

    #[error("No Python interpreter configured and none found on PATH")]
    NoInterpreter,

    #[error("Working directory {path} is not usable: {source}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Manager configuration, normally derived from [`LabSettings`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub platform: Platform,
    pub default_python: Option<PathBuf>,
    pub conda_base: Option<PathBuf>,
    pub extra_args: String,
    pub override_default_args: bool,
    pub max_recent: usize,
    pub jupyter_command: String,
    pub health_timeout: Duration,
    pub registry_roots: Vec<PathBuf>,
    /// Where launch scripts are written
    pub script_dir: PathBuf,
}

impl ManagerConfig {
    pub fn from_settings(settings: &LabSettings) -> Self {
        Self {
            platform: Platform::current(),
            default_python: settings.default_python.clone(),
            conda_base: settings.conda_base.clone(),
            extra_args: settings.extra_args.clone(),
            override_default_args: settings.override_default_args,
            max_recent: settings.max_recent,
            jupyter_command: settings.jupyter_command.clone(),
            health_timeout: settings.health_timeout(),
            registry_roots: settings.registry_roots.clone(),
            script_dir: lab_launch::default_script_dir(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_settings(&LabSettings::default())
    }
}

/// A request to serve a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub working_directory: PathBuf,
    /// Interpreter to launch from; the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<PathBuf>,
    /// Extra server arguments; the configured ones when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_defaults: Option<bool>,
}

impl LaunchRequest {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            python: None,
            extra_args: None,
            override_defaults: None,
        }
    }

    pub fn with_python(mut self, python: impl Into<PathBuf>) -> Self {
        self.python = Some(python.into());
        self
    }

    pub fn with_extra_args(mut self, extra_args: impl Into<String>) -> Self {
        self.extra_args = Some(extra_args.into());
        self
    }

    pub fn with_override_defaults(mut self, override_defaults: bool) -> Self {
        self.override_defaults = Some(override_defaults);
        self
    }
}

/// Result of [`SessionManager::launch`].
#[derive(Debug)]
pub struct Launched {
    pub session: Session,
    /// True when an existing session for the folder was returned
    pub reused: bool,
    /// Process events for a newly spawned session, to be fed back through
    /// [`SessionManager::handle_event`]
    pub events: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
}

pub struct SessionManager {
    config: ManagerConfig,
    resolver: EnvironmentResolver,
    scripts: ScriptBuilder,
    health: HealthChecker,
    ports: PortPool,
    registry: SessionRegistry,
    processes: HashMap<String, SupervisedProcess>,
}

impl SessionManager {
    pub fn new(config: ManagerConfig, store: SessionStore) -> Result<Self, SessionError> {
        let registry = SessionRegistry::new(store, config.max_recent)?;
        Ok(Self {
            resolver: EnvironmentResolver::with_registry_roots(
                config.platform,
                config.registry_roots.clone(),
            ),
            scripts: ScriptBuilder::new(config.platform).with_script_dir(&config.script_dir),
            health: HealthChecker::new(config.health_timeout),
            ports: PortPool::new(),
            registry,
            processes: HashMap::new(),
            config,
        })
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    /// Re-adopt servers recorded as running by a previous daemon.
    ///
    /// Entries whose server no longer answers are dropped. Returns the number
    /// of sessions adopted.
    pub async fn restore(&mut self) -> usize {
        let items = match self.registry.load_running() {
            Ok(items) => items,
            Err(e) => {
                warn!("[session-manager] Could not read running sessions: {}", e);
                return 0;
            }
        };

        let mut adopted = 0;
        for item in items {
            if self.adopt(&item).await {
                adopted += 1;
            }
        }
        self.flush_running();
        info!("[session-manager] Restored {} running sessions", adopted);
        adopted
    }

    /// Serve `request.working_directory`, reusing a running session for it.
    pub async fn launch(&mut self, request: LaunchRequest) -> Result<Launched, SessionError> {
        let working_directory = canonical_dir(&request.working_directory)?;
        let key = working_directory.display().to_string();

        if let Some(existing) = self.registry.get_running(&key).filter(|s| s.is_running()) {
            info!("[session-manager] Reusing running session for {}", key);
            return Ok(Launched {
                session: existing.clone(),
                reused: true,
                events: None,
            });
        }

        let python = self.interpreter_for(&request)?;
        let environment = self.resolver.resolve(&python)?;
        let port = self.ports.allocate().await?;

        let (session, process, events) =
            match self.start(port, &working_directory, environment, &request).await {
                Ok(started) => started,
                Err(e) => {
                    self.ports.release(port);
                    warn!("[session-manager] Launch for {} failed: {}", key, e);
                    return Err(e);
                }
            };

        // A stale entry for the folder (exited or unreachable) is replaced.
        if let Some(mut old) = self.processes.remove(&key) {
            old.terminate();
        }
        self.processes.insert(key.clone(), process);

        if let Some(previous) = self.registry.record_running(session.clone()) {
            self.release_port_of(&previous);
        }
        if let Err(e) = self.registry.append_recent(session.to_item()) {
            warn!("[session-manager] Failed to persist recent list: {}", e);
        }

        info!(
            "[session-manager] Launched {} on port {} (pid {:?})",
            key,
            port,
            session.pid
        );
        Ok(Launched {
            session,
            reused: false,
            events: Some(events),
        })
    }

    async fn start(
        &self,
        port: u16,
        working_directory: &Path,
        environment: PythonEnvironment,
        request: &LaunchRequest,
    ) -> Result<(Session, SupervisedProcess, mpsc::UnboundedReceiver<ProcessEvent>), SessionError>
    {
        let token = generate_token();
        let extra_args = request
            .extra_args
            .as_deref()
            .unwrap_or(&self.config.extra_args);
        let override_defaults = request
            .override_defaults
            .unwrap_or(self.config.override_default_args);

        let args = LaunchArgs::builder(port, token.as_str())
            .root_dir(working_directory)
            .override_defaults(override_defaults)
            .extra_args(extra_args)
            .build()?;
        let script = self
            .scripts
            .build(&args, &environment, self.config.conda_base.as_deref())
            .await?;

        let mut session = Session::local(
            port,
            &token,
            working_directory.to_path_buf(),
            environment,
            None,
        )
        .map_err(|e| SessionError::InvalidUrl {
            url: format!("http://localhost:{}/lab", port),
            reason: e.to_string(),
        })?;

        let (process, events) = supervisor::spawn(&script, working_directory)?;
        session.pid = process.pid();
        session.state = SessionState::Running;
        Ok((session, process, events))
    }

    fn interpreter_for(&self, request: &LaunchRequest) -> Result<PathBuf, SessionError> {
        request
            .python
            .clone()
            .or_else(|| self.config.default_python.clone())
            .or_else(find_interpreter_on_path)
            .ok_or(SessionError::NoInterpreter)
    }

    /// Connect to a server by URL.
    ///
    /// Reachable servers are added to the recent list; remote sessions are
    /// never part of the running list.
    pub async fn connect(&mut self, link: &str) -> Result<Session, SessionError> {
        let invalid = |reason: String| SessionError::InvalidUrl {
            url: link.to_string(),
            reason,
        };
        let url = Url::parse(link.trim()).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }

        let item = ServerItem::remote(&url);
        let mut session = Session::from_item(&item, SessionOrigin::Remote)
            .ok_or_else(|| invalid("not a valid URL".to_string()))?;

        if self.health.check(&url).await {
            session.state = SessionState::Running;
            if let Err(e) = self.registry.append_recent(item) {
                warn!("[session-manager] Failed to persist recent list: {}", e);
            }
            info!("[session-manager] Connected to {}", url);
        } else {
            session.state = SessionState::Unreachable;
            info!("[session-manager] {} is unreachable", url);
        }
        Ok(session)
    }

    /// Stop a running session, identified by folder or URL.
    ///
    /// The recent entry is kept.
    pub async fn terminate(&mut self, key: &str) -> Result<Session, SessionError> {
        let key = self
            .lookup_key(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;

        if let Some(mut process) = self.processes.remove(&key) {
            process.terminate();
        } else if let Some(session) = self.registry.get_running(&key) {
            if let (SessionOrigin::Adopted, Some(port)) = (session.origin, session.port) {
                discovery::stop_server(&self.config.jupyter_command, port).await;
            }
        }

        let mut session = self
            .forget(&key)
            .ok_or_else(|| SessionError::NotFound(key.clone()))?;
        session.state = SessionState::Terminated;
        info!("[session-manager] Terminated {}", key);
        Ok(session)
    }

    /// Apply an event from the process supervising session `key`.
    ///
    /// Events from a process that no longer backs the session (it was
    /// replaced or terminated) only get logged.
    pub fn handle_event(&mut self, key: &str, pid: Option<u32>, event: ProcessEvent) {
        let current = self
            .registry
            .get_running(key)
            .is_some_and(|s| s.origin == SessionOrigin::Local && s.pid == pid);

        match event {
            ProcessEvent::OutputLine { stream, line } => {
                debug!("[lab:{}] {}: {}", key, stream, line);
            }
            ProcessEvent::StreamError { stream, message } => {
                warn!("[session-manager] {} {} failed: {}", key, stream, message);
                if current {
                    if let Some(mut process) = self.processes.remove(key) {
                        process.terminate();
                    }
                    self.forget(key);
                }
            }
            ProcessEvent::Exited { code, signal } => {
                info!(
                    "[session-manager] Server for {} exited (code {:?}, signal {:?})",
                    key, code, signal
                );
                if current {
                    self.processes.remove(key);
                    self.forget(key);
                }
            }
        }
    }

    /// Re-check every running session and pick up servers started elsewhere.
    pub async fn refresh(&mut self) -> Vec<Session> {
        let targets: Vec<(String, Url)> = self
            .registry
            .running()
            .iter()
            .map(|s| (s.key(), s.url.clone()))
            .collect();
        let health = self.health.clone();
        let results = join_all(targets.iter().map(|(_, url)| health.check(url))).await;

        let mut dead_adopted = Vec::new();
        for ((key, _), reachable) in targets.iter().zip(results) {
            let Some(session) = self.registry.get_running_mut(key) else {
                continue;
            };
            session.state = if reachable {
                SessionState::Running
            } else {
                SessionState::Unreachable
            };
            // Nothing watches an adopted server, so an unreachable one is gone.
            if !reachable && session.origin == SessionOrigin::Adopted {
                dead_adopted.push(key.clone());
            }
        }
        for key in dead_adopted {
            self.forget(&key);
        }

        for item in discovery::list_servers(&self.config.jupyter_command).await {
            if self.registry.get_running(item.key()).is_none() {
                self.adopt(&item).await;
            }
        }

        self.flush_running();
        self.list_running()
    }

    pub fn list_running(&self) -> Vec<Session> {
        self.registry.running().to_vec()
    }

    pub fn list_recent(&self) -> Vec<ServerItem> {
        self.registry.recent().to_vec()
    }

    /// Terminate every process this manager spawned and wait for them to
    /// exit.
    ///
    /// Adopted sessions stay in the running cache for the next daemon.
    pub async fn terminate_owned(&mut self) {
        let owned: Vec<(String, SupervisedProcess)> = self.processes.drain().collect();
        let stops = owned.into_iter().map(|(key, mut process)| async move {
            let stopped = process.terminate_and_wait(supervisor::STOP_TIMEOUT).await;
            (key, stopped)
        });
        for (key, stopped) in join_all(stops).await {
            if !stopped {
                warn!("[session-manager] Server for {} did not stop in time", key);
            }
            self.forget(&key);
        }
    }

    /// Register `item` as an adopted session if its server answers.
    async fn adopt(&mut self, item: &ServerItem) -> bool {
        let Some(mut session) = Session::from_item(item, SessionOrigin::Adopted) else {
            warn!("[session-manager] Skipping server with invalid link {}", item.link);
            return false;
        };
        if !self.health.check(&session.url).await {
            debug!("[session-manager] Not adopting unreachable {}", session.url);
            return false;
        }

        session.state = SessionState::Running;
        if let Some(port) = session.port {
            self.ports.claim(port);
        }
        info!("[session-manager] Adopted server for {}", session.key());
        self.registry.record_running(session);
        true
    }

    /// Remove a running session and free its port.
    fn forget(&mut self, key: &str) -> Option<Session> {
        let session = self.registry.remove_running(key)?;
        self.release_port_of(&session);
        Some(session)
    }

    fn release_port_of(&mut self, session: &Session) {
        if session.origin != SessionOrigin::Remote {
            if let Some(port) = session.port {
                self.ports.release(port);
            }
        }
    }

    fn flush_running(&mut self) {
        if let Err(e) = self.registry.flush_running() {
            warn!("[session-manager] Failed to persist running sessions: {}", e);
        }
    }

    /// Map a folder path or URL to a running session key.
    fn lookup_key(&self, key: &str) -> Option<String> {
        if self.registry.get_running(key).is_some() {
            return Some(key.to_string());
        }
        if let Ok(dir) = canonical_dir(Path::new(key)) {
            let dir = dir.display().to_string();
            if self.registry.get_running(&dir).is_some() {
                return Some(dir);
            }
        }
        self.registry
            .running()
            .iter()
            .find(|s| s.url.as_str() == key)
            .map(Session::key)
    }
}

/// Canonical form of a working directory, used as its registry key.
fn canonical_dir(path: &Path) -> Result<PathBuf, SessionError> {
    let not_usable = |source| SessionError::WorkingDirectory {
        path: path.to_path_buf(),
        source,
    };
    let canonical = std::fs::canonicalize(path).map_err(not_usable)?;
    if !canonical.is_dir() {
        return Err(not_usable(std::io::Error::other("not a directory")));
    }
    Ok(strip_verbatim_prefix(canonical))
}

/// `canonicalize` returns `\\?\C:\...` on Windows, which `cmd` and Jupyter
/// do not accept.
#[cfg(windows)]
fn strip_verbatim_prefix(path: PathBuf) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_prefix(r"\\?\")) {
        Some(stripped) if !stripped.starts_with("UNC\\") => PathBuf::from(stripped),
        _ => path,
    }
}

#[cfg(not(windows))]
fn strip_verbatim_prefix(path: PathBuf) -> PathBuf {
    path
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::{FailingBackend, MemoryBackend};
    use crate::supervisor::OutputStream;

    /// A venv whose `python` prints its arguments and then sleeps.
    fn fake_venv(root: &Path) -> PathBuf {
        fake_venv_with(root, "echo \"fake lab $*\"\nexec sleep 60")
    }

    /// A venv whose `python` runs `body`.
    fn fake_venv_with(root: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(root.join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();
        std::fs::write(
            bin.join("activate"),
            format!("export PATH=\"{}:$PATH\"\n", bin.display()),
        )
        .unwrap();
        let python = bin.join("python");
        std::fs::write(&python, format!("#!/usr/bin/env bash\n{}\n", body)).unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        python
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        backend: MemoryBackend,
        python: PathBuf,
        project: PathBuf,
        config: ManagerConfig,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let python = fake_venv(&tmp.path().join("venv"));
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).unwrap();
        let config = ManagerConfig {
            platform: Platform::Posix,
            default_python: Some(python.clone()),
            jupyter_command: "/nonexistent/jupyter".to_string(),
            health_timeout: Duration::from_millis(500),
            script_dir: tmp.path().join("scripts"),
            ..ManagerConfig::default()
        };
        Fixture {
            backend: MemoryBackend::new(),
            python,
            project,
            config,
            _tmp: tmp,
        }
    }

    fn manager(f: &Fixture) -> SessionManager {
        SessionManager::new(f.config.clone(), SessionStore::new(f.backend.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_second_launch_reuses_session() {
        let f = fixture();
        let mut mgr = manager(&f);

        let first = mgr.launch(LaunchRequest::new(&f.project)).await.unwrap();
        assert!(!first.reused);
        assert!(first.events.is_some());
        assert_eq!(first.session.state, SessionState::Running);

        let port = first.session.port.unwrap();
        let token = first.session.token.clone().unwrap();
        assert!(token.starts_with("jlab:srvr:"));
        assert_eq!(
            first.session.url.as_str(),
            format!("http://localhost:{}/lab?token={}", port, token)
        );

        let second = mgr.launch(LaunchRequest::new(&f.project)).await.unwrap();
        assert!(second.reused);
        assert!(second.events.is_none());
        assert_eq!(second.session.port, first.session.port);
        assert_eq!(second.session.token, first.session.token);
        assert_eq!(mgr.ports().reserved_count(), 1);
        assert_eq!(mgr.list_running().len(), 1);
        assert_eq!(mgr.list_recent().len(), 1);

        mgr.terminate_owned().await;
    }

    #[tokio::test]
    async fn test_launch_output_reaches_event_channel() {
        let f = fixture();
        let mut mgr = manager(&f);

        let launched = mgr.launch(LaunchRequest::new(&f.project)).await.unwrap();
        let mut events = launched.events.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ProcessEvent::OutputLine { line, .. } => {
                assert!(line.starts_with("fake lab -m jupyterlab --no-browser"));
                assert!(line.contains(&format!(
                    "--ServerApp.port={}",
                    launched.session.port.unwrap()
                )));
            }
            other => panic!("unexpected event {:?}", other),
        }

        mgr.terminate_owned().await;
    }

    #[tokio::test]
    async fn test_failed_resolution_leaves_no_trace() {
        let f = fixture();
        let mut mgr = manager(&f);

        let err = mgr
            .launch(LaunchRequest::new(&f.project).with_python("/nonexistent/bin/python"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Env(EnvError::EnvironmentNotFound { .. })));
        assert_eq!(mgr.ports().reserved_count(), 0);
        assert!(mgr.list_running().is_empty());
        assert!(mgr.list_recent().is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_allocation_releases_port() {
        let f = fixture();
        let mut mgr = manager(&f);

        let err = mgr
            .launch(LaunchRequest::new(&f.project).with_extra_args("--x='unbalanced"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Launch(LaunchError::InvalidServerArgs(_))
        ));
        assert_eq!(mgr.ports().reserved_count(), 0);
        assert!(mgr.list_running().is_empty());
        assert!(mgr.list_recent().is_empty());
    }

    #[tokio::test]
    async fn test_missing_working_directory() {
        let f = fixture();
        let mut mgr = manager(&f);
        let err = mgr
            .launch(LaunchRequest::new(f.project.join("missing")))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::WorkingDirectory { .. }));
    }

    #[tokio::test]
    async fn test_terminate_keeps_recent() {
        let f = fixture();
        let mut mgr = manager(&f);

        let launched = mgr.launch(LaunchRequest::new(&f.project)).await.unwrap();
        let mut events = launched.events.unwrap();
        let key = launched.session.key();

        let terminated = mgr.terminate(&key).await.unwrap();
        assert_eq!(terminated.state, SessionState::Terminated);
        assert!(mgr.list_running().is_empty());
        assert_eq!(mgr.list_recent().len(), 1);
        assert_eq!(mgr.ports().reserved_count(), 0);

        // The process exit still arrives and is harmless.
        let exited = tokio::time::timeout(Duration::from_secs(15), async {
            while let Some(event) = events.recv().await {
                if let ProcessEvent::Exited { .. } = event {
                    return Some(event);
                }
            }
            None
        })
        .await
        .unwrap();
        assert!(exited.is_some());
        mgr.handle_event(&key, launched.session.pid, exited.unwrap());
        assert!(mgr.list_running().is_empty());

        assert!(matches!(
            mgr.terminate(&key).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_event_only_affects_current_process() {
        let f = fixture();
        let mut mgr = manager(&f);

        let launched = mgr.launch(LaunchRequest::new(&f.project)).await.unwrap();
        let key = launched.session.key();
        let exited = ProcessEvent::Exited {
            code: Some(1),
            signal: None,
        };

        mgr.handle_event(&key, Some(u32::MAX), exited.clone());
        assert_eq!(mgr.list_running().len(), 1);

        mgr.handle_event(&key, launched.session.pid, exited);
        assert!(mgr.list_running().is_empty());
        assert_eq!(mgr.ports().reserved_count(), 0);
        assert_eq!(mgr.list_recent().len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_by_path_alias() {
        let f = fixture();
        let mut mgr = manager(&f);
        mgr.launch(LaunchRequest::new(&f.project)).await.unwrap();

        // Non-canonical spelling of the same folder
        let alias = f.project.join("..").join("proj");
        mgr.terminate(&alias.display().to_string()).await.unwrap();
        assert!(mgr.list_running().is_empty());
    }

    #[tokio::test]
    async fn test_connect_unreachable_and_invalid() {
        let f = fixture();
        let mut mgr = manager(&f);

        let session = mgr.connect("http://127.0.0.1:9/lab?token=x").await.unwrap();
        assert_eq!(session.state, SessionState::Unreachable);
        assert_eq!(session.origin, SessionOrigin::Remote);
        assert!(mgr.list_recent().is_empty());
        assert!(mgr.list_running().is_empty());

        assert!(matches!(
            mgr.connect("not a url").await,
            Err(SessionError::InvalidUrl { .. })
        ));
        assert!(matches!(
            mgr.connect("ftp://example.org/").await,
            Err(SessionError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_restore_drops_dead_servers() {
        let f = fixture();
        {
            let mut store = SessionStore::new(f.backend.clone());
            let dead = ServerItem::local(
                &crate::session::connect_url(9, "t").unwrap(),
                Path::new("/srv/dead"),
            );
            store
                .save_items(crate::store::RUNNING_KEY, &[dead])
                .unwrap();
        }

        let mut mgr = manager(&f);
        assert_eq!(mgr.restore().await, 0);
        assert!(mgr.list_running().is_empty());

        let reopened = SessionStore::new(f.backend.clone());
        assert!(reopened
            .load_items(crate::store::RUNNING_KEY)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_interpreter_falls_back_to_default() {
        let f = fixture();
        let mgr = manager(&f);
        let python = mgr.interpreter_for(&LaunchRequest::new(&f.project)).unwrap();
        assert_eq!(python, f.python);

        let explicit = mgr
            .interpreter_for(&LaunchRequest::new(&f.project).with_python("/opt/py/bin/python"))
            .unwrap();
        assert_eq!(explicit, PathBuf::from("/opt/py/bin/python"));
    }

    #[tokio::test]
    async fn test_undecodable_log_line_keeps_session_running() {
        let f = fixture();
        let python = fake_venv_with(
            &f._tmp.path().join("latin1"),
            "printf 'caf\\xe9.ipynb saved\\n' >&2\nexec sleep 60",
        );
        let mut mgr = manager(&f);

        let launched = mgr
            .launch(LaunchRequest::new(&f.project).with_python(&python))
            .await
            .unwrap();
        let key = launched.session.key();
        let pid = launched.session.pid;
        let mut events = launched.events.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = events.recv().await {
                let is_log = matches!(
                    &event,
                    ProcessEvent::OutputLine {
                        stream: OutputStream::Stderr,
                        ..
                    }
                );
                mgr.handle_event(&key, pid, event.clone());
                if is_log {
                    return Some(event);
                }
            }
            None
        })
        .await
        .unwrap();

        assert_eq!(
            line,
            Some(ProcessEvent::OutputLine {
                stream: OutputStream::Stderr,
                line: "caf\u{FFFD}.ipynb saved".to_string(),
            })
        );
        let running = mgr.list_running();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].state, SessionState::Running);

        mgr.terminate_owned().await;
    }

    #[tokio::test]
    async fn test_terminate_releases_port_when_store_fails() {
        let f = fixture();
        let backend = FailingBackend::new();
        let mut mgr =
            SessionManager::new(f.config.clone(), SessionStore::new(backend.clone())).unwrap();

        let launched = mgr.launch(LaunchRequest::new(&f.project)).await.unwrap();
        assert_eq!(mgr.ports().reserved_count(), 1);

        backend.set_failing(true);
        let terminated = mgr.terminate(&launched.session.key()).await.unwrap();
        assert_eq!(terminated.id, launched.session.id);
        assert!(mgr.list_running().is_empty());
        assert_eq!(mgr.ports().reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_releases_port_when_store_fails() {
        let f = fixture();
        let backend = FailingBackend::new();
        let mut mgr =
            SessionManager::new(f.config.clone(), SessionStore::new(backend.clone())).unwrap();

        let launched = mgr.launch(LaunchRequest::new(&f.project)).await.unwrap();
        backend.set_failing(true);
        mgr.handle_event(
            &launched.session.key(),
            launched.session.pid,
            ProcessEvent::Exited {
                code: Some(0),
                signal: None,
            },
        );
        assert!(mgr.list_running().is_empty());
        assert_eq!(mgr.ports().reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_owned_waits_for_exit() {
        let f = fixture();
        let mut mgr = manager(&f);

        let launched = mgr.launch(LaunchRequest::new(&f.project)).await.unwrap();
        let pid = launched.session.pid.unwrap() as i32;

        mgr.terminate_owned().await;
        assert!(mgr.list_running().is_empty());
        assert_eq!(mgr.ports().reserved_count(), 0);
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive);
    }
}
