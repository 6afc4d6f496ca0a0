//! labd server implementation.
//!
//! The daemon owns a [`SessionManager`] and serves NDJSON requests from the
//! desktop UI over a Unix domain socket (a named pipe on Windows). Process
//! events from launched servers are pumped back into the manager by one
//! task per session.

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex, Notify};

#[cfg(unix)]
use tokio::net::UnixListener;
#[cfg(windows)]
use tokio::net::windows::named_pipe::ServerOptions;

use crate::default_socket_path;
use crate::manager::{ManagerConfig, SessionManager};
use crate::protocol::{Request, Response};
use crate::settings::LabSettings;
use crate::singleton::{default_lock_dir, DaemonInfo, DaemonLock};
use crate::store::SessionStore;
use crate::supervisor::ProcessEvent;

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Socket path for IPC.
    pub socket_path: PathBuf,
    /// Persisted running/recent lists.
    pub sessions_path: PathBuf,
    /// Directory for the singleton lock and info files.
    pub lock_dir: PathBuf,
    pub manager: ManagerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_settings(&LabSettings::default())
    }
}

impl DaemonConfig {
    pub fn from_settings(settings: &LabSettings) -> Self {
        Self {
            socket_path: default_socket_path(),
            sessions_path: crate::default_sessions_path(),
            lock_dir: default_lock_dir(),
            manager: ManagerConfig::from_settings(settings),
        }
    }
}

/// Error returned when another daemon is already running.
#[derive(Debug, thiserror::Error)]
#[error("Another daemon is already running: {info:?}")]
pub struct DaemonAlreadyRunning {
    pub info: DaemonInfo,
}

/// The labd daemon state.
pub struct Daemon {
    config: DaemonConfig,
    manager: Mutex<SessionManager>,
    /// Notifier to wake up the accept loop on shutdown.
    shutdown_notify: Notify,
    /// Singleton lock - kept alive while daemon is running.
    _lock: DaemonLock,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    ///
    /// Fails if another daemon holds the lock for `config.lock_dir`.
    pub fn new(config: DaemonConfig) -> anyhow::Result<Arc<Self>> {
        let lock = DaemonLock::try_acquire(&config.lock_dir)
            .map_err(|info| DaemonAlreadyRunning { info })?;

        let store = SessionStore::open_file(&config.sessions_path);
        let manager = SessionManager::new(config.manager.clone(), store)?;

        Ok(Arc::new(Self {
            config,
            manager: Mutex::new(manager),
            shutdown_notify: Notify::new(),
            _lock: lock,
        }))
    }

    /// Run the daemon server.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            // Ensure socket directory exists
            if let Some(parent) = self.config.socket_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            // Remove stale socket file
            if self.config.socket_path.exists() {
                tokio::fs::remove_file(&self.config.socket_path).await?;
            }
        }

        // Write daemon info so clients can discover us
        if let Err(e) = self
            ._lock
            .write_info(&self.config.socket_path.to_string_lossy())
        {
            error!("[labd] Failed to write daemon info: {}", e);
        }

        // Servers left running by a previous daemon are picked up again
        let restored = self.manager.lock().await.restore().await;
        if restored > 0 {
            info!("[labd] Re-adopted {} running servers", restored);
        }

        #[cfg(unix)]
        self.run_unix_server().await?;

        #[cfg(windows)]
        self.run_windows_server().await?;

        info!("[labd] Terminating owned servers");
        self.manager.lock().await.terminate_owned().await;

        #[cfg(unix)]
        tokio::fs::remove_file(&self.config.socket_path).await.ok();

        Ok(())
    }

    #[cfg(unix)]
    async fn run_unix_server(self: &Arc<Self>) -> anyhow::Result<()> {
        let listener = UnixListener::bind(&self.config.socket_path)?;
        info!("[labd] Listening on {:?}", self.config.socket_path);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let daemon = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = daemon.handle_connection(stream).await {
                                    error!("[labd] Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("[labd] Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown_notify.notified() => {
                    info!("[labd] Shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    #[cfg(windows)]
    async fn run_windows_server(self: &Arc<Self>) -> anyhow::Result<()> {
        let pipe_name = self.config.socket_path.to_string_lossy().to_string();
        info!("[labd] Listening on {}", pipe_name);

        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&pipe_name)?;

        loop {
            tokio::select! {
                connect_result = server.connect() => {
                    if let Err(e) = connect_result {
                        error!("[labd] Pipe connect error: {}", e);
                        continue;
                    }

                    // Hand off the connected instance and open the next one
                    // before serving, so other clients can connect meanwhile.
                    let connected = server;
                    server = ServerOptions::new().create(&pipe_name)?;

                    let daemon = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = daemon.handle_connection(connected).await {
                            error!("[labd] Connection error: {}", e);
                        }
                    });
                }
                _ = self.shutdown_notify.notified() => {
                    info!("[labd] Shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a single client connection.
    async fn handle_connection<S>(self: Arc<Self>, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                // Connection closed
                break;
            }

            let response = match Request::from_line(&line) {
                Ok(request) => self.clone().handle_request(request).await,
                Err(e) => Response::Error {
                    message: format!("Invalid request: {}", e),
                },
            };
            writer.write_all(response.to_line()?.as_bytes()).await?;
        }

        Ok(())
    }

    /// Handle a single request.
    async fn handle_request(self: Arc<Self>, request: Request) -> Response {
        match request {
            Request::Launch(launch) => {
                let result = self.manager.lock().await.launch(launch).await;
                match result {
                    Ok(launched) => {
                        if let Some(events) = launched.events {
                            self.clone().pump_events(
                                launched.session.key(),
                                launched.session.pid,
                                events,
                            );
                        }
                        Response::Session {
                            session: launched.session,
                            reused: launched.reused,
                        }
                    }
                    Err(e) => error_response(e),
                }
            }

            Request::Connect { url } => match self.manager.lock().await.connect(&url).await {
                Ok(session) => Response::Session {
                    session,
                    reused: false,
                },
                Err(e) => error_response(e),
            },

            Request::ListRunning => Response::Sessions {
                sessions: self.manager.lock().await.list_running(),
            },

            Request::ListRecent => Response::Recent {
                items: self.manager.lock().await.list_recent(),
            },

            Request::Terminate { key } => match self.manager.lock().await.terminate(&key).await {
                Ok(session) => Response::Terminated { session },
                Err(e) => error_response(e),
            },

            Request::Refresh => Response::Sessions {
                sessions: self.manager.lock().await.refresh().await,
            },

            Request::Ping => Response::Pong,

            Request::Shutdown => {
                self.shutdown_notify.notify_one();
                Response::ShuttingDown
            }
        }
    }

    /// Forward a session's process events into the manager until it exits.
    fn pump_events(
        self: Arc<Self>,
        key: String,
        pid: Option<u32>,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let last = matches!(event, ProcessEvent::Exited { .. });
                self.manager.lock().await.handle_event(&key, pid, event);
                if last {
                    break;
                }
            }
        });
    }
}

fn error_response(e: impl std::fmt::Display) -> Response {
    warn!("[labd] Request failed: {}", e);
    Response::Error {
        message: e.to_string(),
    }
}
