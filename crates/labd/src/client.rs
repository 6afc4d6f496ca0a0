//! Client for communicating with labd.
//!
//! The desktop UI and the `labd` CLI subcommands use this client to drive
//! the daemon.

use std::path::PathBuf;
use std::time::Duration;

use log::info;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

#[cfg(unix)]
use tokio::net::UnixStream;
#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::default_socket_path;
use crate::manager::LaunchRequest;
use crate::protocol::{Request, Response};
use crate::session::{ServerItem, Session};

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Daemon returned error: {0}")]
    DaemonError(String),

    #[error("Connection timeout")]
    Timeout,
}

/// Client for labd.
pub struct LabClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
}

impl Default for LabClient {
    fn default() -> Self {
        Self::new(default_socket_path())
    }
}

impl LabClient {
    /// Create a new client with a custom socket path.
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            connect_timeout: Duration::from_secs(2),
        }
    }

    /// Set the connection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Check if the daemon is running.
    pub async fn is_daemon_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Ping the daemon to check if it's alive.
    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.send_request(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Serve a folder. Returns the session and whether it was reused.
    pub async fn launch(&self, request: LaunchRequest) -> Result<(Session, bool), ClientError> {
        match self.send_request(Request::Launch(request)).await? {
            Response::Session { session, reused } => {
                info!(
                    "[lab-client] {} session at {}",
                    if reused { "Reusing" } else { "Launched" },
                    session.url
                );
                Ok((session, reused))
            }
            other => Err(unexpected(other)),
        }
    }

    /// Connect to a server by URL.
    pub async fn connect(&self, url: &str) -> Result<Session, ClientError> {
        match self
            .send_request(Request::Connect {
                url: url.to_string(),
            })
            .await?
        {
            Response::Session { session, .. } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_running(&self) -> Result<Vec<Session>, ClientError> {
        match self.send_request(Request::ListRunning).await? {
            Response::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_recent(&self) -> Result<Vec<ServerItem>, ClientError> {
        match self.send_request(Request::ListRecent).await? {
            Response::Recent { items } => Ok(items),
            other => Err(unexpected(other)),
        }
    }

    /// Stop the session for a folder or URL.
    pub async fn terminate(&self, key: &str) -> Result<Session, ClientError> {
        match self
            .send_request(Request::Terminate {
                key: key.to_string(),
            })
            .await?
        {
            Response::Terminated { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    pub async fn refresh(&self) -> Result<Vec<Session>, ClientError> {
        match self.send_request(Request::Refresh).await? {
            Response::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    /// Request daemon shutdown.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        match self.send_request(Request::Shutdown).await? {
            Response::ShuttingDown => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Send a request to the daemon and receive a response.
    async fn send_request(&self, request: Request) -> Result<Response, ClientError> {
        #[cfg(unix)]
        let stream = {
            let connect_result =
                tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
                    .await;
            match connect_result {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(ClientError::ConnectionFailed(e)),
                Err(_) => return Err(ClientError::Timeout),
            }
        };

        #[cfg(windows)]
        let stream = {
            let pipe_name = self.socket_path.to_string_lossy().to_string();
            let connect_result = tokio::time::timeout(self.connect_timeout, async {
                // Named pipes may need retry if server is between connections
                let mut attempts = 0;
                loop {
                    match ClientOptions::new().open(&pipe_name) {
                        Ok(client) => return Ok(client),
                        Err(_) if attempts < 5 => {
                            attempts += 1;
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
            .await;
            match connect_result {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(ClientError::ConnectionFailed(e)),
                Err(_) => return Err(ClientError::Timeout),
            }
        };

        exchange(stream, request).await
    }
}

async fn exchange<S>(stream: S, request: Request) -> Result<Response, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    // Send request
    let line = request
        .to_line()
        .map_err(|e| ClientError::ProtocolError(format!("Failed to serialize: {}", e)))?;
    writer.write_all(line.as_bytes()).await?;

    // Read response
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;

    Response::from_line(&response_line)
        .map_err(|e| ClientError::ProtocolError(format!("Failed to parse response: {}", e)))
}

fn unexpected(response: Response) -> ClientError {
    match response {
        Response::Error { message } => ClientError::DaemonError(message),
        other => ClientError::ProtocolError(format!("Unexpected response: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_default() {
        let client = LabClient::default();
        assert!(client.socket_path.to_string_lossy().contains("labd"));
    }

    #[test]
    fn test_client_custom_path() {
        let client = LabClient::new(PathBuf::from("/tmp/test.sock"));
        assert_eq!(client.socket_path, PathBuf::from("/tmp/test.sock"));
    }

    #[test]
    fn test_error_response_maps_to_daemon_error() {
        let err = unexpected(Response::Error {
            message: "nope".to_string(),
        });
        assert!(matches!(err, ClientError::DaemonError(m) if m == "nope"));
        assert!(matches!(unexpected(Response::Pong), ClientError::ProtocolError(_)));
    }
}
