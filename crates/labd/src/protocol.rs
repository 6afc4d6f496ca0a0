//! IPC protocol between the desktop UI and labd.
//!
//! Messages are newline-delimited JSON (NDJSON) for simplicity.

use serde::{Deserialize, Serialize};

use crate::manager::LaunchRequest;
use crate::session::{ServerItem, Session};

/// Requests that clients can send to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Serve a folder, reusing a running server for it if there is one.
    Launch(LaunchRequest),

    /// Connect to a server by URL and remember it.
    Connect { url: String },

    /// List running sessions.
    ListRunning,

    /// List recently used servers, newest first.
    ListRecent,

    /// Stop the session for a folder or URL.
    Terminate { key: String },

    /// Re-check running sessions and pick up servers started elsewhere.
    Refresh,

    /// Ping to check if daemon is alive.
    Ping,

    /// Request daemon shutdown (for clean termination).
    Shutdown,
}

/// Responses from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// A launched, reused or connected session.
    Session { session: Session, reused: bool },

    /// Running sessions.
    Sessions { sessions: Vec<Session> },

    /// Recently used servers.
    Recent { items: Vec<ServerItem> },

    /// Session stopped.
    Terminated { session: Session },

    /// Pong response to ping.
    Pong,

    /// Shutdown acknowledged.
    ShuttingDown,

    /// An error occurred.
    Error { message: String },
}

impl Request {
    /// Serialize request to JSON line (with newline terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse request from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl Response {
    /// Serialize response to JSON line (with newline terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse response from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_launch_request_wire_format() {
        let req = Request::Launch(LaunchRequest::new("/home/u/proj").with_python("/usr/bin/python3"));
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "launch");
        assert_eq!(value["working_directory"], "/home/u/proj");
        assert!(value.get("extra_args").is_none());

        match Request::from_line(&line).unwrap() {
            Request::Launch(launch) => {
                assert_eq!(launch.working_directory, PathBuf::from("/home/u/proj"));
                assert_eq!(launch.python, Some(PathBuf::from("/usr/bin/python3")));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_minimal_launch_from_ui() {
        let req = Request::from_line(r#"{"type":"launch","working_directory":"/p"}"#).unwrap();
        assert!(matches!(req, Request::Launch(LaunchRequest { python: None, .. })));
    }

    #[test]
    fn test_unit_requests() {
        let parsed = Request::from_line("{\"type\":\"list_running\"}\n").unwrap();
        assert!(matches!(parsed, Request::ListRunning));
        assert!(Request::from_line(r#"{"type":"launch_rocket"}"#).is_err());
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response::Error {
            message: "boom".to_string(),
        };
        let line = resp.to_line().unwrap();
        assert!(line.contains("\"type\":\"error\""));

        let parsed = Response::from_line(&line).unwrap();
        assert!(matches!(parsed, Response::Error { message } if message == "boom"));
    }
}
