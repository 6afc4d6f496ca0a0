//! Finding and stopping servers this daemon did not launch.
//!
//! Uses the `jupyter lab list` and `jupyter lab stop` commands, so servers
//! started from a terminal or by a previous daemon show up too.

use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use url::Url;

use crate::session::{folder_title, ServerItem};

/// Upper bound for one `jupyter` invocation.
pub const JUPYTER_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Parse `jupyter lab list` output into server entries.
///
/// Server lines look like `<url> :: <folder>`, optionally prefixed with the
/// app name in brackets. Everything else (headers, warnings) is ignored.
pub fn parse_server_list(output: &str) -> Vec<ServerItem> {
    output.lines().filter_map(parse_server_line).collect()
}

fn parse_server_line(line: &str) -> Option<ServerItem> {
    let mut line = line.trim();
    if line.starts_with('[') {
        line = line.split_once(']')?.1.trim_start();
    }
    let (link, folder) = line.split_once(" :: ")?;
    let url = Url::parse(link.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let folder = folder.trim();
    Some(ServerItem {
        link: url.to_string(),
        title: folder_title(folder),
        folder: Some(folder.to_string()),
    })
}

async fn run_jupyter(jupyter: &str, args: &[&str]) -> Option<std::process::Output> {
    let mut cmd = tokio::process::Command::new(jupyter);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(JUPYTER_COMMAND_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) => {
            debug!("[discovery] Could not run {} {:?}: {}", jupyter, args, e);
            None
        }
        Err(_) => {
            warn!("[discovery] {} {:?} timed out", jupyter, args);
            None
        }
    }
}

/// List running servers with `<jupyter> lab list`.
///
/// A missing or failing `jupyter` yields an empty list.
pub async fn list_servers(jupyter: &str) -> Vec<ServerItem> {
    let Some(output) = run_jupyter(jupyter, &["lab", "list"]).await else {
        return Vec::new();
    };

    // Older releases print the list on stderr.
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    let servers = parse_server_list(&text);
    debug!("[discovery] Found {} running servers", servers.len());
    servers
}

/// Stop the server on `port` with `<jupyter> lab stop <port>`.
pub async fn stop_server(jupyter: &str, port: u16) -> bool {
    let port_arg = port.to_string();
    match run_jupyter(jupyter, &["lab", "stop", &port_arg]).await {
        Some(output) if output.status.success() => {
            info!("[discovery] Stopped server on port {}", port);
            true
        }
        Some(output) => {
            warn!(
                "[discovery] Stopping server on port {} failed: {}",
                port,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        None => false,
    }
}
