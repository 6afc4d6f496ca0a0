//! Launch script supervision.
//!
//! [`spawn`] runs a generated launch script as a child process and reports
//! everything that happens to it on an event channel: each output line, read
//! failures on either pipe, and finally the exit status. The process is
//! never restarted.
//!
//! On Unix the script runs in its own process group so that terminating the
//! session also takes down the Python server it `exec`s and any kernels it
//! started.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Time a server gets to shut down cleanly before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for the output pipes to drain after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound for a full stop: the grace period, the kill, and draining
/// both pipes.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Something that happened to a supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    OutputLine { stream: OutputStream, line: String },
    /// Reading a pipe failed; no more lines will arrive from it
    StreamError { stream: OutputStream, message: String },
    /// Always the last event
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn launch script {script}: {source}")]
    SpawnFailed {
        script: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Handle to a running launch script.
///
/// Dropping the handle terminates the process.
#[derive(Debug)]
pub struct SupervisedProcess {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl SupervisedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process to stop. The resulting exit is reported as
    /// [`ProcessEvent::Exited`]. Returns false if termination was already
    /// requested or the process is gone.
    pub fn terminate(&mut self) -> bool {
        match self.stop_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Stop the process and wait until its exit has been reported, for at
    /// most `timeout`. Returns false if the exit was not observed in time.
    pub async fn terminate_and_wait(&mut self, timeout: Duration) -> bool {
        self.terminate();
        let Some(watcher) = self.watcher.take() else {
            return true;
        };
        match tokio::time::timeout(timeout, watcher).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    "[supervisor] pid {:?} still running after {:?}",
                    self.pid, timeout
                );
                false
            }
        }
    }
}

/// Run `script` from `working_dir` and start supervising it.
pub fn spawn(
    script: &Path,
    working_dir: &Path,
) -> Result<(SupervisedProcess, mpsc::UnboundedReceiver<ProcessEvent>), SupervisorError> {
    let mut cmd = script_command(script);
    cmd.current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
        script: script.to_path_buf(),
        source,
    })?;

    let pid = child.id();
    info!(
        "[supervisor] Started {} (pid {:?}) in {}",
        script.display(),
        pid,
        working_dir.display()
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel();

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(stdout, OutputStream::Stdout, event_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(stderr, OutputStream::Stderr, event_tx.clone()));
    }

    let watcher = tokio::spawn(watch(child, pid, stop_rx, readers, event_tx));

    Ok((
        SupervisedProcess {
            pid,
            stop_tx: Some(stop_tx),
            watcher: Some(watcher),
        },
        event_rx,
    ))
}

#[cfg(unix)]
fn script_command(script: &Path) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg(script);
    // Own process group so the whole tree can be signalled at once
    cmd.process_group(0);
    cmd
}

#[cfg(windows)]
fn script_command(script: &Path) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(script);
    cmd.creation_flags(CREATE_NO_WINDOW);
    cmd
}

fn forward_lines<R>(
    pipe: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<ProcessEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Servers log file names and console output in whatever
                    // encoding they have; undecodable bytes are replaced.
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(ProcessEvent::OutputLine { stream, line }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ProcessEvent::StreamError {
                        stream,
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
    })
}

/// Wait for the child to exit or for a stop request, then report the exit.
async fn watch(
    mut child: Child,
    pid: Option<u32>,
    stop_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<ProcessEvent>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        // A dropped handle counts as a stop request.
        _ = stop_rx => None,
    };
    let status = match exited {
        Some(status) => status,
        None => stop(&mut child, pid).await,
    };

    // Let the readers deliver what is left in the pipes before the exit.
    for reader in readers {
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            debug!("[supervisor] Output of pid {:?} still open after exit", pid);
        }
    }

    let event = match status {
        Ok(status) => {
            info!("[supervisor] pid {:?} exited: {}", pid, status);
            ProcessEvent::Exited {
                code: status.code(),
                signal: exit_signal(&status),
            }
        }
        Err(e) => {
            warn!("[supervisor] Failed waiting for pid {:?}: {}", pid, e);
            ProcessEvent::Exited {
                code: None,
                signal: None,
            }
        }
    };
    let _ = tx.send(event);
}

/// Signal the process group, escalating to a kill after [`TERMINATE_GRACE`].
async fn stop(child: &mut Child, pid: Option<u32>) -> std::io::Result<std::process::ExitStatus> {
    info!("[supervisor] Terminating pid {:?}", pid);

    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("[supervisor] SIGTERM to group {} failed: {}", pid, e);
            }
            match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(status) => return status,
                Err(_) => {
                    warn!(
                        "[supervisor] Group {} ignored SIGTERM, sending SIGKILL",
                        pid
                    );
                    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        debug!("[supervisor] SIGKILL to group {} failed: {}", pid, e);
                    }
                }
            }
        }
    }

    if let Err(e) = child.start_kill() {
        debug!("[supervisor] start_kill failed: {}", e);
    }
    child.wait().await
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
