//! Process supervisor - spawns, monitors and terminates the debuggee.
//!
//! Flow:
//! 1. Build the command through a [`DebuggeeSpawner`] and spawn with piped stdio
//! 2. Read stdout through the wire codec, posting decoded records as events
//! 3. Log stderr line by line (never parsed as protocol data)
//! 4. Monitor task waits for exit, drains both readers, posts `Exited` once

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{Decoded, WireCodec};
use crate::bridge::protocol::IncomingMessage;

/// Bound on waiting for output readers after exit (a grandchild may hold the pipes).
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What to run, with which arguments, from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("executable not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("permission denied: {}", path.display())]
    PermissionDenied { path: PathBuf },
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} not captured")]
    Pipe(&'static str),
}

impl LaunchError {
    fn from_io(path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Spawn { path, source },
        }
    }
}

/// Extension point for different debuggee spawn strategies.
pub trait DebuggeeSpawner: Send + Sync {
    /// Build the command for `spec`. Stdio and lifetime settings are applied by the supervisor.
    fn command(&self, spec: &LaunchSpec) -> Command;
}

/// Runs the executable directly.
pub struct ExecSpawner;

impl DebuggeeSpawner for ExecSpawner {
    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut command = Command::new(&spec.executable);
        command.args(&spec.args).current_dir(&spec.cwd);
        command
    }
}

/// How the debuggee ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Notifications from a running debuggee, in arrival order per stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Message(IncomingMessage),
    Malformed { line: String, error: String },
    /// Sent exactly once, after stdout and stderr are drained.
    Exited(ExitInfo),
}

/// Handle to a live (or finished) debuggee.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: CancellationToken,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request termination. Idempotent and non-blocking; the monitor task
    /// performs the actual signalling.
    pub fn terminate(&self) {
        if !self.kill.is_cancelled() && !self.has_exited() {
            tracing::info!(pid = ?self.pid, "Terminating debuggee");
        }
        self.kill.cancel();
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Spawn the debuggee and start its reader and monitor tasks.
///
/// Returns the handle plus the debuggee's stdin for the request writer.
pub fn start(
    spawner: &dyn DebuggeeSpawner,
    spec: &LaunchSpec,
    terminate_grace: Duration,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> Result<(ProcessHandle, ChildStdin), LaunchError> {
    tracing::info!(
        executable = %spec.executable.display(),
        args = ?spec.args,
        cwd = %spec.cwd.display(),
        "Spawning debuggee"
    );

    let mut child = spawner
        .command(spec)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| LaunchError::from_io(spec.executable.clone(), e))?;

    let pid = child.id();
    tracing::info!(?pid, "Debuggee spawned");

    let stdin = child.stdin.take().ok_or(LaunchError::Pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(LaunchError::Pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(LaunchError::Pipe("stderr"))?;

    let stdout_task = tokio::spawn(read_stdout(stdout, events.clone()));
    let stderr_task = tokio::spawn(read_stderr(stderr));

    let kill = CancellationToken::new();
    let exited = Arc::new(AtomicBool::new(false));

    tokio::spawn(monitor(
        child,
        kill.clone(),
        terminate_grace,
        [stdout_task, stderr_task],
        Arc::clone(&exited),
        events,
    ));

    Ok((ProcessHandle { pid, kill, exited }, stdin))
}

async fn read_stdout<R>(stdout: R, events: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = FramedRead::new(stdout, WireCodec::new());
    while let Some(item) = reader.next().await {
        let event = match item {
            Ok(Decoded::Message(msg)) => {
                tracing::debug!(
                    target: "etch_bridge::backend",
                    kind = msg.kind(),
                    name = msg.name(),
                    "Received from debuggee"
                );
                ProcessEvent::Message(msg)
            }
            Ok(Decoded::Malformed { line, error }) => {
                tracing::warn!(target: "etch_bridge::backend", %line, %error, "Failed to parse debuggee output");
                ProcessEvent::Malformed { line, error }
            }
            Err(e) => {
                tracing::error!(error = %e, "Debuggee stdout read error");
                break;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
    tracing::debug!("Debuggee stdout reader exiting");
}

async fn read_stderr<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: "etch_bridge::debuggee", "{}", line);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Debuggee stderr read error");
                break;
            }
        }
    }
    tracing::debug!("Debuggee stderr reader exiting");
}

async fn monitor(
    mut child: Child,
    kill: CancellationToken,
    terminate_grace: Duration,
    readers: [JoinHandle<()>; 2],
    exited: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let exited_early = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };
    let status = match exited_early {
        Some(status) => status,
        None => {
            request_stop(&mut child);
            match tokio::time::timeout(terminate_grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(?terminate_grace, "Debuggee ignored termination request - killing");
                    if let Err(e) = child.start_kill() {
                        tracing::error!(error = %e, "Failed to kill debuggee");
                    }
                    child.wait().await
                }
            }
        }
    };

    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            tracing::warn!("Debuggee output still open after exit - abandoning reader");
            abort.abort();
        }
    }

    let info = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            tracing::error!(error = %e, "Failed to wait for debuggee");
            ExitInfo::default()
        }
    };
    tracing::info!(code = ?info.code, signal = ?info.signal, "Debuggee exited");

    exited.store(true, Ordering::SeqCst);
    let _ = events.send(ProcessEvent::Exited(info));
}

/// Ask the child to stop: SIGTERM where available, hard kill otherwise.
fn request_stop(child: &mut Child) {
    if let Some(pid) = child.id()
        && send_sigterm(pid)
    {
        return;
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "start_kill on debuggee failed");
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(pid, error = %e, "SIGTERM failed - killing");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}
