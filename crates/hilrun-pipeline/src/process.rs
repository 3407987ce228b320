//! Child process ownership.
//!
//! Whoever spawns a process owns a [`SupervisedChild`] for it and must either
//! hand it on or call [`SupervisedChild::terminate`]. Children are spawned with
//! `kill_on_drop`, so a dropped owner (an aborted task, an early `?`) still
//! kills the process.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// A child process that is killed and reaped when its owner is done with it.
#[derive(Debug)]
pub struct SupervisedChild {
    child: Child,
    program: String,
}

impl SupervisedChild {
    /// Spawn `cmd`, forcing `kill_on_drop`.
    pub fn spawn(mut cmd: Command, program: &str) -> io::Result<Self> {
        cmd.kill_on_drop(true);
        let child = cmd.spawn()?;
        tracing::debug!(program, pid = ?child.id(), "spawned child process");
        Ok(Self {
            child,
            program: program.to_string(),
        })
    }

    /// OS process id, or `None` once the child has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Exit status if the child has already exited.
    pub fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait up to `limit` for the child to exit on its own.
    pub async fn wait_for(&mut self, limit: Duration) -> Option<ExitStatus> {
        tokio::time::timeout(limit, self.child.wait())
            .await
            .ok()
            .and_then(Result::ok)
    }

    /// Kill the child (if still running) and reap it.
    pub async fn terminate(mut self) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }
        let pid = self.child.id();
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(program = %self.program, ?pid, error = %e, "failed to kill child");
        }
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(program = %self.program, ?pid, %status, "child reaped");
                Some(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(program = %self.program, ?pid, error = %e, "failed to reap child");
                None
            }
            Err(_) => {
                tracing::warn!(program = %self.program, ?pid, "child did not exit after kill");
                None
            }
        }
    }
}

/// Output of a process run to completion.
#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Why [`run_captured`] did not produce output.
#[derive(Debug)]
pub enum CaptureError {
    /// The process could not be started.
    Spawn(io::Error),
    /// Waiting on the process failed.
    Wait(io::Error),
    /// Cancelled; the process was killed and reaped.
    Cancelled,
}

pub(crate) async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        if let Err(e) = r.read_to_end(&mut buf).await {
            tracing::debug!(error = %e, "pipe read ended early");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Run a process to completion, capturing stdout and stderr separately.
///
/// Cancellation kills and reaps the process before returning.
pub async fn run_captured(
    mut cmd: Command,
    program: &str,
    cancel: &CancellationToken,
) -> Result<Captured, CaptureError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = SupervisedChild::spawn(cmd, program).map_err(CaptureError::Spawn)?;

    let stdout = tokio::spawn(read_all(child.take_stdout()));
    let stderr = tokio::spawn(read_all(child.take_stderr()));

    let status = tokio::select! {
        status = child.child.wait() => status.map_err(CaptureError::Wait)?,
        _ = cancel.cancelled() => {
            tracing::info!(program, "cancelling child process");
            child.terminate().await;
            stdout.abort();
            stderr.abort();
            return Err(CaptureError::Cancelled);
        }
    };

    Ok(Captured {
        status,
        stdout: stdout.await.unwrap_or_default(),
        stderr: stderr.await.unwrap_or_default(),
    })
}

/// Whether a process id is still alive (not yet reaped).
#[cfg(target_os = "linux")]
pub fn pid_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_streams_separately() {
        let cancel = CancellationToken::new();
        let out = run_captured(sh("echo out; echo err >&2; exit 3"), "sh", &cancel)
            .await
            .unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let cmd = Command::new("definitely-not-a-real-tool-xyz");
        let err = run_captured(cmd, "definitely-not-a-real-tool-xyz", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Spawn(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = run_captured(sh("exec sleep 30"), "sh", &cancel).await.unwrap_err();
        assert!(matches!(err, CaptureError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminate_reaps() {
        let mut cmd = sh("exec sleep 30");
        cmd.stdout(Stdio::null());
        let child = SupervisedChild::spawn(cmd, "sh").unwrap();
        let pid = child.id().unwrap();
        assert!(pid_alive(pid));
        child.terminate().await;
        assert!(!pid_alive(pid));
    }
}
