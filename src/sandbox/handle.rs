//! Configured sandbox commands and handles to running sandboxed children.

use std::process::{ExitStatus, Output, Stdio};

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::error::SandboxError;

/// A sandboxed command that has not been started yet.
///
/// Produced by [`crate::sandbox::Policy::command`]. The caller plumbs stdio
/// through [`SandboxCommand::command_mut`] as needed — nothing is inherited
/// by assumption — then starts the child with [`SandboxCommand::spawn`] or
/// runs it to completion with [`SandboxCommand::output`].
#[derive(Debug)]
pub struct SandboxCommand {
    command: Command,
    /// Per-launch temp directory (profile-based platform only). Rides along
    /// into the child handle so it outlives the child, and is removed when
    /// that handle drops.
    temp_dir: Option<TempDir>,
    cancel: CancellationToken,
}

impl SandboxCommand {
    pub(crate) fn new(
        mut command: Command,
        temp_dir: Option<TempDir>,
        cancel: CancellationToken,
    ) -> Self {
        // An abandoned handle must not leak a sandboxed child.
        command.kill_on_drop(true);
        Self {
            command,
            temp_dir,
            cancel,
        }
    }

    /// Mutable access to the underlying command for stdio plumbing and
    /// environment additions (for example a proxy's
    /// [`crate::proxy::NetworkProxy::env`] bundle).
    pub fn command_mut(&mut self) -> &mut Command {
        &mut self.command
    }

    /// Start the sandboxed child.
    pub fn spawn(mut self) -> Result<SandboxChild, SandboxError> {
        let child = self.command.spawn().map_err(SandboxError::Spawn)?;
        let pid = child.id();
        info!(pid, "sandbox started");
        Ok(SandboxChild {
            child,
            pid,
            temp_dir: self.temp_dir,
            cancel: self.cancel,
        })
    }

    /// Run the command to completion, capturing stdout and stderr.
    pub async fn output(mut self) -> Result<Output, SandboxError> {
        self.command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.spawn()?.wait_with_output().await
    }
}

/// Handle to a running sandboxed child.
///
/// Dropping the handle kills the child and removes the per-launch temp
/// directory, if one was created. Exit codes propagate from the child
/// unchanged.
pub struct SandboxChild {
    child: Child,
    /// OS process id of the launcher process, while it is running.
    pub pid: Option<u32>,
    temp_dir: Option<TempDir>,
    cancel: CancellationToken,
}

impl SandboxChild {
    /// Wait for the child to exit.
    ///
    /// If the launch's cancellation token fires first, the child is killed
    /// through the host's standard termination path and then reaped.
    pub async fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        tokio::select! {
            status = self.child.wait() => status.map_err(SandboxError::Wait),
            _ = self.cancel.cancelled() => {
                // start_kill fails only when the child already exited;
                // either way the subsequent wait reaps it.
                let _ = self.child.start_kill();
                self.child.wait().await.map_err(SandboxError::Wait)
            }
        }
    }

    /// Wait for the child to exit, collecting its piped stdout and stderr.
    ///
    /// Pipes are drained concurrently with the wait so a chatty child
    /// cannot deadlock against a full pipe buffer.
    pub async fn wait_with_output(mut self) -> Result<Output, SandboxError> {
        let mut stdout_pipe = self.child.stdout.take();
        let mut stderr_pipe = self.child.stderr.take();

        let (status, stdout, stderr) = tokio::join!(
            self.wait(),
            drain(&mut stdout_pipe),
            drain(&mut stderr_pipe),
        );

        Ok(Output {
            status: status?,
            stdout: stdout.map_err(SandboxError::Wait)?,
            stderr: stderr.map_err(SandboxError::Wait)?,
        })
    }

    /// Check for exit without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, SandboxError> {
        self.child.try_wait().map_err(SandboxError::Wait)
    }

    /// Kill the child (SIGKILL) and reap it.
    pub async fn kill(&mut self) -> Result<(), SandboxError> {
        self.child.kill().await.map_err(SandboxError::Wait)
    }

    /// Send a signal to the child.
    pub fn signal(&self, signal: nix::sys::signal::Signal) -> Result<(), SandboxError> {
        let pid = self
            .child
            .id()
            .ok_or(SandboxError::Signal(nix::Error::ESRCH))?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal)
            .map_err(SandboxError::Signal)
    }

    /// Take the child's stdin pipe, if it was piped.
    pub fn stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Take the child's stdout pipe, if it was piped.
    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the child's stderr pipe, if it was piped.
    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Path of the per-launch temp directory, when one exists.
    pub fn temp_dir(&self) -> Option<&std::path::Path> {
        self.temp_dir.as_ref().map(|d| d.path())
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: &mut Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(program: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    }

    #[tokio::test]
    async fn output_captures_stdout() {
        let cmd = SandboxCommand::new(
            plain("echo", &["hello world"]),
            None,
            CancellationToken::new(),
        );
        let output = cmd.output().await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello world");
    }

    #[tokio::test]
    async fn exit_codes_propagate_unchanged() {
        let cmd = SandboxCommand::new(
            plain("sh", &["-c", "exit 7"]),
            None,
            CancellationToken::new(),
        );
        let output = cmd.output().await.unwrap();
        assert_eq!(output.status.code(), Some(7));
    }

    #[tokio::test]
    async fn cancellation_terminates_running_child() {
        let token = CancellationToken::new();
        let cmd = SandboxCommand::new(plain("sleep", &["30"]), None, token.clone());
        let mut child = cmd.spawn().unwrap();
        token.cancel();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn temp_dir_removed_when_handle_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let cmd = SandboxCommand::new(plain("true", &[]), Some(dir), CancellationToken::new());
        let mut child = cmd.spawn().unwrap();
        child.wait().await.unwrap();
        assert!(path.exists(), "temp dir must survive until the handle drops");

        drop(child);
        assert!(!path.exists(), "temp dir must be removed with the handle");
    }

    #[tokio::test]
    async fn try_wait_reports_exit() {
        let cmd = SandboxCommand::new(plain("true", &[]), None, CancellationToken::new());
        let mut child = cmd.spawn().unwrap();
        child.wait().await.unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }
}
