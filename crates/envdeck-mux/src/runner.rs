use crate::error::MuxError;
use std::{
    path::PathBuf,
    process::{Child, Command, Stdio},
};
use tracing::debug;

/// A long-lived client process attached to the instance. Dropping or stopping
/// it detaches the client without touching the server.
pub trait ControlClient: Send {
    fn stop(&mut self);
}

/// Executes multiplexer commands against one named socket.
///
/// Every component issues its external calls through this seam so the whole
/// engine can be driven by [`crate::fake::FakeMux`] in tests.
pub trait MuxRunner: Send + Sync {
    /// Runs one command and returns its stdout.
    fn run(&self, socket: &str, args: &[String]) -> Result<String, MuxError>;

    /// Spawns a hidden client that stays attached until stopped.
    fn spawn_client(
        &self,
        socket: &str,
        args: &[String],
    ) -> Result<Box<dyn ControlClient>, MuxError>;

    /// Runs a command wired to the caller's terminal and waits for it.
    fn run_interactive(&self, socket: &str, args: &[String]) -> Result<(), MuxError>;
}

pub struct TmuxRunner {
    binary: PathBuf,
}

impl TmuxRunner {
    pub fn locate() -> Result<Self, MuxError> {
        which::which("tmux")
            .map(|binary| Self { binary })
            .map_err(|_| MuxError::NotInstalled)
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, socket: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-L").arg(socket).args(args);
        cmd
    }
}

impl MuxRunner for TmuxRunner {
    fn run(&self, socket: &str, args: &[String]) -> Result<String, MuxError> {
        let output = self
            .command(socket, args)
            .stdin(Stdio::null())
            .output()?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let status = output.status.code().unwrap_or(-1);
        debug!(socket, args = %args.join(" "), status, stderr = %stderr.trim(), "tmux_failed");
        Err(MuxError::command(args, status, &stderr))
    }

    fn spawn_client(
        &self,
        socket: &str,
        args: &[String],
    ) -> Result<Box<dyn ControlClient>, MuxError> {
        let child = self
            .command(socket, args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildClient { child: Some(child) }))
    }

    fn run_interactive(&self, socket: &str, args: &[String]) -> Result<(), MuxError> {
        let status = self.command(socket, args).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(MuxError::command(args, status.code().unwrap_or(-1), ""))
        }
    }
}

struct ChildClient {
    child: Option<Child>,
}

impl ControlClient for ChildClient {
    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for ChildClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds an owned argument vector from string slices.
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts.into_iter().map(|p| p.as_ref().to_string()).collect()
}
