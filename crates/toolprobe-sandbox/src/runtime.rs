//! Sandbox runtime control surface.
//!
//! The core consumes exactly four runtime operations: run (create and start
//! with attached stdio), kill, forced remove and inspect-by-name. They sit
//! behind [`SandboxRuntime`] so the lifecycle logic can be driven by the
//! docker CLI in production and by in-memory doubles in tests.
//!
//! Kill and forced remove also come in blocking flavours. Those are used by
//! the shutdown sweep, which runs on the blocking pool or inside a `Drop`
//! impl where no async context is available.

use crate::error::{ProbeError, Result, SandboxError};
use crate::launcher::LaunchSpec;
use crate::state::SandboxStatus;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use wait_timeout::ChildExt;

/// Default container CLI binary.
pub const DOCKER_CLI: &str = "docker";

/// Default upper bound on one status query.
pub const DEFAULT_INSPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Stdio of a freshly started sandbox.
///
/// Owns the child process (if any) so the process is reaped when the stdio
/// is dropped.
pub struct SandboxStdio {
    /// Stream carrying the sandbox's standard output.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Stream feeding the sandbox's standard input.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// The launched process.
    pub child: Option<Child>,
}

impl SandboxStdio {
    /// Wraps in-memory streams with no backing process.
    pub fn detached(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }
}

impl std::fmt::Debug for SandboxStdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxStdio")
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

/// Operations the lifecycle core needs from a sandbox runtime.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Starts the launch command with piped stdio.
    async fn run(&self, spec: &LaunchSpec) -> Result<SandboxStdio>;

    /// Force-stops the named sandbox, giving up after `timeout`.
    async fn kill(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Force-removes the named sandbox, giving up after `timeout`.
    async fn force_remove(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Queries the status of the named sandbox.
    async fn inspect(&self, name: &str) -> std::result::Result<SandboxStatus, ProbeError>;

    /// Force-stops the named sandbox, blocking the calling thread.
    fn kill_blocking(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Force-removes the named sandbox, blocking the calling thread.
    fn force_remove_blocking(&self, name: &str, timeout: Duration) -> Result<()>;
}

/// Runtime backed by the docker (or docker-compatible) CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    inspect_timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(DOCKER_CLI)
    }
}

impl DockerCli {
    /// Creates a runtime driving the given CLI binary.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            inspect_timeout: DEFAULT_INSPECT_TIMEOUT,
        }
    }

    /// Sets the upper bound on one status query.
    #[must_use]
    pub fn with_inspect_timeout(mut self, timeout: Duration) -> Self {
        self.inspect_timeout = timeout;
        self
    }

    /// Returns the CLI binary name.
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn status_command(&self, args: &[&str], timeout: Duration) -> Result<()> {
        let mut command = Command::new(&self.binary);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        let output = tokio::time::timeout(timeout, command.output()).await.map_err(|_| {
            SandboxError::timeout(format!(
                "{} {} exceeded {timeout:?}",
                self.binary,
                args.join(" ")
            ))
        })??;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(SandboxError::runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    fn status_command_blocking(&self, args: &[&str], timeout: Duration) -> Result<()> {
        let mut child = std::process::Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        match child.wait_timeout(timeout)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(SandboxError::runtime(format!(
                "{} {} exited with {status}",
                self.binary,
                args.join(" ")
            ))),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(SandboxError::timeout(format!(
                    "{} {} exceeded {timeout:?}",
                    self.binary,
                    args.join(" ")
                )))
            }
        }
    }
}

#[async_trait]
impl SandboxRuntime for DockerCli {
    async fn run(&self, spec: &LaunchSpec) -> Result<SandboxStdio> {
        spawn_attached(&spec.program, &spec.args, spec.host_env.as_ref())
    }

    async fn kill(&self, name: &str, timeout: Duration) -> Result<()> {
        self.status_command(&["kill", name], timeout).await
    }

    async fn force_remove(&self, name: &str, timeout: Duration) -> Result<()> {
        self.status_command(&["rm", "-f", name], timeout).await
    }

    async fn inspect(&self, name: &str) -> std::result::Result<SandboxStatus, ProbeError> {
        let mut command = Command::new(&self.binary);
        command
            .args(["inspect", "--format", "{{.State.Status}}", name])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.inspect_timeout, command.output())
            .await
            .map_err(|_| {
                ProbeError::Transport(format!(
                    "{} inspect {name} exceeded {:?}",
                    self.binary, self.inspect_timeout
                ))
            })?
            .map_err(|e| ProbeError::Transport(format!("{}: {e}", self.binary)))?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Ok(SandboxStatus::from_status(&stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_inspect_failure(name, &stderr))
    }

    fn kill_blocking(&self, name: &str, timeout: Duration) -> Result<()> {
        self.status_command_blocking(&["kill", name], timeout)
    }

    fn force_remove_blocking(&self, name: &str, timeout: Duration) -> Result<()> {
        self.status_command_blocking(&["rm", "-f", name], timeout)
    }
}

/// Spawns a command with piped stdin/stdout and inherited stderr.
///
/// `env` overlays the inherited process environment when set.
///
/// # Errors
///
/// Returns [`SandboxError::Spawn`] if the process cannot be started.
pub fn spawn_attached(
    program: &str,
    args: &[String],
    env: Option<&std::collections::BTreeMap<String, String>>,
) -> Result<SandboxStdio> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(env) = env {
        command.envs(env);
    }

    let mut child = command
        .spawn()
        .map_err(|e| SandboxError::Spawn(format!("{program}: {e}")))?;

    let writer = child
        .stdin
        .take()
        .ok_or_else(|| SandboxError::Spawn(format!("{program}: stdin not captured")))?;
    let reader = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Spawn(format!("{program}: stdout not captured")))?;

    Ok(SandboxStdio {
        reader: Box::new(reader),
        writer: Box::new(writer),
        child: Some(child),
    })
}

/// Maps an inspect failure onto not-found or transport error.
fn classify_inspect_failure(name: &str, stderr: &str) -> ProbeError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("no such object") || lowered.contains("no such container") {
        ProbeError::NotFound(name.to_string())
    } else {
        ProbeError::Transport(stderr.trim().to_string())
    }
}
