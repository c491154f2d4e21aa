//! Isolation strategies for launching guest programs.
//!
//! A strategy turns a [`Launch`] request into a command that the sandbox
//! spawns on the slave side of its pseudo-terminal. The sandbox owns the
//! resulting process handle (kill/wait); the strategy only contributes the
//! command line, the environment, and any teardown of its own (for example
//! removing a container that outlives its client process).

use crate::error::{CoreError, Result};
use crate::sandbox::SandboxId;
use async_trait::async_trait;
use portable_pty::CommandBuilder;
use std::fmt;
use std::path::{Path, PathBuf};

/// Mount point of the control directory inside a container.
pub const CONTAINER_CONTROL_DIR: &str = "/tracebox";

/// Everything an isolation strategy needs to build the guest command.
#[derive(Debug, Clone, Copy)]
pub struct Launch<'a> {
    /// Sandbox the launch belongs to.
    pub sandbox_id: SandboxId,
    /// Instrumented program text.
    pub program: &'a str,
    /// Host path of the control-channel socket.
    pub control_path: &'a Path,
    /// Environment variable through which the guest finds the socket.
    pub control_env: &'a str,
}

/// Pluggable launcher for the isolated subprocess.
#[async_trait]
pub trait Isolation: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Build the command to run on the terminal.
    fn command(&self, launch: &Launch<'_>) -> Result<CommandBuilder>;

    /// Strategy-specific cleanup after the process handle has been killed.
    async fn terminate(&self, _sandbox_id: SandboxId) {}
}

/// Runs the interpreter directly as a child process.
///
/// Offers no isolation beyond a separate process and session; intended for
/// development hosts without a container runtime.
#[derive(Debug, Clone)]
pub struct DirectIsolation {
    interpreter: PathBuf,
}

impl DirectIsolation {
    /// Use the given Python interpreter.
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    /// Interpreter path.
    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }
}

impl Default for DirectIsolation {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl Isolation for DirectIsolation {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn command(&self, launch: &Launch<'_>) -> Result<CommandBuilder> {
        let mut cmd = CommandBuilder::new(&self.interpreter);
        cmd.args(["-u", "-c", launch.program]);
        cmd.env(launch.control_env, launch.control_path);
        cmd.env("PYTHONIOENCODING", "utf-8");
        Ok(cmd)
    }
}

/// Runs the interpreter inside a throwaway Docker container.
///
/// The control directory is bind-mounted at [`CONTAINER_CONTROL_DIR`] and the
/// container runs as the host user so it can reach the 0600 socket.
#[derive(Debug, Clone)]
pub struct DockerIsolation {
    docker: PathBuf,
    image: String,
    python: String,
    memory: Option<String>,
    pids_limit: Option<u32>,
}

impl DockerIsolation {
    /// Use `image` through the given docker binary.
    pub fn new(docker: impl Into<PathBuf>, image: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
            image: image.into(),
            python: "python".to_string(),
            memory: None,
            pids_limit: None,
        }
    }

    /// Interpreter name inside the image.
    pub fn python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    /// Memory limit passed to `--memory` (e.g. `256m`).
    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    /// Process limit passed to `--pids-limit`.
    pub fn pids_limit(mut self, limit: u32) -> Self {
        self.pids_limit = Some(limit);
        self
    }

    /// Image the guest runs in.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Name given to the container of a sandbox.
    pub fn container_name(sandbox_id: SandboxId) -> String {
        format!("tracebox-{sandbox_id}")
    }
}

#[async_trait]
impl Isolation for DockerIsolation {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn command(&self, launch: &Launch<'_>) -> Result<CommandBuilder> {
        let control_dir = launch
            .control_path
            .parent()
            .ok_or_else(|| CoreError::Launch("control socket has no parent directory".into()))?;
        let socket_name = launch
            .control_path
            .file_name()
            .ok_or_else(|| CoreError::Launch("control socket has no file name".into()))?;
        let container_socket = Path::new(CONTAINER_CONTROL_DIR).join(socket_name);

        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();

        let mut cmd = CommandBuilder::new(&self.docker);
        cmd.args(["run", "--rm", "-i", "-t", "--network", "none"]);
        cmd.arg("--name");
        cmd.arg(Self::container_name(launch.sandbox_id));
        cmd.arg("-u");
        cmd.arg(format!("{uid}:{gid}"));
        if let Some(memory) = &self.memory {
            cmd.arg("--memory");
            cmd.arg(memory);
        }
        if let Some(limit) = self.pids_limit {
            cmd.arg("--pids-limit");
            cmd.arg(limit.to_string());
        }
        cmd.arg("-v");
        cmd.arg(format!(
            "{}:{}",
            control_dir.display(),
            CONTAINER_CONTROL_DIR
        ));
        cmd.arg("-e");
        cmd.arg(format!(
            "{}={}",
            launch.control_env,
            container_socket.display()
        ));
        cmd.args(["-e", "PYTHONIOENCODING=utf-8"]);
        cmd.arg(&self.image);
        cmd.args([self.python.as_str(), "-u", "-c", launch.program]);
        Ok(cmd)
    }

    async fn terminate(&self, sandbox_id: SandboxId) {
        let name = Self::container_name(sandbox_id);
        let result = tokio::process::Command::new(&self.docker)
            .args(["rm", "-f", &name])
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                tracing::debug!(sandbox_id = %sandbox_id, container = %name, "Container removed");
            }
            Ok(output) => {
                // --rm usually got there first
                tracing::debug!(
                    sandbox_id = %sandbox_id,
                    container = %name,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Container removal reported failure"
                );
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Failed to run docker rm");
            }
        }
    }
}
