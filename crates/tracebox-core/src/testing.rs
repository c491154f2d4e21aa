//! Test helpers: a shell-backed isolation and event collectors.

use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::isolation::{Isolation, Launch};
use crate::sandbox::SandboxEvent;
use async_trait::async_trait;
use portable_pty::CommandBuilder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Upper bound for any single wait in tests.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a fixed shell script instead of the rendered guest program.
#[derive(Debug, Clone)]
pub struct ShellIsolation {
    script: Option<String>,
}

impl ShellIsolation {
    pub fn script(script: impl Into<String>) -> Self {
        Self {
            script: Some(script.into()),
        }
    }

    /// An isolation whose command can never be built.
    pub fn failing() -> Self {
        Self { script: None }
    }
}

#[async_trait]
impl Isolation for ShellIsolation {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn command(&self, launch: &Launch<'_>) -> Result<CommandBuilder> {
        let script = self
            .script
            .as_deref()
            .ok_or_else(|| CoreError::Launch("no script configured".into()))?;
        let mut cmd = CommandBuilder::new("sh");
        cmd.args(["-c", script]);
        cmd.env(launch.control_env, launch.control_path);
        Ok(cmd)
    }
}

pub fn shell_config(dir: &Path, isolation: ShellIsolation) -> Arc<SandboxConfig> {
    Arc::new(
        SandboxConfig::builder()
            .control_dir(dir)
            .isolation(isolation)
            .stop_timeout(Duration::from_secs(3))
            .drain_timeout(Duration::from_millis(500))
            .build()
            .expect("valid test config"),
    )
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SandboxEvent>) -> Option<SandboxEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .ok()
        .flatten()
}

/// Collect events up to and including `Completed`.
pub async fn collect_until_completed(
    rx: &mut mpsc::UnboundedReceiver<SandboxEvent>,
) -> Vec<SandboxEvent> {
    let mut events = Vec::new();
    while let Some(event) = next_event(rx).await {
        let done = event == SandboxEvent::Completed;
        events.push(event);
        if done {
            break;
        }
    }
    events
}

/// Wait for a control socket to appear in `dir`.
pub async fn wait_for_socket(dir: &Path) -> PathBuf {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let found = std::fs::read_dir(dir).ok().and_then(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .find(|p| p.extension().is_some_and(|ext| ext == "sock"))
        });
        if let Some(path) = found {
            return path;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no control socket in {}",
            dir.display()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Encode one control-channel frame.
pub fn frame(json: &str) -> Vec<u8> {
    let mut bytes = (json.len() as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(json.as_bytes());
    bytes
}
