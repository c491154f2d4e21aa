//! Sandbox configuration types.

use crate::error::CoreError;
use crate::injector::LocalsFilter;
use crate::isolation::{DirectIsolation, Isolation};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared by every sandbox a server creates.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory holding the per-sandbox control sockets.
    pub control_dir: PathBuf,
    /// Environment variable naming the control socket inside the guest.
    pub control_env: String,
    /// Strategy used to launch the guest.
    pub isolation: Arc<dyn Isolation>,
    /// Which guest locals are reported in trace events.
    pub locals_filter: LocalsFilter,
    /// Terminal rows (default: 24).
    pub pty_rows: u16,
    /// Terminal columns (default: 80).
    pub pty_cols: u16,
    /// Largest accepted control-channel frame in bytes (default: 1 MiB).
    pub max_frame_length: usize,
    /// How long `stop()` waits for a killed subprocess to exit.
    pub stop_timeout: Duration,
    /// How long terminal output keeps draining after the subprocess exits.
    pub drain_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            control_dir: std::env::temp_dir().join("tracebox"),
            control_env: "TRACEBOX_CONTROL".to_string(),
            isolation: Arc::new(DirectIsolation::default()),
            locals_filter: LocalsFilter::default(),
            pty_rows: 24,
            pty_cols: 80,
            max_frame_length: 1024 * 1024,
            stop_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(500),
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.control_dir.as_os_str().is_empty() {
            return Err(CoreError::InvalidConfig("control_dir is required".into()));
        }
        if self.control_env.is_empty() || self.control_env.contains('=') {
            return Err(CoreError::InvalidConfig(
                "control_env must be a non-empty variable name".into(),
            ));
        }
        if self.pty_rows == 0 || self.pty_cols == 0 {
            return Err(CoreError::InvalidConfig(
                "terminal size must be non-zero".into(),
            ));
        }
        if self.max_frame_length == 0 {
            return Err(CoreError::InvalidConfig(
                "max_frame_length must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for SandboxConfig.
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the control socket directory.
    pub fn control_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.control_dir = path.into();
        self
    }

    /// Set the environment variable carrying the socket address.
    pub fn control_env(mut self, name: impl Into<String>) -> Self {
        self.config.control_env = name.into();
        self
    }

    /// Set the isolation strategy.
    pub fn isolation(mut self, isolation: impl Isolation + 'static) -> Self {
        self.config.isolation = Arc::new(isolation);
        self
    }

    /// Set an already shared isolation strategy.
    pub fn isolation_arc(mut self, isolation: Arc<dyn Isolation>) -> Self {
        self.config.isolation = isolation;
        self
    }

    /// Set the locals filter.
    pub fn locals_filter(mut self, filter: LocalsFilter) -> Self {
        self.config.locals_filter = filter;
        self
    }

    /// Set the terminal size.
    pub fn pty_size(mut self, rows: u16, cols: u16) -> Self {
        self.config.pty_rows = rows;
        self.config.pty_cols = cols;
        self
    }

    /// Set the largest accepted control frame.
    pub fn max_frame_length(mut self, bytes: usize) -> Self {
        self.config.max_frame_length = bytes;
        self
    }

    /// Set the kill-and-wait bound used by `stop()`.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    /// Set the post-exit output drain window.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<SandboxConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
