//! Configuration for the Tracebox server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracebox_core::{DirectIsolation, DockerIsolation, Isolation, LocalsFilter, SandboxConfig};

/// How guest programs are isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationMode {
    /// Plain child process (development hosts)
    #[default]
    Direct,
    /// Throwaway Docker container per run
    Docker,
}

impl IsolationMode {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "docker" | "container" => Self::Docker,
            _ => Self::Direct,
        }
    }
}

/// Configuration for the Tracebox server.
#[derive(Debug, Clone)]
pub struct TraceboxConfig {
    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Isolation strategy (default: direct).
    pub isolation: IsolationMode,

    /// Python interpreter for direct isolation, or inside the container.
    pub python: String,

    /// Docker CLI binary.
    pub docker_path: PathBuf,

    /// Image used by docker isolation.
    pub image: String,

    /// Directory for per-run control sockets.
    pub control_dir: PathBuf,

    /// Which guest locals are reported.
    pub locals_filter: LocalsFilter,

    /// Container memory limit, e.g. `128m`.
    pub memory: Option<String>,

    /// Container process limit.
    pub pids_limit: Option<u32>,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("docker binary not found: {0}")]
    MissingDocker(PathBuf),

    #[error("python interpreter not found: {0}")]
    MissingPython(String),

    #[error("control directory parent not found: {0}")]
    InvalidControlDir(PathBuf),

    #[error("invalid sandbox config: {0}")]
    Sandbox(#[from] tracebox_core::CoreError),
}

impl Default for TraceboxConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
            isolation: IsolationMode::Direct,
            python: "python3".to_string(),
            docker_path: PathBuf::from("docker"),
            image: "python:3.12-slim".to_string(),
            control_dir: std::env::temp_dir().join("tracebox"),
            locals_filter: LocalsFilter::Encodable,
            memory: Some("128m".to_string()),
            pids_limit: Some(64),
        }
    }
}

impl TraceboxConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TRACEBOX_HTTP_HOST` | `0.0.0.0` |
    /// | `TRACEBOX_HTTP_PORT` | `8080` |
    /// | `TRACEBOX_ISOLATION` | `direct` (direct, docker) |
    /// | `TRACEBOX_PYTHON` | `python3` (`python` under docker) |
    /// | `TRACEBOX_DOCKER` | `docker` |
    /// | `TRACEBOX_IMAGE` | `python:3.12-slim` |
    /// | `TRACEBOX_CONTROL_DIR` | `$TMPDIR/tracebox` |
    /// | `TRACEBOX_LOCALS` | `encodable` (encodable, roundtrip) |
    /// | `TRACEBOX_MEMORY` | `128m` |
    /// | `TRACEBOX_PIDS_LIMIT` | `64` |
    pub fn from_env() -> Self {
        let default = Self::default();

        let http_host: IpAddr = std::env::var("TRACEBOX_HTTP_HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let http_port: u16 = std::env::var("TRACEBOX_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let isolation = std::env::var("TRACEBOX_ISOLATION")
            .map(|v| IsolationMode::parse(&v))
            .unwrap_or(default.isolation);

        let python = std::env::var("TRACEBOX_PYTHON").unwrap_or_else(|_| match isolation {
            IsolationMode::Direct => default.python.clone(),
            IsolationMode::Docker => "python".to_string(),
        });

        Self {
            http_addr: SocketAddr::new(http_host, http_port),
            isolation,
            python,
            docker_path: std::env::var("TRACEBOX_DOCKER")
                .map(PathBuf::from)
                .unwrap_or(default.docker_path),
            image: std::env::var("TRACEBOX_IMAGE").unwrap_or(default.image),
            control_dir: std::env::var("TRACEBOX_CONTROL_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.control_dir),
            locals_filter: std::env::var("TRACEBOX_LOCALS")
                .ok()
                .and_then(|v| LocalsFilter::parse(&v))
                .unwrap_or(default.locals_filter),
            memory: match std::env::var("TRACEBOX_MEMORY") {
                Ok(v) if v.is_empty() || v == "none" => None,
                Ok(v) => Some(v),
                Err(_) => default.memory,
            },
            pids_limit: match std::env::var("TRACEBOX_PIDS_LIMIT") {
                Ok(v) => v.parse().ok().filter(|n| *n > 0),
                Err(_) => default.pids_limit,
            },
        }
    }

    /// Build the isolation strategy this configuration selects.
    pub fn isolation(&self) -> Arc<dyn Isolation> {
        match self.isolation {
            IsolationMode::Direct => Arc::new(DirectIsolation::new(&self.python)),
            IsolationMode::Docker => {
                let mut docker =
                    DockerIsolation::new(&self.docker_path, &self.image).python(&self.python);
                if let Some(memory) = &self.memory {
                    docker = docker.memory(memory);
                }
                if let Some(limit) = self.pids_limit {
                    docker = docker.pids_limit(limit);
                }
                Arc::new(docker)
            }
        }
    }

    /// Build the sandbox configuration shared by all sessions.
    pub fn sandbox_config(&self) -> Result<SandboxConfig, ConfigError> {
        let config = SandboxConfig::builder()
            .control_dir(&self.control_dir)
            .isolation_arc(self.isolation())
            .locals_filter(self.locals_filter)
            .build()?;
        Ok(config)
    }

    /// Validate that the configured binaries and directories exist.
    ///
    /// Call this at startup to get clear error messages about missing tools.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.isolation {
            IsolationMode::Direct => {
                if find_program(Path::new(&self.python)).is_none() {
                    return Err(ConfigError::MissingPython(self.python.clone()));
                }
            }
            IsolationMode::Docker => {
                if find_program(&self.docker_path).is_none() {
                    return Err(ConfigError::MissingDocker(self.docker_path.clone()));
                }
            }
        }

        // The control directory is created on demand, so just check the parent
        if let Some(parent) = self.control_dir.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::InvalidControlDir(self.control_dir.clone()));
            }
        }

        self.sandbox_config()?;
        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development environments where tools may not exist yet.
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Configuration problem");
        }
    }
}

/// Resolve `program` the way a shell would: as-is when it has a path
/// component, otherwise through `PATH`.
fn find_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.exists().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TraceboxConfig::default();
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.isolation, IsolationMode::Direct);
        assert_eq!(config.python, "python3");
        assert_eq!(config.locals_filter, LocalsFilter::Encodable);
        assert_eq!(config.pids_limit, Some(64));
    }

    #[test]
    fn test_isolation_mode_parsing() {
        assert_eq!(IsolationMode::parse("docker"), IsolationMode::Docker);
        assert_eq!(IsolationMode::parse("DOCKER"), IsolationMode::Docker);
        assert_eq!(IsolationMode::parse("direct"), IsolationMode::Direct);
        assert_eq!(IsolationMode::parse("anything"), IsolationMode::Direct);
    }

    #[test]
    fn test_isolation_selection() {
        let mut config = TraceboxConfig::default();
        assert_eq!(config.isolation().name(), "direct");
        config.isolation = IsolationMode::Docker;
        assert_eq!(config.isolation().name(), "docker");
    }

    #[test]
    fn test_sandbox_config_carries_settings() {
        let config = TraceboxConfig {
            control_dir: PathBuf::from("/run/tracebox"),
            locals_filter: LocalsFilter::RoundTrip,
            ..TraceboxConfig::default()
        };
        let sandbox = config.sandbox_config().unwrap();
        assert_eq!(sandbox.control_dir, PathBuf::from("/run/tracebox"));
        assert_eq!(sandbox.locals_filter, LocalsFilter::RoundTrip);
    }

    #[test]
    fn test_validate_missing_docker() {
        let config = TraceboxConfig {
            isolation: IsolationMode::Docker,
            docker_path: PathBuf::from("/nonexistent/bin/docker"),
            ..TraceboxConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingDocker(_))
        ));
    }

    #[test]
    fn test_validate_bad_control_dir() {
        let config = TraceboxConfig {
            python: "sh".to_string(),
            control_dir: PathBuf::from("/nonexistent/parent/tracebox"),
            ..TraceboxConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidControlDir(_))
        ));
    }

    #[test]
    fn test_from_env_uses_defaults() {
        // Clear any existing env vars
        for var in [
            "TRACEBOX_HTTP_HOST",
            "TRACEBOX_HTTP_PORT",
            "TRACEBOX_ISOLATION",
            "TRACEBOX_PYTHON",
            "TRACEBOX_DOCKER",
            "TRACEBOX_IMAGE",
            "TRACEBOX_CONTROL_DIR",
            "TRACEBOX_LOCALS",
            "TRACEBOX_MEMORY",
            "TRACEBOX_PIDS_LIMIT",
        ] {
            std::env::remove_var(var);
        }

        let config = TraceboxConfig::from_env();
        let default = TraceboxConfig::default();

        assert_eq!(config.http_addr, default.http_addr);
        assert_eq!(config.isolation, default.isolation);
        assert_eq!(config.python, default.python);
        assert_eq!(config.image, default.image);
        assert_eq!(config.control_dir, default.control_dir);
        assert_eq!(config.memory, default.memory);
    }
}
