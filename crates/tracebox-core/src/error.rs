//! Error types for tracebox-core.

use thiserror::Error;

/// Result type alias for tracebox-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while preparing or running a sandbox.
///
/// These never cross into the session: a sandbox absorbs them into its
/// completion path and only logs them.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Pseudo-terminal allocation or handle cloning failed.
    #[error("pty error: {0}")]
    Pty(String),

    /// The isolated subprocess could not be launched.
    #[error("launch failed: {0}")]
    Launch(String),

    /// Control channel listener could not be prepared.
    #[error("control channel error: {0}")]
    Control(String),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
