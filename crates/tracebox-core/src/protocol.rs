//! Wire protocol shared by the client channel and the control channel.
//!
//! Client messages are JSON envelopes of the form `{"CMD": ..., "CONTENT": ...}`.
//! The command tags keep the vocabulary spoken by the browser client
//! (`WS_CMD_START`, `WS_CMD_STATE`, ...). Control-channel frames carry a bare
//! [`TraceEvent`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Command tags used on the client channel.
pub mod commands {
    /// Keyboard input from the client.
    pub const STDIN: &str = "WS_CMD_STDIN";
    /// Guest source to run.
    pub const START: &str = "WS_CMD_START";
    /// Release a paused guest.
    pub const STEP: &str = "WS_CMD_STEP";
    /// Terminate the current run.
    pub const STOP: &str = "WS_CMD_STOP";
    /// Raw terminal text for the client.
    pub const STDOUT: &str = "WS_CMD_STDOUT";
    /// Session state notification.
    pub const STATE: &str = "WS_CMD_STATE";
    /// One trace event.
    pub const DATA: &str = "WS_CMD_DATA";
}

/// Token written to the control channel to release a paused guest.
///
/// The guest only checks that something arrived; the content is not inspected.
pub const RELEASE_TOKEN: &[u8] = b"PROCEED\n";

/// Snapshot reported by the guest immediately before it executes a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Line number in the user's own source.
    pub line: i64,
    /// Synthetic source tag of the guest unit.
    pub file: String,
    /// Encodable locals visible in the traced frame.
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// Session state as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is gone; no further operations are accepted.
    Dead,
    /// No sandbox owned.
    Idle,
    /// Sandbox executing or about to receive a step.
    Running,
    /// Sandbox paused at a traced line, awaiting a step.
    Wait,
}

impl SessionState {
    /// Numeric code carried in `STATE` messages.
    pub fn code(self) -> i8 {
        match self {
            Self::Dead => -1,
            Self::Idle => 0,
            Self::Running => 1,
            Self::Wait => 2,
        }
    }

    /// Parse a numeric state code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(Self::Dead),
            0 => Some(Self::Idle),
            1 => Some(Self::Running),
            2 => Some(Self::Wait),
            _ => None,
        }
    }

    /// Whether a sandbox must be owned in this state.
    pub fn owns_sandbox(self) -> bool {
        matches!(self, Self::Running | Self::Wait)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dead => write!(f, "DEAD"),
            Self::Idle => write!(f, "IDLE"),
            Self::Running => write!(f, "RUNNING"),
            Self::Wait => write!(f, "WAIT"),
        }
    }
}

impl Serialize for SessionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.code())
    }
}

impl<'de> Deserialize<'de> for SessionState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown session state {code}")))
    }
}

/// Raw `{CMD, CONTENT}` envelope before the command is interpreted.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    /// Command tag.
    #[serde(rename = "CMD")]
    pub cmd: String,
    /// Command payload.
    #[serde(rename = "CONTENT")]
    pub content: Value,
}

/// Errors raised while decoding a client message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not JSON, or missing `CMD`/`CONTENT`.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// `CMD` is not a client command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// `CONTENT` does not match the command.
    #[error("invalid content for {cmd}: {source}")]
    InvalidContent {
        /// Command whose content failed to decode.
        cmd: String,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct StdinContent {
    #[serde(rename = "TEXT")]
    text: String,
}

#[derive(Deserialize)]
struct StartContent {
    #[serde(rename = "CODE")]
    code: String,
}

#[derive(Deserialize)]
struct EmptyContent {}

/// Command sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Keyboard input for the guest terminal.
    Stdin { text: String },
    /// Start a new run of `code`.
    Start { code: String },
    /// Release the paused guest.
    Step,
    /// Terminate the current run.
    Stop,
}

impl ClientMessage {
    /// Decode a websocket text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        Self::from_envelope(envelope)
    }

    /// Interpret an already-decoded envelope.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { cmd, content } = envelope;
        let invalid = |source| ProtocolError::InvalidContent {
            cmd: cmd.clone(),
            source,
        };

        match cmd.as_str() {
            commands::STDIN => {
                let c: StdinContent = serde_json::from_value(content).map_err(invalid)?;
                Ok(Self::Stdin { text: c.text })
            }
            commands::START => {
                let c: StartContent = serde_json::from_value(content).map_err(invalid)?;
                Ok(Self::Start { code: c.code })
            }
            commands::STEP => {
                let _: EmptyContent = serde_json::from_value(content).map_err(invalid)?;
                Ok(Self::Step)
            }
            commands::STOP => {
                let _: EmptyContent = serde_json::from_value(content).map_err(invalid)?;
                Ok(Self::Stop)
            }
            _ => Err(ProtocolError::UnknownCommand(cmd)),
        }
    }
}

/// Message sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "CMD", content = "CONTENT")]
pub enum ServerMessage {
    /// Raw terminal text.
    #[serde(rename = "WS_CMD_STDOUT")]
    Stdout {
        #[serde(rename = "TEXT")]
        text: String,
    },
    /// Session state notification.
    #[serde(rename = "WS_CMD_STATE")]
    State {
        #[serde(rename = "STATE")]
        state: SessionState,
    },
    /// One trace event.
    #[serde(rename = "WS_CMD_DATA")]
    Data(TraceEvent),
}

impl ServerMessage {
    /// Terminal text message.
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::Stdout { text: text.into() }
    }

    /// Encode as a websocket text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
