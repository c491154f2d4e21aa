//! Instrumented guest program generation.
//!
//! The injector wraps user source in a Python prelude that installs a
//! per-line trace hook. Before every line of the guest unit the hook sends a
//! length-prefixed [`TraceEvent`](crate::TraceEvent) frame to the control
//! socket named in its environment and blocks until the release token
//! arrives. A guarded entry point turns uncaught exceptions into a readable
//! report on the terminal.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Synthetic filename of the compiled guest unit.
///
/// Only frames carrying this tag are traced or reported.
pub const SOURCE_TAG: &str = "<guest>";

/// Lines prepended to the compiled guest unit.
///
/// The unit is compiled from the embedded source verbatim, so frame line
/// numbers already match the user's own numbering.
pub const LINE_OFFSET: u32 = 0;

const PRELUDE: &str = include_str!("guest_prelude.py");

/// Predicate deciding which guest locals are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalsFilter {
    /// Keep values that JSON-encode (NaN and infinities excluded).
    #[default]
    Encodable,
    /// Keep values that survive an encode/decode round trip unchanged.
    RoundTrip,
}

impl LocalsFilter {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "encodable" | "json" => Some(Self::Encodable),
            "roundtrip" | "round_trip" | "round-trip" => Some(Self::RoundTrip),
            _ => None,
        }
    }

    /// Body of the guest-side predicate.
    fn python_statement(self) -> &'static str {
        match self {
            Self::Encodable => "return bool(_json.dumps(value, allow_nan=False))",
            Self::RoundTrip => "return _json.loads(_json.dumps(value, allow_nan=False)) == value",
        }
    }
}

impl fmt::Display for LocalsFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encodable => write!(f, "encodable"),
            Self::RoundTrip => write!(f, "roundtrip"),
        }
    }
}

/// Render the instrumented program for `source`.
///
/// `control_env` is the environment variable the hook reads the control
/// socket address from.
pub fn render(source: &str, control_env: &str, filter: LocalsFilter) -> String {
    PRELUDE
        .replace("__TRACEBOX_TAG__", &python_str(SOURCE_TAG))
        .replace("__TRACEBOX_OFFSET__", &LINE_OFFSET.to_string())
        .replace("__TRACEBOX_ENV__", &python_str(control_env))
        .replace("__TRACEBOX_KEEP__", filter.python_statement())
        // Last, so placeholder-looking text in user source is left alone.
        .replace("__TRACEBOX_SOURCE__", &python_str(source))
}

/// Quote `s` as a Python string literal.
///
/// JSON string syntax is a subset of Python's: the escapes serde_json emits
/// (`\"`, `\\`, `\n`, `\uXXXX`, ...) mean the same in both.
fn python_str(s: &str) -> String {
    serde_json::Value::String(s.to_owned()).to_string()
}
