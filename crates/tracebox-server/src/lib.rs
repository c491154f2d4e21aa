//! # tracebox-server
//!
//! HTTP and websocket front end for Tracebox stepping sessions.
//!
//! Every websocket connection on `/ws` becomes one [`tracebox_core::Session`];
//! `/` serves a small browser UI that speaks the session protocol.
//!
//! ## Quick Start
//!
//! Run the server with default configuration:
//!
//! ```bash
//! cargo run -p tracebox-server
//! ```
//!
//! Run guests in containers instead of plain child processes:
//!
//! ```bash
//! export TRACEBOX_ISOLATION=docker
//! export TRACEBOX_IMAGE=python:3.12-slim
//! export TRACEBOX_CONTROL_DIR=/var/run/tracebox
//! cargo run -p tracebox-server
//! ```
//!
//! ## Client Commands
//!
//! | Command | Content | Effect |
//! |---------|---------|--------|
//! | `WS_CMD_START` | `{"CODE": ...}` | Start a traced run |
//! | `WS_CMD_STEP` | `{}` | Release the paused guest |
//! | `WS_CMD_STDIN` | `{"TEXT": ...}` | Type into the guest terminal |
//! | `WS_CMD_STOP` | `{}` | Terminate the run |

pub mod config;
pub mod http;
pub mod ws;

pub use config::{ConfigError, IsolationMode, TraceboxConfig};
pub use http::AppState;
