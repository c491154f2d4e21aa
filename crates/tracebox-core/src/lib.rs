//! # tracebox-core
//!
//! Steppable, sandboxed execution of short Python guest programs.
//!
//! A client submits source, the core runs it in an isolated subprocess on a
//! pseudo-terminal, and the guest pauses before every line until the client
//! steps it forward.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  tracebox-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ClientMessage ──▶ ┌─────────────────┐ ──▶ ServerMessage │
//! │                    │    Session      │                   │
//! │                    │ IDLE/RUNNING/   │                   │
//! │                    │ WAIT/DEAD       │                   │
//! │                    └─────────────────┘                   │
//! │                       │          ▲ SandboxEvent          │
//! │                       ▼          │                       │
//! │                    ┌─────────────────┐                   │
//! │                    │    Sandbox      │                   │
//! │                    │  - start()      │                   │
//! │                    │  - proceed()    │                   │
//! │                    │  - forward()    │                   │
//! │                    │  - stop()       │                   │
//! │                    └─────────────────┘                   │
//! │                 pty │          ▲ control socket          │
//! └─────────────────────┼──────────┼─────────────────────────┘
//!                       ▼          │ TraceEvent / PROCEED
//! ┌──────────────────────────────────────────────────────────┐
//! │        guest (python + trace hook, via Isolation)        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio::sync::{broadcast, mpsc};
//! use tracebox_core::{SandboxConfig, Session};
//!
//! # async fn example(inbound: impl futures::Stream<Item = Result<String, std::io::Error>>) {
//! let config = Arc::new(SandboxConfig::builder().control_dir("/run/tracebox").build().unwrap());
//! let (outbound, mut messages) = mpsc::unbounded_channel();
//! let (_shutdown_tx, shutdown) = broadcast::channel(1);
//!
//! tokio::spawn(async move {
//!     while let Some(message) = messages.recv().await {
//!         println!("{}", message.to_json().unwrap());
//!     }
//! });
//! Session::new(config, outbound).run(inbound, shutdown).await;
//! # }
//! ```

mod config;
mod error;
pub mod injector;
pub mod isolation;
pub mod protocol;
mod sandbox;
mod session;

#[cfg(test)]
mod testing;

pub use config::{SandboxConfig, SandboxConfigBuilder};
pub use error::{CoreError, Result};
pub use injector::LocalsFilter;
pub use isolation::{DirectIsolation, DockerIsolation, Isolation, Launch};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage, SessionState, TraceEvent};
pub use sandbox::{Sandbox, SandboxEvent, SandboxId};
pub use session::Session;
