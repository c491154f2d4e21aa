//! Per-connection state machine.
//!
//! A [`Session`] owns at most one [`Sandbox`] and translates between client
//! commands, sandbox events and outbound client messages. Client commands and
//! sandbox events are handled one at a time from a single task, so state
//! transitions never interleave.

use crate::config::SandboxConfig;
use crate::protocol::{ClientMessage, ServerMessage, SessionState};
use crate::sandbox::{Sandbox, SandboxEvent};
use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

const BANNER_STARTED: &str = "\n--- PROGRAM STARTED ---\n";
const BANNER_STOPPED: &str = "\n--- PROGRAM STOPPED ---\n";
const BANNER_COMPLETED: &str = "\n--- PROGRAM COMPLETED ---\n";

/// The sandbox a session currently owns.
struct ActiveRun {
    sandbox: Arc<Sandbox>,
    events: mpsc::UnboundedReceiver<SandboxEvent>,
    task: JoinHandle<()>,
}

/// One client connection.
pub struct Session {
    id: Uuid,
    config: Arc<SandboxConfig>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    state: SessionState,
    run: Option<ActiveRun>,
    created_at: Instant,
}

impl Session {
    /// Create an idle session writing to `outbound`.
    pub fn new(config: Arc<SandboxConfig>, outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            outbound,
            state: SessionState::Idle,
            run: None,
            created_at: Instant::now(),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a sandbox is currently owned.
    pub fn has_sandbox(&self) -> bool {
        self.run.is_some()
    }

    /// Drive the session until the transport ends or `shutdown` fires.
    ///
    /// `inbound` yields websocket text frames. A stream error counts as a
    /// closed transport. On exit any owned sandbox is torn down and the
    /// session becomes [`SessionState::Dead`].
    pub async fn run<S, E>(mut self, inbound: S, mut shutdown: broadcast::Receiver<()>)
    where
        S: Stream<Item = Result<String, E>>,
        E: fmt::Display,
    {
        tracing::info!(session_id = %self.id, "Session connected");
        let mut inbound = std::pin::pin!(inbound);

        loop {
            tokio::select! {
                message = inbound.next() => match message {
                    Some(Ok(text)) => self.handle_client_text(&text).await,
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %self.id, error = %e, "Transport error");
                        break;
                    }
                    None => {
                        tracing::debug!(session_id = %self.id, "Transport closed");
                        break;
                    }
                },
                event = next_sandbox_event(&mut self.run) => {
                    // A vanished sender means the sandbox is gone; treat it as completion.
                    self.handle_sandbox_event(event.unwrap_or(SandboxEvent::Completed)).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!(session_id = %self.id, "Shutdown signal received");
                    break;
                }
            }
        }

        self.close().await;
    }

    /// Decode and apply one client frame. Malformed frames are logged and ignored.
    pub(crate) async fn handle_client_text(&mut self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_client_message(message).await,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Ignoring client message");
            }
        }
    }

    async fn handle_client_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Stdin { text } => match &self.run {
                Some(run) => run.sandbox.forward(&text),
                None => {
                    tracing::warn!(session_id = %self.id, "No sandbox to forward input to");
                }
            },
            ClientMessage::Start { code } => self.start(code),
            ClientMessage::Step => {
                let Some(sandbox) = self.run.as_ref().map(|run| Arc::clone(&run.sandbox)) else {
                    tracing::warn!(session_id = %self.id, "No sandbox to step");
                    return;
                };
                self.set_state(SessionState::Running);
                sandbox.proceed().await;
            }
            ClientMessage::Stop => {
                self.reset().await;
                self.set_state(SessionState::Idle);
                self.send(ServerMessage::stdout(BANNER_STOPPED));
            }
        }
    }

    fn start(&mut self, code: String) {
        if self.run.is_some() {
            tracing::warn!(session_id = %self.id, state = %self.state, "Sandbox already running, ignoring start");
            return;
        }
        self.send(ServerMessage::stdout(BANNER_STARTED));

        let (sandbox, events) = Sandbox::new(code, Arc::clone(&self.config));
        let task = tokio::spawn(Arc::clone(&sandbox).start());
        tracing::info!(
            session_id = %self.id,
            sandbox_id = %sandbox.id(),
            source_len = sandbox.source().len(),
            "Run started"
        );
        self.run = Some(ActiveRun {
            sandbox,
            events,
            task,
        });
        self.set_state(SessionState::Running);
    }

    pub(crate) async fn handle_sandbox_event(&mut self, event: SandboxEvent) {
        match event {
            SandboxEvent::Output(text) => self.send(ServerMessage::stdout(text)),
            SandboxEvent::Data(trace) => {
                tracing::trace!(session_id = %self.id, line = trace.line, "Forwarding trace event");
                self.send(ServerMessage::Data(trace));
                self.set_state(SessionState::Wait);
            }
            SandboxEvent::Completed => {
                if self.state == SessionState::Running {
                    self.send(ServerMessage::stdout(BANNER_COMPLETED));
                }
                self.reset().await;
                self.set_state(SessionState::Idle);
            }
        }
    }

    /// Tear down and discard the owned sandbox, if any.
    async fn reset(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        let ActiveRun {
            sandbox,
            events,
            mut task,
        } = run;
        // Anything still queued belongs to the discarded run.
        drop(events);

        sandbox.stop().await;
        let bound = self.config.stop_timeout + self.config.drain_timeout;
        if tokio::time::timeout(bound, &mut task).await.is_err() {
            tracing::warn!(session_id = %self.id, sandbox_id = %sandbox.id(), "Run task did not finish, aborting");
            task.abort();
        }
        tracing::debug!(session_id = %self.id, sandbox_id = %sandbox.id(), "Sandbox discarded");
    }

    async fn close(&mut self) {
        self.reset().await;
        self.set_state(SessionState::Dead);
        tracing::info!(
            session_id = %self.id,
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            "Session closed"
        );
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(session_id = %self.id, from = %self.state, to = %state, "State change");
        }
        self.state = state;
        self.send(ServerMessage::State { state });
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            tracing::debug!(session_id = %self.id, "Outbound channel closed, dropping message");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("has_sandbox", &self.run.is_some())
            .finish()
    }
}

async fn next_sandbox_event(run: &mut Option<ActiveRun>) -> Option<SandboxEvent> {
    match run {
        Some(run) => run.events.recv().await,
        None => std::future::pending().await,
    }
}
