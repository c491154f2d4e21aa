//! Sandbox type - one isolated, steppable run of a guest program.
//!
//! A sandbox bundles a pseudo-terminal, a control-channel listener and the
//! isolated subprocess. Everything it observes reaches its owner as
//! [`SandboxEvent`]s on a single ordered channel; failures are logged and end
//! the run through [`SandboxEvent::Completed`] instead of being returned.

use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::injector;
use crate::isolation::Launch;
use crate::protocol::{TraceEvent, RELEASE_TOKEN};
use futures::StreamExt;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, MasterPty, PtySize};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, MutexGuard};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use uuid::Uuid;

/// Read size for the terminal pump.
const PUMP_CHUNK: usize = 1024;

/// Unique identifier for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Create a new random sandbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SandboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Something the sandbox observed, in the order it observed it.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxEvent {
    /// Text written by the guest to its terminal.
    Output(String),
    /// The guest paused before a traced line.
    Data(TraceEvent),
    /// The run is over and every resource has been released.
    Completed,
}

/// Resources created by `start()` and released by `stop()`.
#[derive(Default)]
struct Resources {
    started: bool,
    stopped: bool,
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    pid: Option<u32>,
    exited: Option<watch::Receiver<bool>>,
    accept: Option<AbortHandle>,
    control_path: Option<PathBuf>,
}

/// Handles `start()` keeps for itself once the subprocess is running.
struct Launched {
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
    exited: watch::Sender<bool>,
}

/// The guest's control connection and whether it is blocked on it.
#[derive(Default)]
struct ControlSlot {
    conn: Option<OwnedWriteHalf>,
    /// Set between a trace frame and the release that answers it.
    paused: bool,
}

/// One isolated execution of a guest program.
///
/// Created by a session, driven by [`start`](Self::start) on its own task, and
/// torn down by [`stop`](Self::stop). All methods log and return instead of
/// failing; the owner only ever sees [`SandboxEvent`]s.
pub struct Sandbox {
    id: SandboxId,
    source: String,
    config: Arc<SandboxConfig>,
    events: mpsc::UnboundedSender<SandboxEvent>,
    resources: std::sync::Mutex<Resources>,
    control: Mutex<ControlSlot>,
    teardown: Mutex<()>,
    created_at: Instant,
}

impl Sandbox {
    /// Create a sandbox for `source` and the receiver for its events.
    pub fn new(
        source: impl Into<String>,
        config: Arc<SandboxConfig>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SandboxEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let sandbox = Arc::new(Self {
            id: SandboxId::new(),
            source: source.into(),
            config,
            events,
            resources: std::sync::Mutex::new(Resources::default()),
            control: Mutex::new(ControlSlot::default()),
            teardown: Mutex::new(()),
            created_at: Instant::now(),
        });
        (sandbox, rx)
    }

    /// Get the sandbox ID.
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Guest source this sandbox runs.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Path of the control socket while it exists.
    pub fn control_path(&self) -> Option<PathBuf> {
        self.resources().control_path.clone()
    }

    /// Run the guest to completion.
    ///
    /// Returns once the guest has exited (naturally or through
    /// [`stop`](Self::stop)) and every resource is released. Emits
    /// [`SandboxEvent::Completed`] exactly once for a run that got past the
    /// reentrancy check.
    pub async fn start(self: Arc<Self>) {
        let launched = match self.launch() {
            Ok(Some(launched)) => launched,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(sandbox_id = %self.id, error = %e, "Sandbox launch failed");
                self.finish().await;
                return;
            }
        };
        tracing::info!(
            sandbox_id = %self.id,
            isolation = self.config.isolation.name(),
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            "Sandbox started"
        );

        let Launched {
            reader,
            mut child,
            exited,
        } = launched;

        let pump = {
            let id = self.id;
            let events = self.events.clone();
            tokio::task::spawn_blocking(move || pump_terminal(id, reader, events))
        };

        match tokio::task::spawn_blocking(move || reap_child(child.as_mut(), &exited)).await {
            Ok(Ok(status)) => {
                tracing::debug!(sandbox_id = %self.id, exit_code = status.exit_code(), "Subprocess exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to wait for subprocess");
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %self.id, error = %e, "Subprocess wait task failed");
            }
        }

        // A descriptor inherited elsewhere can keep the terminal open.
        if tokio::time::timeout(self.config.drain_timeout, pump)
            .await
            .is_err()
        {
            tracing::warn!(sandbox_id = %self.id, "Terminal still open after exit, abandoning pump");
        }

        self.finish().await;
    }

    /// Set up terminal, listener and subprocess in one critical section so a
    /// concurrent `stop()` sees either none or all of them.
    fn launch(self: &Arc<Self>) -> Result<Option<Launched>> {
        let mut res = self.resources();
        if res.stopped {
            tracing::warn!(sandbox_id = %self.id, "Start requested on a stopped sandbox");
            return Ok(None);
        }
        if res.started
            || res.master.is_some()
            || res.accept.is_some()
            || res.pid.is_some()
        {
            tracing::warn!(sandbox_id = %self.id, "Sandbox already started");
            return Ok(None);
        }
        res.started = true;

        // 1. Terminal
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.config.pty_rows,
                cols: self.config.pty_cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CoreError::Pty(format!("failed to open pty: {e}")))?;
        let master = pair.master;
        let slave = pair.slave;
        let reader = master
            .try_clone_reader()
            .map_err(|e| CoreError::Pty(format!("failed to clone pty reader: {e}")))?;
        let writer = master
            .take_writer()
            .map_err(|e| CoreError::Pty(format!("failed to take pty writer: {e}")))?;
        res.master = Some(master);
        res.writer = Some(writer);
        tracing::trace!(sandbox_id = %self.id, "Terminal allocated");

        // 2. Control listener
        let control_path = self
            .config
            .control_dir
            .join(format!("tracebox_{}.sock", self.id));
        prepare_control_dir(&self.config.control_dir)?;
        let listener = UnixListener::bind(&control_path).map_err(|e| {
            CoreError::Control(format!("failed to bind {}: {e}", control_path.display()))
        })?;
        res.control_path = Some(control_path.clone());
        std::fs::set_permissions(&control_path, std::fs::Permissions::from_mode(0o600))?;
        let accept = tokio::spawn(Arc::clone(self).accept_loop(listener));
        res.accept = Some(accept.abort_handle());
        tracing::debug!(sandbox_id = %self.id, path = %control_path.display(), "Control listener bound");

        // 3. Program
        let program = injector::render(
            &self.source,
            &self.config.control_env,
            self.config.locals_filter,
        );

        // 4. Subprocess
        let cmd = self.config.isolation.command(&Launch {
            sandbox_id: self.id,
            program: &program,
            control_path: &control_path,
            control_env: &self.config.control_env,
        })?;
        let child = slave
            .spawn_command(cmd)
            .map_err(|e| CoreError::Launch(e.to_string()))?;
        res.pid = child.process_id();

        // 5. The child holds the only slave descriptor from here on
        drop(slave);

        let (exited_tx, exited_rx) = watch::channel(false);
        res.exited = Some(exited_rx);

        Ok(Some(Launched {
            reader,
            child,
            exited: exited_tx,
        }))
    }

    async fn finish(&self) {
        self.stop().await;
        let _ = self.events.send(SandboxEvent::Completed);
        tracing::info!(
            sandbox_id = %self.id,
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            "Sandbox completed"
        );
    }

    async fn accept_loop(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let sandbox = Arc::clone(&self);
                    tokio::spawn(async move { sandbox.accept_control(stream).await });
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %self.id, error = %e, "Control listener failed");
                    break;
                }
            }
        }
    }

    /// Serve one control connection from the guest's trace hook.
    ///
    /// Each length-delimited JSON frame becomes a [`SandboxEvent::Data`].
    /// Only one connection may be open at a time; a second one is closed
    /// immediately. End of stream or an undecodable frame drops the
    /// connection without affecting the rest of the sandbox.
    pub async fn accept_control(&self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        {
            let mut slot = self.control.lock().await;
            if slot.conn.is_some() {
                tracing::warn!(sandbox_id = %self.id, "Rejecting second control connection");
                return;
            }
            if self.resources().stopped {
                tracing::debug!(sandbox_id = %self.id, "Ignoring control connection after stop");
                return;
            }
            slot.conn = Some(write_half);
            slot.paused = false;
        }
        tracing::debug!(sandbox_id = %self.id, "Control connection accepted");

        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.config.max_frame_length)
            .new_codec();
        let mut frames = FramedRead::new(read_half, codec);
        while let Some(frame) = frames.next().await {
            let bytes = match frame {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(sandbox_id = %self.id, error = %e, "Control frame error");
                    break;
                }
            };
            match serde_json::from_slice::<TraceEvent>(&bytes) {
                Ok(event) => {
                    tracing::trace!(sandbox_id = %self.id, line = event.line, "Trace event received");
                    // Marked before the event is visible so a prompt step is not lost.
                    self.control.lock().await.paused = true;
                    if self.events.send(SandboxEvent::Data(event)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %self.id, error = %e, "Undecodable trace frame");
                    break;
                }
            }
        }

        *self.control.lock().await = ControlSlot::default();
        tracing::debug!(sandbox_id = %self.id, "Control connection closed");
    }

    /// Release the guest paused at its current trace point.
    ///
    /// Writes exactly one release token per reported trace event; a guest
    /// that is running or not connected is left alone.
    pub async fn proceed(&self) {
        let mut guard = self.control.lock().await;
        let slot = &mut *guard;
        let Some(conn) = slot.conn.as_mut() else {
            tracing::warn!(sandbox_id = %self.id, "No control connection to proceed");
            return;
        };
        if !slot.paused {
            tracing::warn!(sandbox_id = %self.id, "Guest is not paused, ignoring proceed");
            return;
        }
        match release(conn).await {
            Ok(()) => {
                slot.paused = false;
                tracing::trace!(sandbox_id = %self.id, "Guest released");
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to release guest");
                *slot = ControlSlot::default();
            }
        }
    }

    /// Type `text` into the guest's terminal.
    pub fn forward(&self, text: &str) {
        let mut res = self.resources();
        let Some(writer) = res.writer.as_mut() else {
            tracing::warn!(sandbox_id = %self.id, "Terminal not open to forward input");
            return;
        };
        let result = writer
            .write_all(text.as_bytes())
            .and_then(|()| writer.flush());
        match result {
            Ok(()) => tracing::trace!(sandbox_id = %self.id, len = text.len(), "Input forwarded"),
            Err(e) => tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to forward input"),
        }
    }

    /// Release every resource.
    ///
    /// Idempotent and safe to race with `start()`: each resource is taken out
    /// exactly once, and concurrent callers wait for the first teardown to
    /// finish. Order: listener, subprocess, terminal, socket file.
    pub async fn stop(&self) {
        let _teardown = self.teardown.lock().await;
        let (accept, pid, exited, master, writer, control_path) = {
            let mut res = self.resources();
            res.stopped = true;
            (
                res.accept.take(),
                res.pid.take(),
                res.exited.take(),
                res.master.take(),
                res.writer.take(),
                res.control_path.take(),
            )
        };

        // 1. Listener and the open control connection
        if let Some(accept) = accept {
            accept.abort();
            tracing::debug!(sandbox_id = %self.id, "Control listener closed");
        }
        let conn = {
            let mut slot = self.control.lock().await;
            slot.paused = false;
            slot.conn.take()
        };
        if let Some(mut conn) = conn {
            if let Err(e) = conn.shutdown().await {
                tracing::debug!(sandbox_id = %self.id, error = %e, "Control connection shutdown failed");
            }
        }

        // 2. Subprocess
        if let Some(pid) = pid {
            let already_exited = exited.as_ref().is_some_and(|rx| *rx.borrow());
            if !already_exited {
                kill_process_group(self.id, pid);
            }
            let terminate = self.config.isolation.terminate(self.id);
            if tokio::time::timeout(self.config.stop_timeout, terminate)
                .await
                .is_err()
            {
                tracing::warn!(
                    sandbox_id = %self.id,
                    isolation = self.config.isolation.name(),
                    "Isolation cleanup timed out"
                );
            }
            if let Some(mut rx) = exited {
                let waited = tokio::time::timeout(self.config.stop_timeout, rx.wait_for(|e| *e))
                    .await
                    .map(|r| r.is_ok());
                if waited.is_err() {
                    tracing::warn!(
                        sandbox_id = %self.id,
                        pid,
                        timeout_ms = self.config.stop_timeout.as_millis() as u64,
                        "Subprocess did not exit in time"
                    );
                }
            }
        }

        // 3. Terminal
        if writer.is_some() || master.is_some() {
            drop(writer);
            drop(master);
            tracing::debug!(sandbox_id = %self.id, "Terminal closed");
        }

        // 4. Rendezvous file
        if let Some(path) = control_path {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::debug!(sandbox_id = %self.id, path = %path.display(), "Control socket removed");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(sandbox_id = %self.id, path = %path.display(), error = %e, "Failed to remove control socket");
                }
            }
        }
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("source_len", &self.source.len())
            .finish_non_exhaustive()
    }
}

async fn release(conn: &mut OwnedWriteHalf) -> std::io::Result<()> {
    conn.write_all(RELEASE_TOKEN).await?;
    conn.flush().await
}

/// Create the socket directory, readable only by the service user.
fn prepare_control_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        CoreError::Control(format!("failed to create {}: {e}", dir.display()))
    })?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// SIGKILL the subprocess and everything in its session.
fn kill_process_group(id: SandboxId, pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        tracing::warn!(sandbox_id = %id, pid, "Subprocess pid out of range");
        return;
    };
    let pid = Pid::from_raw(raw);
    // The pty child is a session leader, so its pid is also its group id.
    match signal::killpg(pid, Signal::SIGKILL) {
        Ok(()) => tracing::debug!(sandbox_id = %id, pid = raw, "Subprocess group killed"),
        Err(_) => match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) => tracing::debug!(sandbox_id = %id, pid = raw, "Subprocess killed"),
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => tracing::warn!(sandbox_id = %id, pid = raw, error = %e, "Failed to kill subprocess"),
        },
    }
}

/// Wait for the subprocess and mark it reaped before returning, so `stop()`
/// never signals a pid the kernel may already have recycled.
fn reap_child(
    child: &mut (dyn Child + Send + Sync),
    exited: &watch::Sender<bool>,
) -> std::io::Result<portable_pty::ExitStatus> {
    let status = child.wait();
    exited.send_replace(true);
    status
}

/// Copy terminal output into `Output` events until the terminal closes.
///
/// Runs on a blocking thread. Linux reports a closed pty as `EIO`, so any
/// read error ends the pump like end-of-file does.
fn pump_terminal(
    id: SandboxId,
    mut reader: Box<dyn Read + Send>,
    events: mpsc::UnboundedSender<SandboxEvent>,
) {
    let mut buf = [0u8; PUMP_CHUNK];
    let mut decoder = Utf8Decoder::default();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && events.send(SandboxEvent::Output(text)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::trace!(sandbox_id = %id, error = %e, "Terminal read ended");
                break;
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = events.send(SandboxEvent::Output(rest));
    }
    tracing::debug!(sandbox_id = %id, "Terminal pump finished");
}

/// Incremental UTF-8 decoding that never splits a character across events.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
