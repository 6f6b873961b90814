//! STDIO bridge transport.
//!
//! Each session spawns one subprocess MCP server and bridges its stdin and
//! stdout as line-delimited JSON-RPC frames. The session exclusively owns
//! the child: a monitor task observes exit and flips the session terminal,
//! and close delivers SIGTERM, waits out the kill grace, then SIGKILLs.
//! Stderr is captured into a bounded tail for diagnostics.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use meshgate_protocol::jsonrpc::ERROR_PAYLOAD_TOO_LARGE;
use meshgate_protocol::JsonRpcMessage;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::core::{
    LaunchSpec, SessionContext, Transport, TransportConnection, TransportError, TransportResult,
    TransportType,
};
use crate::session::{SessionState, SessionStore};

/// STDIO bridge tunables.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Grace between SIGTERM and SIGKILL on close
    pub kill_timeout: Duration,
    /// Hard cap on a single framed line, both directions
    pub max_frame_size: usize,
    /// Stderr lines retained for diagnostics
    pub stderr_tail_lines: usize,
    /// Exit-monitor polling cadence
    pub monitor_interval: Duration,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            kill_timeout: Duration::from_secs(5),
            max_frame_size: meshgate_protocol::MAX_MESSAGE_SIZE,
            stderr_tail_lines: 32,
            monitor_interval: Duration::from_millis(200),
        }
    }
}

/// Subprocess lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Spawn in progress
    Starting,
    /// Child is alive
    Running,
    /// Exited with code 0
    Stopped,
    /// Exited non-zero, by signal, or failed to spawn
    Error,
}

/// Observable subprocess state for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    /// Child pid, when spawned
    pub pid: Option<u32>,
    /// Executable
    pub command: String,
    /// Arguments
    pub args: Vec<String>,
    /// Lifecycle state
    pub status: ProcessStatus,
    /// Spawn time
    pub started_at: Option<DateTime<Utc>>,
    /// Exit time
    pub ended_at: Option<DateTime<Utc>>,
    /// Exit code, when exited normally
    pub exit_code: Option<i32>,
    /// Last captured stderr lines
    pub stderr_tail: Vec<String>,
}

/// Items the stdout reader hands to `receive`.
#[derive(Debug)]
enum InboundItem {
    Message(Box<JsonRpcMessage>),
    Oversized(usize),
}

/// The STDIO bridge: registry of per-session subprocess connections.
#[derive(Debug)]
pub struct StdioTransport {
    connections: DashMap<Uuid, Arc<StdioConnection>>,
    config: StdioConfig,
    store: Arc<SessionStore>,
}

impl StdioTransport {
    /// Create the bridge. The store reference lets the exit monitor flip
    /// sessions terminal when their child dies.
    pub fn new(config: StdioConfig, store: Arc<SessionStore>) -> Self {
        Self {
            connections: DashMap::new(),
            config,
            store,
        }
    }

    /// Look up a live connection.
    pub fn connection(&self, session_id: Uuid) -> Option<Arc<StdioConnection>> {
        self.connections.get(&session_id).map(|c| Arc::clone(&c))
    }

    /// Drop a connection from the registry.
    pub fn remove(&self, session_id: Uuid) {
        self.connections.remove(&session_id);
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }

    async fn create_session(
        &self,
        ctx: SessionContext,
    ) -> TransportResult<Arc<dyn TransportConnection>> {
        let spec = ctx.launch.clone().ok_or_else(|| {
            TransportError::Unavailable("stdio session requires a launch spec".to_string())
        })?;
        let conn = Arc::new(StdioConnection::new(
            ctx,
            spec,
            self.config.clone(),
            Arc::clone(&self.store),
        ));
        conn.spawn().await?;
        self.connections.insert(conn.session_id, Arc::clone(&conn));
        Ok(conn)
    }
}

/// One supervised subprocess session.
pub struct StdioConnection {
    /// Owning session
    pub session_id: Uuid,
    spec: LaunchSpec,
    config: StdioConfig,
    store: Arc<SessionStore>,

    child: TokioMutex<Option<Child>>,
    pid: AtomicU32,
    status: Mutex<ProcessStatus>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
    exit_code: Mutex<Option<i32>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,

    stdin_tx: TokioMutex<Option<mpsc::Sender<String>>>,
    stdout_rx: TokioMutex<Option<mpsc::Receiver<InboundItem>>>,
    open: AtomicBool,
    restarting: AtomicBool,
}

impl std::fmt::Debug for StdioConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioConnection")
            .field("session_id", &self.session_id)
            .field("command", &self.spec.command)
            .field("status", &*self.status.lock())
            .finish_non_exhaustive()
    }
}

impl StdioConnection {
    const CHANNEL_DEPTH: usize = 100;

    fn new(
        ctx: SessionContext,
        spec: LaunchSpec,
        config: StdioConfig,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            session_id: ctx.session_id,
            spec,
            config,
            store,
            child: TokioMutex::new(None),
            pid: AtomicU32::new(0),
            status: Mutex::new(ProcessStatus::Starting),
            started_at: Mutex::new(None),
            ended_at: Mutex::new(None),
            exit_code: Mutex::new(None),
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            stdin_tx: TokioMutex::new(None),
            stdout_rx: TokioMutex::new(None),
            open: AtomicBool::new(true),
            restarting: AtomicBool::new(false),
        }
    }

    /// Child pid, when spawned.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ProcessStatus {
        *self.status.lock()
    }

    /// Observable snapshot for status queries.
    pub fn process_info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid(),
            command: self.spec.command.clone(),
            args: self.spec.args.clone(),
            status: self.status(),
            started_at: *self.started_at.lock(),
            ended_at: *self.ended_at.lock(),
            exit_code: *self.exit_code.lock(),
            stderr_tail: self.stderr_tail.lock().iter().cloned().collect(),
        }
    }

    /// Spawn the child and wire the pipe pumps. Fails if the command cannot
    /// start; a child that exits immediately is caught by the monitor.
    pub(crate) async fn spawn(self: &Arc<Self>) -> TransportResult<()> {
        if self.spec.command.is_empty() {
            *self.status.lock() = ProcessStatus::Error;
            return Err(TransportError::ConnectionFailed(
                "command cannot be empty".to_string(),
            ));
        }
        *self.status.lock() = ProcessStatus::Starting;

        info!(
            session_id = %self.session_id,
            command = %self.spec.command,
            "spawning stdio backend"
        );

        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Overrides are layered over the inherited environment; values are
        // passed verbatim, never interpreted.
        cmd.envs(&self.spec.env);
        if let Some(ref cwd) = self.spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            *self.status.lock() = ProcessStatus::Error;
            TransportError::ConnectionFailed(format!("spawn failed: {e}"))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConnectionFailed("no stdin handle".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConnectionFailed("no stdout handle".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::ConnectionFailed("no stderr handle".to_string())
        })?;

        if let Some(pid) = child.id() {
            self.pid.store(pid, Ordering::Release);
        }
        *self.started_at.lock() = Some(Utc::now());
        *self.status.lock() = ProcessStatus::Running;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(Self::CHANNEL_DEPTH);
        let (stdout_tx, stdout_rx) = mpsc::channel::<InboundItem>(Self::CHANNEL_DEPTH);

        // Writer: queued frames become newline-delimited child stdin.
        let session_id = self.session_id;
        tokio::spawn(async move {
            let mut writer = BufWriter::new(stdin);
            while let Some(line) = stdin_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    error!(session_id = %session_id, "stdin write failed");
                    break;
                }
                trace!(session_id = %session_id, "frame written to child");
            }
            debug!(session_id = %session_id, "stdin pump finished");
        });

        // Reader: child stdout lines become inbound frames. Oversized lines
        // surface as protocol errors; non-JSON lines are logged and skipped
        // so a chatty server cannot wedge the bridge.
        let max_frame = self.config.max_frame_size;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.len() > max_frame {
                    warn!(session_id = %session_id, size = line.len(), "oversized frame");
                    if stdout_tx.send(InboundItem::Oversized(line.len())).await.is_err() {
                        break;
                    }
                    continue;
                }
                match serde_json::from_str::<JsonRpcMessage>(&line) {
                    Ok(message) => {
                        if stdout_tx.send(InboundItem::Message(Box::new(message))).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(session_id = %session_id, "non-frame stdout line skipped: {e}");
                    }
                }
            }
            debug!(session_id = %session_id, "stdout pump finished");
        });

        // Stderr tail for diagnostics.
        let tail = Arc::clone(&self.stderr_tail);
        let tail_lines = self.config.stderr_tail_lines;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut tail = tail.lock();
                if tail.len() == tail_lines {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        *self.stdin_tx.lock().await = Some(stdin_tx);
        *self.stdout_rx.lock().await = Some(stdout_rx);
        *self.child.lock().await = Some(child);

        // Exit monitor: the only task that reaps a child that dies on its
        // own. Close-path reaping takes the child out of the slot first.
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conn.config.monitor_interval);
            loop {
                ticker.tick().await;
                let mut guard = conn.child.lock().await;
                let Some(child) = guard.as_mut() else {
                    // Close path took ownership; nothing left to watch.
                    return;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        guard.take();
                        drop(guard);
                        conn.record_exit(status.code(), status.success());
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        guard.take();
                        drop(guard);
                        error!(session_id = %conn.session_id, "monitor wait failed: {e}");
                        conn.record_exit(None, false);
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    /// Record an observed exit and flip the session terminal.
    fn record_exit(&self, code: Option<i32>, clean: bool) {
        self.open.store(false, Ordering::Release);
        *self.exit_code.lock() = code;
        *self.ended_at.lock() = Some(Utc::now());
        *self.status.lock() = if clean {
            ProcessStatus::Stopped
        } else {
            ProcessStatus::Error
        };
        if self.restarting.load(Ordering::Acquire) {
            // Intentional teardown mid-restart; the session record stays
            // live for the replacement child.
            return;
        }
        let outcome = if clean {
            SessionState::Closed
        } else {
            SessionState::Error
        };
        if self.store.close(self.session_id, outcome) {
            info!(
                session_id = %self.session_id,
                exit_code = ?code,
                stderr_tail = ?self.stderr_tail.lock().back(),
                "stdio backend exited"
            );
        }
    }

    #[cfg(unix)]
    fn signal_term(&self) {
        if let Some(pid) = self.pid() {
            // SAFETY: plain kill(2) with a pid we spawned; no memory is
            // touched and a stale pid at worst returns ESRCH.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_term(&self) {}

    /// Terminate the child: SIGTERM, a bounded grace, then SIGKILL.
    async fn terminate(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        // Drop the stdin sender so the child also sees EOF.
        *self.stdin_tx.lock().await = None;

        self.signal_term();
        match tokio::time::timeout(self.config.kill_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                self.record_exit(status.code(), status.success());
                return;
            }
            Ok(Err(e)) => {
                error!(session_id = %self.session_id, "wait after TERM failed: {e}");
            }
            Err(_) => {
                warn!(
                    session_id = %self.session_id,
                    grace = ?self.config.kill_timeout,
                    "child ignored TERM, killing"
                );
            }
        }
        if let Err(e) = child.kill().await {
            error!(session_id = %self.session_id, "kill failed: {e}");
        }
        let code = child.wait().await.ok().and_then(|s| s.code());
        self.record_exit(code, false);
    }

    /// Restart the child in place: terminate, then spawn the same spec
    /// again under the same session.
    pub async fn restart(self: &Arc<Self>) -> TransportResult<()> {
        self.restarting.store(true, Ordering::Release);
        self.terminate().await;
        self.restarting.store(false, Ordering::Release);
        self.open.store(true, Ordering::Release);
        *self.exit_code.lock() = None;
        *self.ended_at.lock() = None;
        self.spawn().await
    }
}

#[async_trait]
impl TransportConnection for StdioConnection {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }

    async fn send(&self, message: JsonRpcMessage) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::PeerClosed);
        }
        let line = serde_json::to_string(&message)?;
        if line.len() > self.config.max_frame_size {
            return Err(TransportError::protocol(
                ERROR_PAYLOAD_TOO_LARGE,
                format!("frame of {} bytes exceeds cap", line.len()),
            ));
        }
        let guard = self.stdin_tx.lock().await;
        let sender = guard.as_ref().ok_or(TransportError::PeerClosed)?;
        sender
            .send(line)
            .await
            .map_err(|_| TransportError::PeerClosed)
    }

    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>> {
        let mut guard = self.stdout_rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return Ok(None);
        };
        match rx.recv().await {
            Some(InboundItem::Message(message)) => Ok(Some(*message)),
            Some(InboundItem::Oversized(size)) => Err(TransportError::protocol(
                ERROR_PAYLOAD_TOO_LARGE,
                format!("child emitted {size}-byte frame"),
            )),
            None => Ok(None),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.open.swap(false, Ordering::AcqRel) && self.child.lock().await.is_none() {
            return Ok(());
        }
        self.terminate().await;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Merge an explicit environment over inherited variables, overrides
/// winning. Exposed for the execute surface, which reports the effective
/// environment size.
pub fn merged_env(overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (k, v) in overrides {
        env.insert(k.clone(), v.clone());
    }
    env
}
