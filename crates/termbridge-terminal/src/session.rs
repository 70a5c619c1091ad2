//! A single bridged terminal session.
//!
//! A session owns the spawned process, both directions of its terminal
//! channel, the replay buffer and at most one attached connection. All
//! mutable state lives behind one lock so that buffering output, fanning
//! it out and swapping the attached connection are never interleaved.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use termbridge_types::{SessionInfo, SessionState, SignalKind};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::{ClientConnection, ConnectionId, SessionEvent};
use crate::errors::SessionError;
use crate::io_engine::{CloseReason, IoEngine, IoError, WorkerPool};
use crate::launcher::{Launched, MasterChannel, ProcessHandle, SpawnSpec};
use crate::logger::SessionLogger;
use crate::output_buffer::OutputBuffer;
use crate::translator::{force_kill, SignalError, SignalTranslator};
use crate::validator::{rule_names, InputStream, InputValidator, Rejection};

/// How long to wait for the child to be reaped after the terminal hangs up
const EXIT_WAIT: Duration = Duration::from_secs(2);
/// How long the read loop may keep draining after the child exits
const DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Why a session reached `Terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Exited,
    IoFailure,
    IdleTimeout,
    Shutdown,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Exited => "exited",
            TerminationReason::IoFailure => "io_failure",
            TerminationReason::IdleTimeout => "idle_timeout",
            TerminationReason::Shutdown => "shutdown",
        }
    }
}

/// Per-session knobs handed down by the manager
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ring_buffer_bytes: usize,
    pub terminate_grace: Duration,
    pub write_deadline: Duration,
    pub log_dir: Option<PathBuf>,
}

/// Result of attaching a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    /// State before the attach
    pub previous_state: SessionState,
    pub replayed_bytes: usize,
    /// Connection that lost the session to this one
    pub superseded: Option<ConnectionId>,
}

/// Result of one input submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputReport {
    /// Bytes that reached the terminal
    pub written: usize,
    /// Sequences stripped before writing
    pub rejected: Vec<Rejection>,
}

impl InputReport {
    pub fn rule_names(&self) -> String {
        rule_names(&self.rejected)
    }

    pub fn stripped_bytes(&self) -> usize {
        self.rejected.iter().map(|r| r.len).sum()
    }
}

struct Shared {
    state: SessionState,
    connection: Option<ClientConnection>,
    buffer: OutputBuffer,
    last_activity: Instant,
    exit_code: Option<i32>,
}

pub struct TerminalSession {
    key: String,
    spec: SpawnSpec,
    working_dir: String,
    created_at: DateTime<Utc>,
    process: Arc<ProcessHandle>,
    io: IoEngine,
    /// Held across validation and the write so chunks stay in order
    input: tokio::sync::Mutex<InputStream>,
    translator: SignalTranslator,
    shared: Mutex<Shared>,
    logger: Option<Mutex<SessionLogger>>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("key", &self.key)
            .field("command", &self.spec.command)
            .field("pid", &self.process.pid())
            .field("state", &self.state())
            .finish()
    }
}

impl TerminalSession {
    /// Wrap a freshly launched process and start pumping its output.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn start(
        key: String,
        spec: SpawnSpec,
        launched: Launched,
        size: (u16, u16),
        settings: &SessionSettings,
        pool: WorkerPool,
    ) -> Result<Arc<Self>, SessionError> {
        let Launched {
            process,
            master,
            exit,
        } = launched;
        let MasterChannel {
            master,
            reader,
            writer,
            readiness,
        } = master;

        let logger = settings.log_dir.as_deref().and_then(|dir| {
            match SessionLogger::new(&key, dir) {
                Ok(logger) => Some(Mutex::new(logger)),
                Err(e) => {
                    warn!(session_key = %key, error = %e, "session event log disabled");
                    None
                }
            }
        });

        let working_dir = spec
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();

        let mut io = IoEngine::new(reader, writer, pool).with_write_deadline(settings.write_deadline);
        if let Some(readiness) = readiness {
            io = io.with_readiness(readiness);
        }

        let session = Arc::new(Self {
            key,
            working_dir,
            created_at: Utc::now(),
            process: Arc::new(process),
            io,
            input: tokio::sync::Mutex::new(InputStream::new()),
            translator: SignalTranslator::new(master, size.0, size.1, settings.terminate_grace),
            shared: Mutex::new(Shared {
                state: SessionState::Starting,
                connection: None,
                buffer: OutputBuffer::new(settings.ring_buffer_bytes),
                last_activity: Instant::now(),
                exit_code: None,
            }),
            logger,
            spec,
        });

        session.log_event(
            "spawn",
            json!({
                "pid": session.process.pid(),
                "command": session.spec.display(),
                "rows": size.0,
                "cols": size.1,
            }),
        );
        session.write_metadata();

        let (closed_tx, closed_rx) = oneshot::channel();
        let weak = Arc::downgrade(&session);
        let thread_name = session.process.pid().unwrap_or_default().to_string();
        let started = session.io.read_loop(
            &thread_name,
            move |chunk| {
                if let Some(session) = weak.upgrade() {
                    session.on_output(chunk);
                }
            },
            move |reason| {
                let _ = closed_tx.send(reason);
            },
        );
        if let Err(e) = started {
            session.force_terminate(TerminationReason::IoFailure);
            return Err(e.into());
        }

        tokio::spawn(supervise(Arc::clone(&session), closed_rx, exit));
        info!(
            session_key = %session.key,
            pid = ?session.process.pid(),
            command = %session.spec.display(),
            "terminal session started"
        );
        Ok(session)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.lock_shared().state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock_shared().exit_code
    }

    /// (rows, cols)
    pub fn size(&self) -> (u16, u16) {
        self.translator.size()
    }

    pub fn attached_connection(&self) -> Option<ConnectionId> {
        self.lock_shared().connection.as_ref().map(|c| c.id)
    }

    /// Copy of the replay buffer
    pub fn replay_snapshot(&self) -> Bytes {
        self.lock_shared().buffer.snapshot()
    }

    /// Detached for at least `idle_timeout` with no input
    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        let shared = self.lock_shared();
        shared.state == SessionState::Detached && shared.last_activity.elapsed() >= idle_timeout
    }

    pub fn info(&self) -> SessionInfo {
        let (rows, cols) = self.size();
        let shared = self.lock_shared();
        SessionInfo {
            session_key: self.key.clone(),
            state: shared.state,
            pid: self.process.pid(),
            command: self.spec.display(),
            working_dir: self.working_dir.clone(),
            created_at: self.created_at.to_rfc3339(),
            idle_secs: shared.last_activity.elapsed().as_secs(),
            buffered_bytes: shared.buffer.len(),
            rows,
            cols,
            exit_code: shared.exit_code,
        }
    }

    /// Make `connection` the one receiver of this session's output.
    ///
    /// Any previously attached connection is told it is detached before the
    /// new one is marked active. The new connection gets a connected status
    /// followed by the buffered output. Attaching to a session that already
    /// terminated replays the buffer and reports the exit instead.
    pub(crate) fn attach(&self, connection: ClientConnection) -> AttachOutcome {
        let connection_id = connection.id;
        let mut shared = self.lock_shared();
        let previous_state = shared.state;
        let replay = shared.buffer.snapshot();
        let replayed_bytes = replay.len();

        if previous_state.is_terminated() {
            if !replay.is_empty() {
                connection.send(SessionEvent::Output(replay));
            }
            connection.send(SessionEvent::Closed {
                exit_code: shared.exit_code,
            });
            return AttachOutcome {
                previous_state,
                replayed_bytes,
                superseded: None,
            };
        }

        let superseded = shared.connection.take().map(|old| {
            old.send(SessionEvent::Status {
                connected: false,
                session_key: self.key.clone(),
            });
            old.send(SessionEvent::Superseded);
            old.id
        });

        connection.send(SessionEvent::Status {
            connected: true,
            session_key: self.key.clone(),
        });
        if !replay.is_empty() {
            connection.send(SessionEvent::Output(replay));
        }
        shared.connection = Some(connection);
        shared.state = SessionState::Active;
        shared.last_activity = Instant::now();
        drop(shared);

        if let Some(old) = superseded {
            info!(session_key = %self.key, old = %old, new = %connection_id, "connection superseded");
            self.log_event("superseded", json!({ "old": old, "new": connection_id }));
        }
        debug!(session_key = %self.key, connection = %connection_id, replayed_bytes, "attached");
        self.log_event(
            "attach",
            json!({
                "connection": connection_id,
                "previous_state": previous_state.as_str(),
                "replayed_bytes": replayed_bytes,
            }),
        );
        self.write_metadata();

        AttachOutcome {
            previous_state,
            replayed_bytes,
            superseded,
        }
    }

    /// Release `connection_id` if it is the attached connection.
    ///
    /// Returns false for stale connections, which leaves the session
    /// untouched.
    pub(crate) fn detach(&self, connection_id: ConnectionId) -> bool {
        let mut shared = self.lock_shared();
        match &shared.connection {
            Some(current) if current.id == connection_id => {}
            _ => return false,
        }
        shared.connection = None;
        shared.state = SessionState::Detached;
        shared.last_activity = Instant::now();
        drop(shared);

        debug!(session_key = %self.key, connection = %connection_id, "detached");
        self.log_event("detach", json!({ "connection": connection_id }));
        self.write_metadata();
        true
    }

    /// Validate and forward client input.
    ///
    /// Deny-listed sequences are stripped; the remainder is still written.
    /// A control string left open at the end of `data` is held back until a
    /// later submission completes or abandons it.
    pub async fn submit_input(
        &self,
        connection_id: ConnectionId,
        data: Bytes,
        validator: &InputValidator,
    ) -> Result<InputReport, SessionError> {
        self.ensure_attached(connection_id, true)?;

        let mut stream = self.input.lock().await;
        let validated = stream.feed(validator, &data);
        let payload = if validated.is_clean() && validated.bytes.as_ref() == data.as_ref() {
            data.clone()
        } else {
            Bytes::from(validated.bytes.into_owned())
        };

        let report = InputReport {
            written: 0,
            rejected: validated.rejected,
        };
        if !report.rejected.is_empty() {
            warn!(
                session_key = %self.key,
                rules = %report.rule_names(),
                stripped = report.stripped_bytes(),
                "rejected input sequences"
            );
            self.log_event(
                "input_rejected",
                json!({
                    "rules": report.rule_names(),
                    "stripped_bytes": report.stripped_bytes(),
                }),
            );
        }

        match self.io.write(payload).await {
            Ok(written) => Ok(InputReport { written, ..report }),
            Err(IoError::Closed) => Err(SessionError::Terminated(self.key.clone())),
            Err(e @ IoError::Stalled { .. }) => {
                warn!(session_key = %self.key, error = %e, "terminal is not reading input");
                Err(e.into())
            }
            Err(e) => {
                warn!(session_key = %self.key, error = %e, "terminal write failed");
                self.force_terminate(TerminationReason::IoFailure);
                Err(e.into())
            }
        }
    }

    /// Apply a window size change from the attached connection
    pub fn submit_resize(
        &self,
        connection_id: ConnectionId,
        rows: u16,
        cols: u16,
    ) -> Result<bool, SessionError> {
        self.ensure_attached(connection_id, false)?;
        let changed = self.translator.resize(rows, cols)?;
        if changed {
            self.with_logger(|logger| logger.log_resize(rows, cols));
        }
        Ok(changed)
    }

    /// Deliver a signal on behalf of the attached connection
    pub async fn submit_signal(
        &self,
        connection_id: ConnectionId,
        kind: SignalKind,
    ) -> Result<(), SessionError> {
        self.ensure_attached(connection_id, true)?;
        match self.translator.signal(&self.process, &self.io, kind).await {
            Ok(()) => {}
            Err(SignalError::Eof(IoError::Closed)) => {
                return Err(SessionError::Terminated(self.key.clone()))
            }
            Err(e) => return Err(e.into()),
        }
        debug!(session_key = %self.key, %kind, "delivered signal");
        self.log_event("signal", json!({ "kind": kind.to_string() }));
        Ok(())
    }

    /// Ask the process tree to exit, escalating to SIGKILL after the grace
    /// period. The session terminates once the process is reaped.
    pub fn terminate(&self) -> Result<(), SessionError> {
        if self.state().is_terminated() {
            return Ok(());
        }
        self.translator.terminate(&self.process)?;
        self.log_event("signal", json!({ "kind": SignalKind::Terminate.to_string() }));
        Ok(())
    }

    /// Kill the process tree and mark the session terminated immediately
    pub(crate) fn force_terminate(&self, reason: TerminationReason) -> bool {
        if let Err(e) = force_kill(&self.process) {
            warn!(session_key = %self.key, error = %e, "failed to kill terminal process");
        }
        self.finish(None, reason)
    }

    fn on_output(&self, chunk: Bytes) {
        let mut shared = self.lock_shared();
        if shared.state.is_terminated() {
            return;
        }
        shared.buffer.push(&chunk);
        if let Some(connection) = &shared.connection {
            connection.send(SessionEvent::Output(chunk));
        }
    }

    /// Transition to `Terminated`. Only the first call has any effect.
    pub(crate) fn finish(&self, exit_code: Option<i32>, reason: TerminationReason) -> bool {
        let connection = {
            let mut shared = self.lock_shared();
            if shared.state.is_terminated() {
                return false;
            }
            shared.state = SessionState::Terminated;
            shared.exit_code = exit_code;
            let connection = shared.connection.take();
            if let Some(connection) = &connection {
                connection.send(SessionEvent::Closed { exit_code });
            }
            connection.map(|c| c.id)
        };
        self.io.close();
        if let Err(e) = self.translator.hang_up(&self.process) {
            debug!(session_key = %self.key, error = %e, "failed to hang up process group");
        }

        info!(
            session_key = %self.key,
            ?exit_code,
            reason = reason.as_str(),
            "terminal session terminated"
        );
        self.log_event(
            "terminated",
            json!({
                "exit_code": exit_code,
                "reason": reason.as_str(),
                "connection": connection,
            }),
        );
        self.write_metadata();
        true
    }

    fn ensure_attached(&self, connection_id: ConnectionId, touch: bool) -> Result<(), SessionError> {
        let mut shared = self.lock_shared();
        if shared.state.is_terminated() {
            return Err(SessionError::Terminated(self.key.clone()));
        }
        match &shared.connection {
            Some(current) if current.id == connection_id => {
                if touch {
                    shared.last_activity = Instant::now();
                }
                Ok(())
            }
            _ => Err(SessionError::NotAttached(self.key.clone())),
        }
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_logger<F>(&self, f: F)
    where
        F: FnOnce(&mut SessionLogger) -> anyhow::Result<()>,
    {
        if let Some(logger) = &self.logger {
            let mut logger = logger.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = f(&mut logger) {
                warn!(session_key = %self.key, error = %e, "failed to write session log");
            }
        }
    }

    fn log_event(&self, event: &str, fields: Value) {
        self.with_logger(|logger| logger.log_event(event, fields));
    }

    fn write_metadata(&self) {
        if self.logger.is_none() {
            return;
        }
        let metadata = serde_json::to_value(self.info()).unwrap_or(Value::Null);
        self.with_logger(|logger| logger.write_metadata(&metadata));
    }
}

/// Waits for the process or its terminal to go away, then finishes the
/// session exactly once.
async fn supervise(
    session: Arc<TerminalSession>,
    mut closed: oneshot::Receiver<CloseReason>,
    mut exit: oneshot::Receiver<Option<i32>>,
) {
    let (exit_code, reason) = tokio::select! {
        close = &mut closed => {
            let close = close.unwrap_or(CloseReason::Eof);
            let reason = match &close {
                CloseReason::Eof | CloseReason::Stopped => TerminationReason::Exited,
                CloseReason::Error(e) => {
                    warn!(session_key = %session.key, error = %e, "terminal read failed");
                    if let Err(e) = force_kill(&session.process) {
                        warn!(session_key = %session.key, error = %e, "failed to kill terminal process");
                    }
                    TerminationReason::IoFailure
                }
            };
            let exit_code = match timeout(EXIT_WAIT, &mut exit).await {
                Ok(code) => code.ok().flatten(),
                Err(_) => {
                    warn!(session_key = %session.key, "terminal hung up but process is still running, killing it");
                    if let Err(e) = force_kill(&session.process) {
                        warn!(session_key = %session.key, error = %e, "failed to kill terminal process");
                    }
                    timeout(EXIT_WAIT, &mut exit).await.ok().and_then(Result::ok).flatten()
                }
            };
            (exit_code, reason)
        }
        code = &mut exit => {
            // Last output may still be in flight.
            let _ = timeout(DRAIN_WAIT, &mut closed).await;
            (code.ok().flatten(), TerminationReason::Exited)
        }
    };
    session.finish(exit_code, reason);
}
