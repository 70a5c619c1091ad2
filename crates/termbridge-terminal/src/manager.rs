use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use termbridge_types::{
    SessionInfo, SessionState, SignalKind, DEFAULT_COLS, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_RING_BUFFER_BYTES, DEFAULT_ROWS, DEFAULT_TERMINATE_GRACE_MS, DEFAULT_WORKER_POOL_SIZE,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ClientConnection, ConnectionId};
use crate::errors::SessionError;
use crate::io_engine::{WorkerPool, DEFAULT_WRITE_DEADLINE};
use crate::launcher::{self, SpawnSpec};
use crate::session::{
    AttachOutcome, InputReport, SessionSettings, TerminalSession, TerminationReason,
};
use crate::validator::{InputValidator, ValidatorConfig};

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a detached session survives without input
    pub idle_timeout: Duration,
    pub ring_buffer_bytes: usize,
    /// Blocking workers shared by all sessions for terminal writes
    pub worker_pool_size: usize,
    /// Delay between SIGTERM and SIGKILL
    pub terminate_grace: Duration,
    /// How long one input write may wait on a terminal that reads nothing
    pub write_deadline: Duration,
    pub default_size: (u16, u16),
    pub validator: ValidatorConfig,
    /// Per-session JSONL event logs are written here when set
    pub log_dir: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            ring_buffer_bytes: DEFAULT_RING_BUFFER_BYTES,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            terminate_grace: Duration::from_millis(DEFAULT_TERMINATE_GRACE_MS),
            write_deadline: DEFAULT_WRITE_DEADLINE,
            default_size: (DEFAULT_ROWS, DEFAULT_COLS),
            validator: ValidatorConfig::default(),
            log_dir: None,
        }
    }
}

/// What one sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Detached sessions killed for inactivity
    pub evicted: Vec<String>,
    /// Already terminated sessions dropped from the registry
    pub reaped: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.reaped.is_empty()
    }
}

struct Registry {
    sessions: RwLock<HashMap<String, Arc<TerminalSession>>>,
    /// Serializes attach, detach and teardown per key
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    config: ManagerConfig,
    settings: SessionSettings,
    validator: InputValidator,
    pool: WorkerPool,
}

/// Registry of live sessions keyed by caller-supplied session key.
///
/// Cheap to clone; every clone shares the same registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Registry>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.inner.config)
            .field("validator_rules", &self.inner.validator.rule_count())
            .finish()
    }
}

impl SessionManager {
    pub fn new(config: ManagerConfig) -> Result<Self, regex::Error> {
        let validator = InputValidator::new(&config.validator)?;
        let settings = SessionSettings {
            ring_buffer_bytes: config.ring_buffer_bytes,
            terminate_grace: config.terminate_grace,
            write_deadline: config.write_deadline,
            log_dir: config.log_dir.clone(),
        };
        Ok(Self {
            inner: Arc::new(Registry {
                sessions: RwLock::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
                pool: WorkerPool::new(config.worker_pool_size),
                validator,
                settings,
                config,
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Attach `connection` to the session named `session_key`, spawning
    /// `spec` first when no live session exists under that key.
    ///
    /// `size` is the connection's terminal size. A new session starts at
    /// that size; an existing one is resized to it after the attach.
    pub async fn attach(
        &self,
        session_key: &str,
        spec: SpawnSpec,
        connection: ClientConnection,
        size: Option<(u16, u16)>,
    ) -> Result<AttachOutcome, SessionError> {
        let connection_id = connection.id;
        let key_lock = self.key_lock(session_key);
        let _guard = key_lock.lock().await;

        let existing = self.get(session_key).await;
        let (session, fresh) = match existing {
            Some(session) if !session.state().is_terminated() => (session, false),
            stale => {
                if stale.is_some() {
                    debug!(session_key, "replacing terminated session");
                }
                let size = size.unwrap_or(self.inner.config.default_size);
                let session = self.spawn_session(session_key, spec, size).await?;
                self.inner
                    .sessions
                    .write()
                    .await
                    .insert(session_key.to_string(), Arc::clone(&session));
                (session, true)
            }
        };

        let outcome = session.attach(connection);
        if !fresh && !outcome.previous_state.is_terminated() {
            if let Some((rows, cols)) = size {
                if let Err(e) = session.submit_resize(connection_id, rows, cols) {
                    warn!(session_key, error = %e, "failed to apply initial size");
                }
            }
        }
        Ok(outcome)
    }

    /// Alias of [`SessionManager::attach`] for callers that think in terms
    /// of opening a session.
    pub async fn open_session(
        &self,
        session_key: &str,
        spec: SpawnSpec,
        connection: ClientConnection,
    ) -> Result<AttachOutcome, SessionError> {
        self.attach(session_key, spec, connection, None).await
    }

    /// Detach `connection_id`. Stale or unknown connections are ignored.
    pub async fn detach(&self, session_key: &str, connection_id: ConnectionId) -> bool {
        let key_lock = self.key_lock(session_key);
        let _guard = key_lock.lock().await;
        match self.get(session_key).await {
            Some(session) => session.detach(connection_id),
            None => false,
        }
    }

    pub async fn submit_input(
        &self,
        session_key: &str,
        connection_id: ConnectionId,
        data: Bytes,
    ) -> Result<InputReport, SessionError> {
        let session = self.require(session_key).await?;
        session
            .submit_input(connection_id, data, &self.inner.validator)
            .await
    }

    /// Returns whether the size changed
    pub async fn submit_resize(
        &self,
        session_key: &str,
        connection_id: ConnectionId,
        rows: u16,
        cols: u16,
    ) -> Result<bool, SessionError> {
        self.require(session_key)
            .await?
            .submit_resize(connection_id, rows, cols)
    }

    pub async fn submit_signal(
        &self,
        session_key: &str,
        connection_id: ConnectionId,
        kind: SignalKind,
    ) -> Result<(), SessionError> {
        let session = self.require(session_key).await?;
        session.submit_signal(connection_id, kind).await
    }

    /// Kill detached sessions idle past the timeout and drop terminated
    /// ones from the registry.
    pub async fn sweep_idle(&self) -> SweepReport {
        let idle_timeout = self.inner.config.idle_timeout;
        let candidates: Vec<(String, Arc<TerminalSession>)> = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.state().is_terminated() || s.is_idle(idle_timeout))
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        let mut report = SweepReport::default();
        for (key, session) in candidates {
            let key_lock = self.key_lock(&key);
            let _guard = key_lock.lock().await;

            // A reconnect may have won the race for the key lock.
            if session.is_idle(idle_timeout) {
                info!(
                    session_key = %key,
                    idle_timeout_secs = idle_timeout.as_secs(),
                    "evicting idle session"
                );
                session.force_terminate(TerminationReason::IdleTimeout);
                if self.remove_entry(&key, &session).await {
                    report.evicted.push(key.clone());
                }
            } else if session.state().is_terminated() && self.remove_entry(&key, &session).await {
                debug!(session_key = %key, "reaped terminated session");
                report.reaped.push(key.clone());
            }
        }
        self.prune_key_locks();
        report
    }

    /// Run [`SessionManager::sweep_idle`] every `interval` until `cancel`
    /// fires.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = manager.sweep_idle().await;
                        if !report.is_empty() {
                            debug!(
                                evicted = report.evicted.len(),
                                reaped = report.reaped.len(),
                                "idle sweep finished"
                            );
                        }
                    }
                }
            }
            debug!("idle sweeper stopped");
        })
    }

    /// Snapshot of every registered session, oldest first
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<TerminalSession>> =
            self.inner.sessions.read().await.values().cloned().collect();
        let mut sessions: Vec<_> = sessions.iter().map(|s| (s.created_at(), s.info())).collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.session_key.cmp(&b.1.session_key)));
        sessions.into_iter().map(|(_, info)| info).collect()
    }

    pub async fn session_info(&self, session_key: &str) -> Option<SessionInfo> {
        self.get(session_key).await.map(|s| s.info())
    }

    pub async fn state(&self, session_key: &str) -> Option<SessionState> {
        self.get(session_key).await.map(|s| s.state())
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Terminate the session's process tree and drop it from the registry.
    ///
    /// An attached connection still receives the closed event once the
    /// process is reaped.
    pub async fn terminate(&self, session_key: &str) -> Result<(), SessionError> {
        let key_lock = self.key_lock(session_key);
        let _guard = key_lock.lock().await;
        let session = self.require(session_key).await?;
        session.terminate()?;
        self.remove_entry(session_key, &session).await;
        info!(session_key, "session terminated on request");
        Ok(())
    }

    /// Drop a terminated session from the registry. Live sessions stay.
    pub async fn remove(&self, session_key: &str) -> bool {
        let key_lock = self.key_lock(session_key);
        let _guard = key_lock.lock().await;
        match self.get(session_key).await {
            Some(session) if session.state().is_terminated() => {
                self.remove_entry(session_key, &session).await
            }
            _ => false,
        }
    }

    /// Kill every session and empty the registry
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, Arc<TerminalSession>)> =
            self.inner.sessions.write().await.drain().collect();
        for (key, session) in &sessions {
            if session.force_terminate(TerminationReason::Shutdown) {
                debug!(session_key = %key, "terminated on shutdown");
            }
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "terminated all sessions");
        }
    }

    async fn spawn_session(
        &self,
        session_key: &str,
        spec: SpawnSpec,
        size: (u16, u16),
    ) -> Result<Arc<TerminalSession>, SessionError> {
        let launch_spec = spec.clone();
        let launched = tokio::task::spawn_blocking(move || {
            launcher::spawn(&launch_spec, size.0, size.1)
        })
        .await
        .map_err(|e| SessionError::Worker(e.to_string()))?;

        let launched = match launched {
            Ok(launched) => launched,
            Err(e) => {
                warn!(session_key, command = %spec.display(), error = %e, "spawn failed");
                return Err(e.into());
            }
        };

        TerminalSession::start(
            session_key.to_string(),
            spec,
            launched,
            size,
            &self.inner.settings,
            self.inner.pool.clone(),
        )
    }

    async fn get(&self, session_key: &str) -> Option<Arc<TerminalSession>> {
        self.inner.sessions.read().await.get(session_key).cloned()
    }

    async fn require(&self, session_key: &str) -> Result<Arc<TerminalSession>, SessionError> {
        self.get(session_key)
            .await
            .ok_or_else(|| SessionError::NotFound(session_key.to_string()))
    }

    /// Remove `session_key` only if it still maps to `session`
    async fn remove_entry(&self, session_key: &str, session: &Arc<TerminalSession>) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get(session_key) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session_key);
                true
            }
            _ => false,
        }
    }

    fn key_lock(&self, session_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(session_key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Forget locks nobody holds or waits on
    fn prune_key_locks(&self) {
        let mut locks = self.inner.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}
