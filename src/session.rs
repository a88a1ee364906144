//! Session lifecycle: spawn a shell in a PTY, pump its output into the
//! multiplexer and tear everything down exactly once.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::activity::ActivityTracker;
use crate::broker::{Broker, SubscriberQueue, Subscription};
use crate::buffer::{InputHistory, OutputBuffer};
use crate::context::{ContextSnapshot, LiveState};
use crate::event::{EndReason, Payload, SessionId};
use crate::pattern::{Detection, MatcherState, PatternEngine};
use crate::pty::{Pty, PtyError, SpawnConfig};

const READ_BUFFER_SIZE: usize = 4096;
const INPUT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Spawn(#[from] PtyError),

    #[error("spawn task failed: {0}")]
    SpawnTask(#[from] tokio::task::JoinError),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("maximum number of sessions reached")]
    MaxSessionsReached,

    #[error("shell not allowed: {0}")]
    ShellNotAllowed(String),

    #[error("terminal size must be non-zero")]
    InvalidSize,

    #[error("session manager is shutting down")]
    ShuttingDown,
}

/// A client's request to start a session. Everything is optional; gaps are
/// filled from [`SessionLimits`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

/// Host-side policy applied to every session.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_sessions: Option<usize>,
    pub output_buffer_bytes: usize,
    pub default_shell: Option<String>,
    pub default_rows: u16,
    pub default_cols: u16,
    /// Empty means any shell may be requested.
    pub allowed_shells: Vec<String>,
    /// How long to wait for the reader to reach EOF after the child exits.
    pub exit_drain_grace: Duration,
    /// How long a terminated child gets between SIGHUP and SIGKILL.
    pub kill_grace: Duration,
    pub input_history: usize,
    /// How long a detached session waits to be attached again before it is
    /// terminated. `None` keeps it until shutdown.
    pub detached_ttl: Option<Duration>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: Some(64),
            output_buffer_bytes: 64 * 1024,
            default_shell: None,
            default_rows: 24,
            default_cols: 80,
            allowed_shells: Vec::new(),
            exit_drain_grace: Duration::from_millis(500),
            kill_grace: Duration::from_secs(3),
            input_history: 50,
            detached_ttl: Some(Duration::from_secs(300)),
        }
    }
}

/// Everything that publication, liveness and snapshots must see consistently.
struct StreamState {
    alive: bool,
    output: OutputBuffer,
    inputs: InputHistory,
    matcher: MatcherState,
}

/// Whether a client currently holds the session.
#[derive(Debug)]
struct Attachment {
    attached: bool,
    /// Bumped on every detach, so a stale reaper can tell it lost the race.
    generation: u64,
}

/// One managed shell process.
pub struct Session {
    pub id: SessionId,
    pub pid: Option<u32>,
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    input_tx: mpsc::Sender<Bytes>,
    pty: Mutex<Pty>,
    size: Mutex<(u16, u16)>,
    stream: Mutex<StreamState>,
    activity: ActivityTracker,
    attachment: Mutex<Attachment>,
    /// Set once the child has been reaped, so we never signal a recycled PID.
    child_exited: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn is_alive(&self) -> bool {
        self.stream.lock().alive
    }

    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    /// Record and publish one output chunk, then run pattern detection on it.
    /// Returns `false` once the session has been torn down.
    fn ingest_output(&self, broker: &Broker, engine: &PatternEngine, data: Bytes) -> bool {
        let mut stream = self.stream.lock();
        if !stream.alive {
            return false;
        }
        stream.output.push(data.clone());
        self.activity.touch();
        broker.publish(self.id, Payload::Output(data.clone()));

        let detections = engine.feed(&mut stream.matcher, self.id, &data);
        self.publish_detections(broker, detections);
        true
    }

    /// Callers hold the stream lock.
    fn publish_detections(&self, broker: &Broker, detections: Vec<Detection>) {
        for detection in detections {
            tracing::debug!(
                session = %self.id,
                rule = %detection.event.rule,
                "pattern detected"
            );
            broker.publish(self.id, Payload::Pattern(detection.event));
            if let Some(suggestion) = detection.suggestion {
                broker.publish(self.id, Payload::Suggestion(suggestion));
            }
        }
    }

    async fn write_input(&self, broker: &Broker, data: Bytes) {
        {
            let mut stream = self.stream.lock();
            if !stream.alive {
                tracing::debug!(session = %self.id, "input for ended session ignored");
                return;
            }
            stream.inputs.record(&data);
            self.activity.touch();
            broker.publish(self.id, Payload::Input(data.clone()));
        }
        if self.input_tx.send(data).await.is_err() {
            tracing::debug!(session = %self.id, "pty writer gone, input dropped");
        }
    }

    fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        if rows == 0 || cols == 0 {
            return Err(SessionError::InvalidSize);
        }
        if !self.is_alive() {
            return Err(SessionError::UnknownSession(self.id));
        }
        self.pty.lock().resize(rows, cols)?;
        *self.size.lock() = (rows, cols);
        Ok(())
    }

    /// Snapshot taken under the stream lock; `None` once the session ended.
    pub(crate) fn snapshot(&self) -> Option<ContextSnapshot> {
        let stream = self.stream.lock();
        if !stream.alive {
            return None;
        }
        let (rows, cols) = self.size();
        Some(ContextSnapshot {
            session_id: self.id,
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            created_at: self.created_at,
            recent_output: stream.output.recent_text(),
            last_patterns: stream.matcher.recent().cloned().collect(),
            recent_inputs: stream.inputs.lines(),
            live: LiveState {
                alive: stream.alive,
                pid: self.pid,
                rows,
                cols,
                bytes_out: stream.output.total_bytes(),
                idle_ms: self.activity.idle_ms(),
                activity_generation: self.activity.generation(),
            },
        })
    }

    /// Send SIGHUP to the child's process group.
    ///
    /// portable_pty calls setsid() when spawning, so the child leads its own
    /// group and anything the shell started gets the signal too.
    fn send_sighup(&self) {
        self.signal(libc::SIGHUP);
    }

    fn kill_child(&self) {
        self.signal(libc::SIGKILL);
    }

    fn signal(&self, sig: libc::c_int) {
        let Some(pid) = self.pid else { return };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return;
        }
        if self.child_exited.load(Ordering::Acquire) {
            tracing::debug!(pid, sig, "child already exited, not signalling");
            return;
        }
        #[cfg(unix)]
        unsafe {
            libc::kill(-(pid as i32), sig);
        }
    }
}

struct ManagerInner {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    accepting: AtomicBool,
    broker: Broker,
    engine: Arc<PatternEngine>,
    limits: SessionLimits,
}

/// Owns every session and its process handle.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(broker: Broker, engine: Arc<PatternEngine>, limits: SessionLimits) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: RwLock::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                broker,
                engine,
                limits,
            }),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.inner.limits
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<SessionId> {
        self.inner.sessions.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn a session and start draining its output into the multiplexer.
    pub async fn start_session(&self, config: SessionConfig) -> Result<SessionId, SessionError> {
        self.spawn(config, None).await.map(|(id, _)| id)
    }

    /// Like [`start_session`](Self::start_session), but attaches `queue` to
    /// the session before anything is published, so it sees
    /// `session_started` and every byte of output.
    pub async fn start_session_subscribed(
        &self,
        config: SessionConfig,
        queue: SubscriberQueue,
    ) -> Result<(SessionId, Subscription), SessionError> {
        let (id, sub) = self.spawn(config, Some(queue)).await?;
        let sub = sub.ok_or(SessionError::UnknownSession(id))?;
        Ok((id, sub))
    }

    fn resolve(&self, config: SessionConfig) -> Result<SpawnConfig, SessionError> {
        let limits = &self.inner.limits;
        let shell = config
            .shell
            .filter(|s| !s.is_empty())
            .or_else(|| limits.default_shell.clone())
            .unwrap_or_else(SpawnConfig::default_shell);
        if !limits.allowed_shells.is_empty() && !limits.allowed_shells.contains(&shell) {
            return Err(SessionError::ShellNotAllowed(shell));
        }
        let rows = config.rows.unwrap_or(limits.default_rows);
        let cols = config.cols.unwrap_or(limits.default_cols);
        if rows == 0 || cols == 0 {
            return Err(SessionError::InvalidSize);
        }
        Ok(SpawnConfig {
            shell,
            args: config.args,
            cwd: config.cwd,
            env: config.env,
            rows,
            cols,
        })
    }

    fn check_capacity(&self, current: usize) -> Result<(), SessionError> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(SessionError::ShuttingDown);
        }
        match self.inner.limits.max_sessions {
            Some(max) if current >= max => Err(SessionError::MaxSessionsReached),
            _ => Ok(()),
        }
    }

    async fn spawn(
        &self,
        config: SessionConfig,
        queue: Option<SubscriberQueue>,
    ) -> Result<(SessionId, Option<Subscription>), SessionError> {
        let spawn = self.resolve(config)?;
        // Advisory; the authoritative check happens under the write lock below.
        self.check_capacity(self.len())?;

        let command = spawn.display();
        let cwd = spawn.cwd.clone();
        let (rows, cols) = (spawn.rows, spawn.cols);
        let mut pty = tokio::task::spawn_blocking(move || Pty::spawn(&spawn)).await??;
        let mut child = pty.take_child();
        let (reader, writer) = match pty
            .take_reader()
            .and_then(|reader| Ok((reader, pty.take_writer()?)))
        {
            Ok(handles) => handles,
            Err(e) => {
                discard_child(child.take());
                return Err(e.into());
            }
        };
        let pid = child.as_ref().and_then(|c| c.process_id());

        let id = SessionId::new();
        let limits = &self.inner.limits;
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        let session = Arc::new(Session {
            id,
            pid,
            command: command.clone(),
            cwd,
            created_at: Utc::now(),
            input_tx,
            pty: Mutex::new(pty),
            size: Mutex::new((rows, cols)),
            stream: Mutex::new(StreamState {
                alive: true,
                output: OutputBuffer::new(limits.output_buffer_bytes),
                inputs: InputHistory::new(limits.input_history),
                matcher: self.inner.engine.new_state(),
            }),
            activity: ActivityTracker::new(),
            attachment: Mutex::new(Attachment {
                attached: true,
                generation: 0,
            }),
            child_exited: AtomicBool::new(false),
        });

        let broker = &self.inner.broker;
        let subscription = {
            let mut sessions = self.inner.sessions.write();
            if let Err(e) = self.check_capacity(sessions.len()) {
                drop(sessions);
                discard_child(child.take());
                return Err(e);
            }
            broker.register(id);
            let subscription = queue.and_then(|q| broker.subscribe(id, q));
            sessions.insert(id, session.clone());
            subscription
        };
        broker.publish(id, Payload::Started { command, pid });
        tracing::info!(session = %id, ?pid, command = %session.command, "session started");

        let (eof_tx, eof_rx) = oneshot::channel::<()>();
        self.spawn_reader(session.clone(), reader, eof_tx);
        spawn_writer(id, writer, input_rx);
        self.spawn_exit_watcher(session, child, eof_rx);

        Ok((id, subscription))
    }

    fn spawn_reader(
        &self,
        session: Arc<Session>,
        mut reader: Box<dyn Read + Send>,
        eof_tx: oneshot::Sender<()>,
    ) {
        let broker = self.inner.broker.clone();
        let engine = self.inner.engine.clone();
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut buf = [0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if !session.ingest_output(&broker, &engine, data) {
                                break;
                            }
                        }
                        // EIO once the slave side closes.
                        Err(_) => break,
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!(session = %session.id, "PTY reader task panicked: {:?}", e);
            }
            let _ = eof_tx.send(());
        });
    }

    fn spawn_exit_watcher(
        &self,
        session: Arc<Session>,
        child: Option<Box<dyn portable_pty::Child + Send + Sync>>,
        eof_rx: oneshot::Receiver<()>,
    ) {
        let (exit_tx, exit_rx) = oneshot::channel::<Option<u32>>();
        match child {
            Some(mut child) => {
                tokio::task::spawn_blocking(move || {
                    let code = match child.wait() {
                        Ok(status) => Some(status.exit_code()),
                        Err(e) => {
                            tracing::error!(?e, "error waiting for session child");
                            None
                        }
                    };
                    let _ = exit_tx.send(code);
                });
            }
            None => {
                let _ = exit_tx.send(None);
            }
        }

        let manager = self.clone();
        let grace = self.inner.limits.exit_drain_grace;
        tokio::spawn(async move {
            let exit_code = exit_rx.await.ok().flatten();
            session.child_exited.store(true, Ordering::Release);
            if tokio::time::timeout(grace, eof_rx).await.is_err() {
                tracing::debug!(session = %session.id, "reader still open after exit grace");
            }
            manager.finish(session.id, EndReason::ProcessExit, exit_code);
        });
    }

    /// Forward raw bytes to the session's input. Unknown or ended sessions
    /// are a logged no-op.
    pub async fn send_input(&self, id: SessionId, data: Bytes) {
        match self.get(id) {
            Some(session) => session.write_input(&self.inner.broker, data).await,
            None => tracing::debug!(session = %id, "input for unknown session ignored"),
        }
    }

    pub fn resize_session(&self, id: SessionId, rows: u16, cols: u16) -> Result<(), SessionError> {
        let session = self.get(id).ok_or(SessionError::UnknownSession(id))?;
        session.resize(rows, cols)?;
        tracing::debug!(session = %id, rows, cols, "session resized");
        Ok(())
    }

    /// Terminate a session: publish `session_ended`, hang up the child and
    /// SIGKILL it if it is still around after the kill grace.
    ///
    /// Returns whether this call ended the session; repeating it is harmless.
    pub fn terminate_session(&self, id: SessionId) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        if !self.finish(id, EndReason::Terminated, None) {
            return false;
        }
        session.send_sighup();
        let grace = self.inner.limits.kill_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            session.kill_child();
        });
        true
    }

    /// Tear a session down. Whoever removes it from the table first does the
    /// work; every later caller gets `false`.
    pub fn finish(&self, id: SessionId, reason: EndReason, exit_code: Option<u32>) -> bool {
        let Some(session) = self.inner.sessions.write().remove(&id) else {
            return false;
        };
        {
            let mut stream = session.stream.lock();
            // Matches still waiting on more output are complete now.
            let held = self.inner.engine.flush(&mut stream.matcher, id);
            session.publish_detections(&self.inner.broker, held);
            stream.alive = false;
            self.inner
                .broker
                .close(id, Payload::Ended { reason, exit_code });
        }
        tracing::info!(session = %id, ?reason, ?exit_code, "session ended");
        true
    }

    /// Release a session from the client that held it. It keeps running and
    /// any client may [`attach_session`](Self::attach_session) to it until
    /// the detached TTL runs out.
    pub fn detach_session(&self, id: SessionId) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        let generation = {
            let mut attachment = session.attachment.lock();
            attachment.attached = false;
            attachment.generation += 1;
            attachment.generation
        };
        tracing::info!(session = %id, "session detached");

        if let Some(ttl) = self.inner.limits.detached_ttl {
            let manager = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                let attachment = session.attachment.lock();
                if !attachment.attached
                    && attachment.generation == generation
                    && manager.terminate_session(id)
                {
                    tracing::info!(session = %id, "detached session expired");
                }
            });
        }
        true
    }

    /// Take over a detached session and subscribe `queue` to its events.
    /// Sessions held by another client are reported as unknown.
    pub fn attach_session(
        &self,
        id: SessionId,
        queue: SubscriberQueue,
    ) -> Result<Subscription, SessionError> {
        let session = self.get(id).ok_or(SessionError::UnknownSession(id))?;
        {
            let mut attachment = session.attachment.lock();
            if attachment.attached {
                return Err(SessionError::UnknownSession(id));
            }
            attachment.attached = true;
        }
        let subscription = self
            .inner
            .broker
            .subscribe(id, queue)
            .ok_or(SessionError::UnknownSession(id))?;
        tracing::info!(session = %id, "session attached");
        Ok(subscription)
    }

    /// End every session and refuse new ones.
    ///
    /// Returns the SIGKILL escalation task if any session was drained, so the
    /// caller can await it.
    pub fn drain(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.inner.accepting.store(false, Ordering::Release);
        let drained: Vec<Arc<Session>> = self.inner.sessions.read().values().cloned().collect();
        let ended: Vec<Arc<Session>> = drained
            .into_iter()
            .filter(|s| self.finish(s.id, EndReason::Shutdown, None))
            .collect();
        if ended.is_empty() {
            return None;
        }
        tracing::info!(count = ended.len(), "draining sessions");
        for session in &ended {
            session.send_sighup();
        }
        let grace = self.inner.limits.kill_grace;
        Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for session in &ended {
                session.kill_child();
            }
        }))
    }
}

/// Kill a child that will never get a session and reap it off the runtime.
fn discard_child(
    child: Option<Box<dyn portable_pty::Child + Send + Sync>>,
) -> Option<tokio::task::JoinHandle<()>> {
    let mut child = child?;
    let _ = child.kill();
    Some(tokio::task::spawn_blocking(move || {
        let _ = child.wait();
    }))
}

fn spawn_writer(
    id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Bytes>,
) {
    // Exits when every Session handle (and so the sender) is gone, or when
    // the pty stops accepting writes after the child dies.
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        }));
        if let Err(e) = result {
            tracing::error!(session = %id, "PTY writer task panicked: {:?}", e);
        }
    });
}
