//! # Audio Session Management
//!
//! One session per client connection. A session owns exactly one capture
//! process, one playback process, the two relays between them and the client,
//! and the diagnostic observers of both processes.
//!
//! ## Session Lifecycle:
//! 1. **Starting**: processes spawned, relays launching
//! 2. **Active**: both relays running, registered for message routing
//! 3. **Closing**: removed from the registry, processes being killed
//! 4. **Closed**: processes reaped, all tasks finished
//!
//! States only move forward. A session leaves the registry at the moment it
//! enters Closing, so no inbound message is routed to a session that is
//! tearing down.
//!
//! ## Ownership:
//! Each session runs a supervisor task that owns its resources. Teardown is
//! requested either from outside (`on_disconnect`, `shutdown_all`) by
//! cancelling the session token, or from inside when a relay fails or a
//! process dies unexpectedly. Both paths converge on the same teardown, which
//! runs once.

use crate::audio::capture::CaptureRelay;
use crate::audio::diagnostics;
use crate::audio::format::PcmFormat;
use crate::audio::playback::{InboundMessage, InboundPolicy, PlaybackRelay};
use crate::audio::process::{PcmProcessHandle, ProcessExit, ProcessRole, ProcessSpawner};
use crate::audio::transport::FrameSink;
use crate::audio::RelaySummary;
use crate::config::AppConfig;
use crate::error::BridgeError;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Opaque identifier of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Move `state` forward to `next`; earlier states are ignored.
fn advance(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    state.send_if_modified(|current| {
        if next > *current {
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Live traffic counters of one session, shared with its relays.
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_out: AtomicU64,
    bytes_out: AtomicU64,
    frames_dropped: AtomicU64,
    messages_in: AtomicU64,
    bytes_in: AtomicU64,
    messages_rejected: AtomicU64,
    messages_dropped: AtomicU64,
}

impl SessionStats {
    pub fn record_forwarded(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self, bytes: usize) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an inbound message dropped on a full queue; returns the new total.
    pub fn record_inbound_dropped(&self) -> u64 {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_out: u64,
    pub bytes_out: u64,
    pub frames_dropped: u64,
    pub messages_in: u64,
    pub bytes_in: u64,
    pub messages_rejected: u64,
    /// Inbound messages dropped because the playback queue was full.
    pub messages_dropped: u64,
}

impl std::ops::AddAssign for StatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.frames_out += other.frames_out;
        self.bytes_out += other.bytes_out;
        self.frames_dropped += other.frames_dropped;
        self.messages_in += other.messages_in;
        self.bytes_in += other.bytes_in;
        self.messages_rejected += other.messages_rejected;
        self.messages_dropped += other.messages_dropped;
    }
}

/// Reports sent to a session supervisor by the tasks it owns.
#[derive(Debug)]
pub enum SessionEvent {
    RelayFinished {
        role: ProcessRole,
        result: Result<RelaySummary, BridgeError>,
    },
    ProcessExited {
        role: ProcessRole,
        exit: ProcessExit,
    },
}

#[derive(Debug)]
enum CloseReason {
    Disconnected,
    RelayFailed { role: ProcessRole, error: BridgeError },
    ProcessExited { role: ProcessRole, exit: ProcessExit },
}

impl CloseReason {
    /// The capture process died; its pipe may still hold output.
    fn is_capture_exit(&self) -> bool {
        matches!(
            self,
            CloseReason::ProcessExited {
                role: ProcessRole::Capture,
                ..
            }
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Disconnected => f.write_str("transport closed"),
            CloseReason::RelayFailed { role, error } => write!(f, "{} relay failed: {}", role, error),
            CloseReason::ProcessExited { role, exit } => {
                write!(f, "{} process exited with {}", role, exit)
            }
        }
    }
}

/// Settings the session manager needs from the application config.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub capture_target: String,
    pub playback_target: String,
    pub read_chunk_bytes: usize,
    pub max_message_bytes: usize,
    pub inbound_queue_messages: usize,
    pub max_concurrent_sessions: usize,
    pub teardown_grace: Duration,
}

impl SessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            capture_target: config.devices.capture_target.clone(),
            playback_target: config.devices.playback_target.clone(),
            read_chunk_bytes: config.audio.read_chunk_bytes,
            max_message_bytes: config.audio.max_message_bytes,
            inbound_queue_messages: config.audio.inbound_queue_messages,
            max_concurrent_sessions: config.performance.max_concurrent_sessions,
            teardown_grace: Duration::from_millis(config.performance.teardown_grace_ms),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

/// Caller's view of a session returned by [`SessionManager::on_connect`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    state: watch::Receiver<SessionState>,
    stats: Arc<SessionStats>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolve once the session has fully closed.
    pub async fn wait_closed(&mut self) {
        let _ = self.state.wait_for(|state| *state == SessionState::Closed).await;
    }
}

/// Registry record of one session.
struct SessionEntry {
    inbound: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
    stats: Arc<SessionStats>,
    supervisor: JoinHandle<()>,
    opened_at: DateTime<Utc>,
}

type Registry = Arc<Mutex<HashMap<SessionId, SessionEntry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove a session from routing and mark it Closing, atomically.
fn unregister(registry: &Registry, id: SessionId) -> Option<SessionEntry> {
    let mut sessions = lock(registry);
    let entry = sessions.remove(&id)?;
    advance(&entry.state, SessionState::Closing);
    Some(entry)
}

/// Per-session listing for the health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub totals: StatsSnapshot,
    pub sessions: Vec<SessionInfo>,
}

/// Creates sessions on connect, routes inbound messages, tears sessions down.
///
/// ## Thread Safety:
/// The registry sits behind a `Mutex` that is only held for map operations,
/// never across an `.await`. Routing a message clones the session's channel
/// sender under the lock and sends after releasing it.
pub struct SessionManager {
    registry: Registry,
    spawner: Arc<dyn ProcessSpawner>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            spawner,
            config,
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Start a session for a newly opened connection.
    ///
    /// ## Steps:
    /// 1. Spawn the capture process, then the playback process
    /// 2. Launch both relays and the diagnostic observers
    /// 3. Register the session and hand ownership to its supervisor
    ///
    /// If the playback process cannot be spawned, the capture process is
    /// killed before the error is returned. Nothing is registered on failure.
    pub fn on_connect(&self, transport: Arc<dyn FrameSink>) -> Result<SessionHandle, BridgeError> {
        let limit = self.config.max_concurrent_sessions;
        if self.active_count() >= limit {
            warn!(limit, "Rejecting connection, session limit reached");
            return Err(BridgeError::SessionLimitReached(limit));
        }

        let id = SessionId::new();
        let (mut capture, mut playback) = self.spawn_processes(id)?;
        let output = capture.output().ok_or_else(|| missing_pipe(&capture))?;
        let input = playback.input().ok_or_else(|| missing_pipe(&playback))?;

        let stats = Arc::new(SessionStats::default());
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_queue_messages.max(1));
        let mut tasks = SessionTasks::new(id);

        let capture_relay = CaptureRelay::new(
            id,
            output,
            transport.clone(),
            self.config.read_chunk_bytes,
            stats.clone(),
            cancel.clone(),
        );
        tasks.spawn(
            "capture-relay",
            report(ProcessRole::Capture, capture_relay.run(), events_tx.clone()),
        );

        let playback_relay = PlaybackRelay::new(
            id,
            inbound_rx,
            input,
            InboundPolicy::new(self.config.max_message_bytes),
            stats.clone(),
            cancel.clone(),
        );
        tasks.spawn(
            "playback-relay",
            report(ProcessRole::Playback, playback_relay.run(), events_tx.clone()),
        );

        for handle in [&mut capture, &mut playback] {
            let role = handle.role();
            let program = handle.program().to_string();
            if let Some(lines) = handle.diagnostics() {
                tasks.spawn("stderr", diagnostics::log_stderr(id, role, program.clone(), lines));
            }
            if let Some(exited) = handle.exited() {
                tasks.spawn(
                    "exit-watch",
                    diagnostics::watch_exit(id, role, program, exited, events_tx.clone()),
                );
            }
        }
        drop(events_tx);

        let (capture_pid, playback_pid) = (capture.pid(), playback.pid());
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let state = Arc::new(state_tx);
        let handle = SessionHandle {
            id,
            state: state_rx,
            stats: stats.clone(),
        };
        let session = Session {
            id,
            transport,
            capture,
            playback,
            tasks,
            state: state.clone(),
            stats: stats.clone(),
            cancel: cancel.clone(),
            teardown_grace: self.config.teardown_grace,
            opened_at: std::time::Instant::now(),
        };

        let mut sessions = lock(&self.registry);
        if sessions.len() >= limit {
            drop(sessions);
            warn!(session = %id, limit, "Session limit reached during startup");
            session.abandon();
            return Err(BridgeError::SessionLimitReached(limit));
        }
        advance(&state, SessionState::Active);
        let supervisor = tokio::spawn(supervise(session, events_rx, self.registry.clone()));
        sessions.insert(
            id,
            SessionEntry {
                inbound: inbound_tx,
                cancel,
                state,
                stats,
                supervisor,
                opened_at: Utc::now(),
            },
        );
        let active = sessions.len();
        drop(sessions);

        info!(
            session = %id,
            active,
            capture_pid = ?capture_pid,
            playback_pid = ?playback_pid,
            "Session active"
        );
        Ok(handle)
    }

    fn spawn_processes(
        &self,
        id: SessionId,
    ) -> Result<(PcmProcessHandle, PcmProcessHandle), BridgeError> {
        let capture = self
            .spawner
            .spawn(ProcessRole::Capture, &self.config.capture_target, PcmFormat::BRIDGE)
            .map_err(|err| {
                error!(session = %id, error = %err, "Failed to start capture process");
                err
            })?;

        match self
            .spawner
            .spawn(ProcessRole::Playback, &self.config.playback_target, PcmFormat::BRIDGE)
        {
            Ok(playback) => Ok((capture, playback)),
            Err(err) => {
                error!(session = %id, error = %err, "Failed to start playback process, killing capture");
                capture.kill();
                Err(err)
            }
        }
    }

    /// Queue one inbound message for its session's playback relay.
    ///
    /// Never waits. Returns `false` when the message was dropped: the session
    /// is unknown or closing, or its inbound queue is full because the
    /// playback process is not keeping up.
    pub fn on_message(&self, id: SessionId, message: InboundMessage) -> bool {
        let sessions = lock(&self.registry);
        let Some(entry) = sessions.get(&id) else {
            debug!(session = %id, bytes = message.len(), "Dropping message for inactive session");
            return false;
        };

        match entry.inbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                let dropped = entry.stats.record_inbound_dropped();
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(
                        session = %id,
                        bytes = message.len(),
                        dropped,
                        "Playback queue full, dropping inbound message"
                    );
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = %id, "Playback relay gone, message dropped");
                false
            }
        }
    }

    /// Tear down a session and wait until it is Closed.
    ///
    /// Returns `false` if the session was unknown or another caller already
    /// started its teardown.
    pub async fn on_disconnect(&self, id: SessionId) -> bool {
        let Some(entry) = unregister(&self.registry, id) else {
            debug!(session = %id, "Disconnect for inactive session ignored");
            return false;
        };

        entry.cancel.cancel();
        match entry.supervisor.await {
            Ok(()) => {}
            // The runtime owning the supervisor already shut down and dropped it.
            Err(err) if err.is_cancelled() => {
                debug!(session = %id, "Session supervisor ended with its runtime");
            }
            Err(err) => error!(session = %id, error = %err, "Session supervisor failed"),
        }
        true
    }

    /// Tear down every registered session. Returns how many were closed.
    pub async fn shutdown_all(&self) -> usize {
        let ids: Vec<SessionId> = lock(&self.registry).keys().copied().collect();
        if ids.is_empty() {
            return 0;
        }

        info!(sessions = ids.len(), "Closing all sessions");
        join_all(ids.into_iter().map(|id| self.on_disconnect(id)))
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count()
    }

    pub fn summary(&self) -> SessionSummary {
        let sessions = lock(&self.registry);
        let mut totals = StatsSnapshot::default();
        let mut listing: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| {
                let stats = entry.stats.snapshot();
                totals += stats;
                SessionInfo {
                    id: *id,
                    state: *entry.state.borrow(),
                    opened_at: entry.opened_at,
                    stats,
                }
            })
            .collect();
        listing.sort_by_key(|info| info.opened_at);

        SessionSummary {
            active_sessions: listing.len(),
            max_sessions: self.config.max_concurrent_sessions,
            totals,
            sessions: listing,
        }
    }
}

fn missing_pipe(handle: &PcmProcessHandle) -> BridgeError {
    BridgeError::SpawnFailed {
        program: handle.program().to_string(),
        source: io::Error::other(format!("{} pipe not available", handle.role())),
    }
}

/// Run a relay and report its result to the supervisor.
async fn report<F>(role: ProcessRole, relay: F, events: mpsc::UnboundedSender<SessionEvent>)
where
    F: Future<Output = Result<RelaySummary, BridgeError>>,
{
    let result = relay.await;
    let _ = events.send(SessionEvent::RelayFinished { role, result });
}

/// Background tasks belonging to one session.
struct SessionTasks {
    session: SessionId,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl SessionTasks {
    fn new(session: SessionId) -> Self {
        Self {
            session,
            handles: Vec::new(),
        }
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push((name, tokio::spawn(task)));
    }

    /// Wait for every task, aborting those still running at the deadline.
    async fn join(&mut self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        for (name, mut handle) in std::mem::take(&mut self.handles) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_panic() => {
                    error!(session = %self.session, task = name, "Session task panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(session = %self.session, task = name, "Session task outlived teardown grace, aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
    }
}

impl Drop for SessionTasks {
    fn drop(&mut self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }
}

/// Resources of one session, owned by its supervisor task.
struct Session {
    id: SessionId,
    transport: Arc<dyn FrameSink>,
    capture: PcmProcessHandle,
    playback: PcmProcessHandle,
    tasks: SessionTasks,
    state: Arc<watch::Sender<SessionState>>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
    teardown_grace: Duration,
    opened_at: std::time::Instant,
}

impl Session {
    /// Decide whether an event ends the session.
    fn observe(&self, event: SessionEvent) -> Option<CloseReason> {
        match event {
            SessionEvent::RelayFinished { role, result: Ok(summary) } => {
                info!(
                    session = %self.id,
                    role = %role,
                    messages = summary.messages,
                    bytes = summary.bytes,
                    dropped = summary.dropped,
                    "Relay finished"
                );
                None
            }
            SessionEvent::RelayFinished { role, result: Err(error) } => {
                if error.is_session_fatal() {
                    Some(CloseReason::RelayFailed { role, error })
                } else {
                    warn!(session = %self.id, role = %role, error = %error, "Relay stopped");
                    None
                }
            }
            SessionEvent::ProcessExited { role, exit } if exit.is_unexpected() => {
                Some(CloseReason::ProcessExited { role, exit })
            }
            SessionEvent::ProcessExited { .. } => None,
        }
    }

    /// Release everything without running a supervisor.
    fn abandon(self) {
        self.cancel.cancel();
        self.capture.kill();
        self.playback.kill();
        advance(&self.state, SessionState::Closed);
    }

    async fn teardown(mut self, reason: CloseReason) {
        advance(&self.state, SessionState::Closing);
        self.cancel.cancel();
        match &reason {
            CloseReason::Disconnected => info!(session = %self.id, reason = %reason, "Closing session"),
            _ => warn!(session = %self.id, reason = %reason, "Closing session"),
        }

        self.capture.kill();
        self.playback.kill();
        self.capture.terminate().await;
        self.playback.terminate().await;
        self.transport.close();
        self.tasks.join(self.teardown_grace).await;

        advance(&self.state, SessionState::Closed);
        let stats = self.stats.snapshot();
        info!(
            session = %self.id,
            duration_ms = self.opened_at.elapsed().as_millis() as u64,
            frames_out = stats.frames_out,
            frames_dropped = stats.frames_dropped,
            messages_in = stats.messages_in,
            messages_rejected = stats.messages_rejected,
            messages_dropped = stats.messages_dropped,
            "Session closed"
        );
    }
}

/// Owns a session from activation to Closed.
async fn supervise(
    session: Session,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    registry: Registry,
) {
    let mut capture_finished = false;
    let reason = loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break CloseReason::Disconnected,
            Some(event) = events.recv() => {
                if matches!(event, SessionEvent::RelayFinished { role: ProcessRole::Capture, .. }) {
                    capture_finished = true;
                }
                if let Some(reason) = session.observe(event) {
                    break reason;
                }
            }
        }
    };

    if !matches!(reason, CloseReason::Disconnected) {
        // Server-side close: stop routing before the transport learns about it.
        unregister(&registry, session.id);
        if reason.is_capture_exit() && !capture_finished {
            drain_capture(session.id, &session.cancel, session.teardown_grace, &mut events).await;
        }
    }
    session.teardown(reason).await;
}

/// Let the capture relay forward what the exited process left in its pipe.
///
/// Ends when the relay reports, the session is cancelled, or `grace` runs out.
async fn drain_capture(
    id: SessionId,
    cancel: &CancellationToken,
    grace: Duration,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
) {
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = &mut deadline => {
                warn!(session = %id, "Capture output not drained within teardown grace");
                return;
            }
            event = events.recv() => match event {
                Some(SessionEvent::RelayFinished { role: ProcessRole::Capture, result }) => {
                    match result {
                        Ok(summary) => debug!(
                            session = %id,
                            chunks = summary.messages,
                            dropped = summary.dropped,
                            "Capture output drained"
                        ),
                        Err(err) => warn!(session = %id, error = %err, "Capture drain failed"),
                    }
                    return;
                }
                Some(_) => {}
                None => return,
            },
        }
    }
}
