//! Per-thread sessions and the registry that owns them.
//!
//! Lock granularity: the registry map sits behind one `RwLock`, each
//! `Session` keeps its mutable fields behind its own `Mutex`. Lookups never
//! wait on a busy session, and sessions never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::chat::MessageHandle;
use crate::domain::repository::Repository;
use crate::errors::TransitionError;

/// What the code generator is asked to do with an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Implementation,
    Review,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implementation => "implementation",
            Self::Review => "review",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a busy session answers a new instruction. Neither policy queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    Sync,
    #[default]
    Async,
}

impl ExecutionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

impl std::fmt::Display for ExecutionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a session.
///
/// `Idle -> Running` on admission, `Running -> Idle` when the Run finishes,
/// and any state moves to `Ended` on the end command. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Ended => "ended",
        }
    }

    fn transition(self, to: SessionState) -> Result<SessionState, TransitionError> {
        match (self, to) {
            (Self::Idle, Self::Running)
            | (Self::Running, Self::Idle)
            | (Self::Idle, Self::Ended)
            | (Self::Running, Self::Ended) => Ok(to),
            (from, to) => Err(TransitionError::Invalid { from, to }),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instruction could not start a Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A Run is already in flight; the policy decides the wording.
    Busy(ExecutionPolicy),
    Ended,
}

#[derive(Debug)]
struct SessionFields {
    mode: Mode,
    policy: ExecutionPolicy,
    state: SessionState,
    repository: Arc<Repository>,
    resume_token: Option<String>,
    status_handle: Option<MessageHandle>,
    cancel: Option<CancellationToken>,
}

/// One conversation thread's task context.
#[derive(Debug)]
pub struct Session {
    thread: String,
    channel: String,
    fields: Mutex<SessionFields>,
}

impl Session {
    pub fn new(thread: &str, channel: &str, repository: Arc<Repository>) -> Self {
        Self {
            thread: thread.to_string(),
            channel: channel.to_string(),
            fields: Mutex::new(SessionFields {
                mode: Mode::default(),
                policy: ExecutionPolicy::default(),
                state: SessionState::Idle,
                repository,
                resume_token: None,
                status_handle: None,
                cancel: None,
            }),
        }
    }

    pub fn thread(&self) -> &str {
        &self.thread
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn lock(&self) -> MutexGuard<'_, SessionFields> {
        // Fields stay consistent under poisoning: every write is a single assignment.
        self.fields.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    pub fn set_mode(&self, mode: Mode) {
        self.lock().mode = mode;
    }

    pub fn policy(&self) -> ExecutionPolicy {
        self.lock().policy
    }

    pub fn set_policy(&self, policy: ExecutionPolicy) {
        self.lock().policy = policy;
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() != SessionState::Ended
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn repository(&self) -> Arc<Repository> {
        Arc::clone(&self.lock().repository)
    }

    pub fn set_repository(&self, repository: Arc<Repository>) {
        self.lock().repository = repository;
    }

    pub fn resume_token(&self) -> Option<String> {
        self.lock().resume_token.clone()
    }

    pub fn set_resume_token(&self, token: Option<String>) {
        self.lock().resume_token = token;
    }

    pub fn status_handle(&self) -> Option<MessageHandle> {
        self.lock().status_handle.clone()
    }

    pub fn set_status_handle(&self, handle: Option<MessageHandle>) {
        self.lock().status_handle = handle;
    }

    /// Atomically move `Idle -> Running` and install a fresh cancellation token.
    ///
    /// The returned guard moves the session back to `Idle` when dropped, so
    /// every exit path of a Run clears the running state.
    pub fn try_begin_run(self: &Arc<Self>) -> Result<RunTicket, Rejection> {
        let mut fields = self.lock();
        match fields.state {
            SessionState::Running => return Err(Rejection::Busy(fields.policy)),
            SessionState::Ended => return Err(Rejection::Ended),
            SessionState::Idle => {}
        }
        fields.state = SessionState::Running;
        let cancel = CancellationToken::new();
        fields.cancel = Some(cancel.clone());
        Ok(RunTicket {
            guard: RunGuard {
                session: Arc::clone(self),
                finished: false,
            },
            cancel,
            mode: fields.mode,
            resume_token: fields.resume_token.clone(),
            repository: Arc::clone(&fields.repository),
        })
    }

    /// `Running -> Idle`. Stores the resume token when the Run produced one.
    pub fn finish_run(&self, resume_token: Option<String>) -> Result<(), TransitionError> {
        let mut fields = self.lock();
        fields.state = fields.state.transition(SessionState::Idle)?;
        fields.cancel = None;
        if resume_token.is_some() {
            fields.resume_token = resume_token;
        }
        Ok(())
    }

    /// Move to `Ended` and cancel any in-flight Run. Returns whether a Run
    /// was cancelled.
    pub fn end(&self) -> Result<bool, TransitionError> {
        let mut fields = self.lock();
        fields.state = fields.state.transition(SessionState::Ended)?;
        match fields.cancel.take() {
            Some(cancel) => {
                cancel.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Admission to run: the guard, the cancellation token for the Run, and a
/// snapshot of the session fields the Run starts with.
#[derive(Debug)]
pub struct RunTicket {
    pub guard: RunGuard,
    pub cancel: CancellationToken,
    pub mode: Mode,
    pub resume_token: Option<String>,
    pub repository: Arc<Repository>,
}

/// Clears the session's running state on drop.
#[derive(Debug)]
pub struct RunGuard {
    session: Arc<Session>,
    finished: bool,
}

impl RunGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Finish the Run, keeping `resume_token` for the next one.
    pub fn complete(mut self, resume_token: Option<String>) {
        self.release(resume_token);
    }

    fn release(&mut self, resume_token: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.session.finish_run(resume_token) {
            // An ended session stays ended.
            tracing::debug!(thread = %self.session.thread(), error = %e, "run finished on inactive session");
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.release(None);
    }
}

/// Outcome of a registry lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    Active(Arc<Session>),
    /// The thread had a session that was ended.
    Ended,
    Absent,
}

/// How long an ended thread stays ignored.
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default)]
struct RegistryMap {
    sessions: HashMap<String, Arc<Session>>,
    /// Ended thread keys and when they ended.
    ended: HashMap<String, Instant>,
}

impl RegistryMap {
    fn is_ended(&self, thread: &str, ttl: Duration) -> bool {
        self.ended
            .get(thread)
            .is_some_and(|ended_at| ended_at.elapsed() < ttl)
    }
}

/// Thread key → session map. Constructed once and shared by `Arc`.
#[derive(Debug)]
pub struct SessionRegistry {
    inner: RwLock<RegistryMap>,
    tombstone_ttl: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_tombstone_ttl(DEFAULT_TOMBSTONE_TTL)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ended threads are forgotten after `ttl`; a later message then starts
    /// a new session.
    pub fn with_tombstone_ttl(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryMap::default()),
            tombstone_ttl: ttl,
        }
    }

    pub fn resolve(&self, thread: &str) -> Option<Arc<Session>> {
        let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
        map.sessions.get(thread).cloned()
    }

    /// Like `resolve`, but distinguishes ended threads from unknown ones.
    pub fn lookup(&self, thread: &str) -> Lookup {
        let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
        if let Some(session) = map.sessions.get(thread) {
            return Lookup::Active(Arc::clone(session));
        }
        if map.is_ended(thread, self.tombstone_ttl) {
            Lookup::Ended
        } else {
            Lookup::Absent
        }
    }

    /// Create the session for `thread`, or return the one a concurrent
    /// caller created first. The flag is `true` when this call created it.
    ///
    /// Returns `None` if the thread was ended.
    pub fn create(
        &self,
        thread: &str,
        channel: &str,
        repository: Arc<Repository>,
    ) -> Option<(Arc<Session>, bool)> {
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if map.is_ended(thread, self.tombstone_ttl) {
            return None;
        }
        if let Some(existing) = map.sessions.get(thread) {
            return Some((Arc::clone(existing), false));
        }
        let session = Arc::new(Session::new(thread, channel, repository));
        map.sessions.insert(thread.to_string(), Arc::clone(&session));
        Some((session, true))
    }

    /// Remove the session for `thread` and remember the thread as ended.
    /// Expired tombstones are pruned on the way.
    pub fn remove(&self, thread: &str) -> Option<Arc<Session>> {
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let ttl = self.tombstone_ttl;
        map.ended.retain(|_, ended_at| ended_at.elapsed() < ttl);
        map.ended.insert(thread.to_string(), Instant::now());
        map.sessions.remove(thread)
    }

    /// Ended threads still remembered.
    pub fn tombstones(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .ended
            .len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .sessions
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
