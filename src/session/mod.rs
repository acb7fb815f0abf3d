//! Automation session ownership.
//!
//! Exactly one live [`AutomationSession`] exists at a time, owned by the
//! [`SessionManager`]. Callers get a [`SessionLease`], an exclusive guard held
//! for a whole pipeline run, so session steps from different jobs can never
//! interleave. Dropping the lease records the activity time; sessions idle
//! longer than the configured timeout are rebuilt on the next acquire or torn
//! down by the idle reaper.

pub mod script;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::SessionError;
use crate::jobs::model::JobInput;
use crate::jobs::strategy::{
    Candidate, ExtractionStrategy, RemoteTaskId, RemoteTaskStatus, StrategyOutcome,
};

pub use script::{ScriptSession, ScriptSessionFactory};

/// The expensive, stateful automation handle ("one logged-in browser").
#[async_trait]
pub trait AutomationSession: Send + Sync {
    /// Whether login has completed during this session's lifetime.
    fn is_authenticated(&self) -> bool;

    /// Log in. Called at most once per session lifetime by the manager.
    async fn authenticate(&mut self) -> Result<(), SessionError>;

    /// Look up candidates for the job's target.
    async fn search(&mut self, input: &JobInput) -> Result<Vec<Candidate>, SessionError>;

    /// Run one extraction strategy against a resolved candidate.
    async fn extract(
        &mut self,
        strategy: ExtractionStrategy,
        candidate: &Candidate,
    ) -> Result<StrategyOutcome, SessionError>;

    /// Status of a remote task started by `extract`.
    async fn task_status(&self, task: &RemoteTaskId) -> Result<RemoteTaskStatus, SessionError>;

    /// Release everything the session holds. Must not fail.
    async fn shutdown(&mut self);
}

/// Builds fresh sessions. Each call starts from a clean authentication state.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn AutomationSession>, SessionError>;
}

/// Point-in-time view of the session, readable while a job holds the lease.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub has_session: bool,
    pub session_ready: bool,
    pub constructions: u64,
    pub busy: bool,
}

/// Result of a close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseOutcome {
    /// The session was torn down now.
    Closed,
    /// No session was live.
    NoSession,
    /// A job holds the session; it is torn down as soon as the lease returns.
    Deferred,
}

struct SessionSlot {
    session: Option<Box<dyn AutomationSession>>,
    last_activity: Option<Instant>,
}

struct Shared {
    factory: Arc<dyn SessionFactory>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    has_session: AtomicBool,
    session_ready: AtomicBool,
    close_pending: AtomicBool,
    constructions: AtomicU64,
}

impl Shared {
    async fn construct(&self, slot: &mut SessionSlot) -> Result<(), SessionError> {
        info!("Constructing automation session");
        let session = self.factory.create().await?;
        self.constructions.fetch_add(1, Ordering::SeqCst);
        self.has_session.store(true, Ordering::SeqCst);
        self.session_ready
            .store(session.is_authenticated(), Ordering::SeqCst);
        slot.session = Some(session);
        slot.last_activity = Some(self.clock.now());
        Ok(())
    }

    async fn teardown(&self, slot: &mut SessionSlot, reason: &str) {
        if let Some(mut session) = slot.session.take() {
            info!(reason, "Tearing down automation session");
            session.shutdown().await;
        }
        slot.last_activity = None;
        self.has_session.store(false, Ordering::SeqCst);
        self.session_ready.store(false, Ordering::SeqCst);
    }

    fn is_idle(&self, slot: &SessionSlot) -> bool {
        slot.last_activity
            .is_some_and(|at| self.clock.now().saturating_duration_since(at) >= self.idle_timeout)
    }
}

/// Sole owner of the session lifecycle.
pub struct SessionManager {
    shared: Arc<Shared>,
    slot: Arc<Mutex<SessionSlot>>,
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        clock: Arc<dyn Clock>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                clock,
                idle_timeout,
                has_session: AtomicBool::new(false),
                session_ready: AtomicBool::new(false),
                close_pending: AtomicBool::new(false),
                constructions: AtomicU64::new(0),
            }),
            slot: Arc::new(Mutex::new(SessionSlot {
                session: None,
                last_activity: None,
            })),
        }
    }

    /// Wait for exclusive use of the session, rebuilding it if it went idle.
    pub async fn acquire(&self) -> Result<SessionLease, SessionError> {
        let mut guard = Arc::clone(&self.slot).lock_owned().await;

        if self.shared.close_pending.swap(false, Ordering::SeqCst) {
            self.shared.teardown(&mut guard, "close requested").await;
        } else if guard.session.is_some() && self.shared.is_idle(&guard) {
            self.shared.teardown(&mut guard, "idle timeout").await;
        }

        if guard.session.is_none() {
            self.shared.construct(&mut guard).await?;
        } else {
            debug!("Reusing live automation session");
        }

        Ok(SessionLease {
            guard,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Tear the session down now, or as soon as the current lease returns.
    pub async fn close(&self) -> CloseOutcome {
        match Arc::clone(&self.slot).try_lock_owned() {
            Ok(mut guard) => {
                self.shared.close_pending.store(false, Ordering::SeqCst);
                if guard.session.is_none() {
                    return CloseOutcome::NoSession;
                }
                self.shared.teardown(&mut guard, "close requested").await;
                CloseOutcome::Closed
            }
            Err(_) => {
                warn!("Session busy, close deferred until the running job releases it");
                self.shared.close_pending.store(true, Ordering::SeqCst);
                CloseOutcome::Deferred
            }
        }
    }

    /// Close for process exit: wait up to `grace` for the running job to
    /// release its lease, then tear the session down.
    pub async fn shutdown(&self, grace: Duration) -> CloseOutcome {
        match tokio::time::timeout(grace, Arc::clone(&self.slot).lock_owned()).await {
            Ok(mut guard) => {
                self.shared.close_pending.store(false, Ordering::SeqCst);
                if guard.session.is_none() {
                    return CloseOutcome::NoSession;
                }
                self.shared.teardown(&mut guard, "shutdown").await;
                CloseOutcome::Closed
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Session still leased at shutdown, leaving it behind");
                self.shared.close_pending.store(true, Ordering::SeqCst);
                CloseOutcome::Deferred
            }
        }
    }

    /// Tear down an idle (or close-pending) session if nobody holds it.
    /// Returns true when a session was torn down.
    pub async fn reap_idle(&self) -> bool {
        let Ok(mut guard) = Arc::clone(&self.slot).try_lock_owned() else {
            return false;
        };
        if guard.session.is_none() {
            return false;
        }
        let close_pending = self.shared.close_pending.swap(false, Ordering::SeqCst);
        if close_pending || self.shared.is_idle(&guard) {
            let reason = if close_pending {
                "close requested"
            } else {
                "idle timeout"
            };
            self.shared.teardown(&mut guard, reason).await;
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            has_session: self.shared.has_session.load(Ordering::SeqCst),
            session_ready: self.shared.session_ready.load(Ordering::SeqCst),
            constructions: self.shared.constructions.load(Ordering::SeqCst),
            busy: self.slot.try_lock().is_err(),
        }
    }

    /// Number of sessions built so far.
    pub fn constructions(&self) -> u64 {
        self.shared.constructions.load(Ordering::SeqCst)
    }
}

/// Exclusive use of the live session. Dropping it releases the session.
pub struct SessionLease {
    guard: OwnedMutexGuard<SessionSlot>,
    shared: Arc<Shared>,
}

impl SessionLease {
    /// The leased session.
    pub fn session(&mut self) -> Result<&mut (dyn AutomationSession + 'static), SessionError> {
        self.guard
            .session
            .as_deref_mut()
            .ok_or_else(|| SessionError::Lost("session was torn down".to_string()))
    }

    /// Log in unless this session lifetime already did.
    pub async fn ensure_authenticated(&mut self) -> Result<bool, SessionError> {
        let session = self.session()?;
        if session.is_authenticated() {
            return Ok(false);
        }
        session.authenticate().await?;
        self.shared.session_ready.store(true, Ordering::SeqCst);
        info!("Automation session authenticated");
        Ok(true)
    }

    /// Replace a broken session with a fresh one (not yet authenticated).
    pub async fn recycle(&mut self) -> Result<(), SessionError> {
        self.shared.teardown(&mut self.guard, "session lost").await;
        self.shared.construct(&mut self.guard).await
    }

    /// Tear down the session while holding the lease.
    pub async fn close(&mut self) {
        self.shared.teardown(&mut self.guard, "unrecoverable session error").await;
    }

    /// Explicit release; same as dropping the lease.
    pub fn release(self) {}
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.guard.session.is_some() {
            self.guard.last_activity = Some(self.shared.clock.now());
        }
    }
}

/// Spawn a background task that tears down idle sessions.
pub fn spawn_idle_reaper(manager: Arc<SessionManager>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if manager.reap_idle().await {
                debug!("Idle reaper closed the automation session");
            }
        }
    })
}
