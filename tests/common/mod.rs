//! Scripted automation session and engine wiring shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use bevakning::clock::{Clock, ManualClock};
use bevakning::config::EngineConfig;
use bevakning::error::SessionError;
use bevakning::jobs::strategy::{RemoteTaskId, RemoteTaskStatus, StrategyOutcome};
use bevakning::jobs::{BirthYearRule, Candidate, ExtractionStrategy, JobEngine, JobInput, JobRegistry};
use bevakning::session::{AutomationSession, SessionFactory, SessionManager};
use bevakning::store::{JobStore, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What the scripted session answers, shared by every session the factory builds.
#[derive(Default)]
pub struct Script {
    pub candidates: Vec<Candidate>,
    pub outcomes: Vec<(ExtractionStrategy, StrategyOutcome)>,
    /// Real-time delay inside every step, to widen interleaving windows.
    pub step_delay: Duration,
    /// When set, `search` waits for a permit before answering.
    pub search_gate: Option<Arc<Semaphore>>,
}

/// Observations across all sessions.
#[derive(Default)]
pub struct Probe {
    pub constructions: AtomicUsize,
    pub in_step: AtomicBool,
    pub overlaps: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
}

impl Probe {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

/// Marks the session busy for the duration of a step; records overlaps.
struct StepGuard<'a>(&'a Probe);

impl<'a> StepGuard<'a> {
    fn enter(probe: &'a Probe, call: String) -> Self {
        if probe.in_step.swap(true, Ordering::SeqCst) {
            probe.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        probe.calls.lock().unwrap().push(call);
        Self(probe)
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        self.0.in_step.store(false, Ordering::SeqCst);
    }
}

pub struct ScriptedSession {
    script: Arc<Script>,
    probe: Arc<Probe>,
    authenticated: bool,
}

#[async_trait]
impl AutomationSession for ScriptedSession {
    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn authenticate(&mut self) -> Result<(), SessionError> {
        let _guard = StepGuard::enter(&self.probe, "login".into());
        tokio::time::sleep(self.script.step_delay).await;
        self.authenticated = true;
        Ok(())
    }

    async fn search(&mut self, input: &JobInput) -> Result<Vec<Candidate>, SessionError> {
        let _guard = StepGuard::enter(&self.probe, format!("search:{}", input.describe()));
        if let Some(gate) = &self.script.search_gate {
            gate.acquire().await.unwrap().forget();
        }
        tokio::time::sleep(self.script.step_delay).await;
        Ok(self.script.candidates.clone())
    }

    async fn extract(
        &mut self,
        strategy: ExtractionStrategy,
        _candidate: &Candidate,
    ) -> Result<StrategyOutcome, SessionError> {
        let _guard = StepGuard::enter(&self.probe, format!("extract:{strategy}"));
        tokio::time::sleep(self.script.step_delay).await;
        Ok(self
            .script
            .outcomes
            .iter()
            .find(|(s, _)| *s == strategy)
            .map(|(_, o)| o.clone())
            .unwrap_or(StrategyOutcome::Empty))
    }

    async fn task_status(&self, _task: &RemoteTaskId) -> Result<RemoteTaskStatus, SessionError> {
        Ok(RemoteTaskStatus::Running { progress: None })
    }

    async fn shutdown(&mut self) {}
}

pub struct ScriptedFactory {
    pub script: Arc<Script>,
    pub probe: Arc<Probe>,
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn create(&self) -> Result<Box<dyn AutomationSession>, SessionError> {
        self.probe.constructions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            probe: Arc::clone(&self.probe),
            authenticated: false,
        }))
    }
}

pub struct TestEngine {
    pub engine: Arc<JobEngine>,
    pub backend: Arc<LibSqlBackend>,
    pub probe: Arc<Probe>,
    pub clock: Arc<ManualClock>,
}

pub fn candidates() -> Vec<Candidate> {
    vec![
        Candidate::new("Jan Andersson", "https://example.se/person/19370108-Jan_Andersson/a1"),
        Candidate::new("Jan Andersson", "https://example.se/person/19720301-Jan_Andersson/b2"),
    ]
}

/// Engine over an in-memory database, a manual clock and a scripted session.
pub async fn engine(script: Script, config: EngineConfig) -> TestEngine {
    let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let probe = Arc::new(Probe::default());
    let clock = Arc::new(ManualClock::new());
    let dyn_clock: Arc<dyn Clock> = clock.clone();

    let factory = ScriptedFactory {
        script: Arc::new(script),
        probe: Arc::clone(&probe),
    };
    let sessions = Arc::new(SessionManager::new(
        Arc::new(factory),
        Arc::clone(&dyn_clock),
        config.session_idle_timeout,
    ));
    let store: Arc<dyn JobStore> = backend.clone();
    let registry = JobRegistry::new(Some(store));

    let engine = Arc::new(JobEngine::new(
        &config,
        registry,
        sessions,
        backend.clone(),
        Arc::new(BirthYearRule),
        dyn_clock,
    ));

    TestEngine {
        engine,
        backend,
        probe,
        clock,
    }
}

pub fn input(name: &str) -> JobInput {
    JobInput::new(serde_json::json!({ "name": name }))
}
