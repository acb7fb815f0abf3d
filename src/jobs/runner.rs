//! Job runner: drives one job through the extraction pipeline.
//!
//! Steps, each recorded on the job before it starts:
//!
//! 1. acquire the session (exclusive lease for the whole run)
//! 2. authenticate, once per session lifetime
//! 3. resolve the target through search + disambiguation
//! 4. try the configured extraction strategies in order
//! 5. persist the winning result
//!
//! Cancellation is checked between steps. A session-level error rebuilds the
//! session and retries the current step once. Whatever happens, the job ends
//! Completed or Failed when [`JobRunner::run`] returns.

use std::sync::Arc;

use tracing::{info, warn};

use super::model::{JobId, JobInput, JobStatus};
use super::registry::JobRegistry;
use super::strategy::{
    Candidate, Disambiguator, ExtractionStrategy, Extracted, RemoteTaskId, RemoteTaskStatus,
    StrategyOutcome, has_content,
};
use crate::clock::Clock;
use crate::error::{DatabaseError, JobError, SessionError};
use crate::poller::{PollOptions, poll_until};
use crate::session::{AutomationSession, SessionLease, SessionManager};
use crate::store::ResultSink;

const STEP_ACQUIRE: u32 = 1;
const STEP_AUTHENTICATE: u32 = 2;
const STEP_RESOLVE: u32 = 3;
const STEP_EXTRACT: u32 = 4;
const STEP_PERSIST: u32 = 5;

/// Progress band covered by the strategy attempts.
const EXTRACT_PROGRESS_START: u8 = 45;
const EXTRACT_PROGRESS_SPAN: u8 = 40;

/// Why a run ended in failure. `Display` is what ends up in `job.error`.
#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("Extraction: {0}")]
    Extraction(String),

    #[error("Session: {0}")]
    Session(#[from] SessionError),

    #[error("Persistence: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal: {0}")]
    Registry(#[from] JobError),

    #[error("Internal: {0}")]
    Internal(String),
}

/// One session-bound unit of pipeline work; retried as a whole on session loss.
enum Step<'a> {
    Authenticate,
    Search(&'a JobInput),
    Extract(ExtractionStrategy, &'a Candidate),
}

impl Step<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::Search(_) => "search",
            Self::Extract(..) => "extract",
        }
    }
}

enum StepOutput {
    Authenticated,
    Candidates(Vec<Candidate>),
    /// Strategy data, `None` when the strategy came up empty.
    Data(Option<serde_json::Value>),
}

pub struct JobRunner {
    registry: Arc<JobRegistry>,
    sessions: Arc<SessionManager>,
    results: Arc<dyn ResultSink>,
    disambiguator: Arc<dyn Disambiguator>,
    clock: Arc<dyn Clock>,
    strategies: Vec<ExtractionStrategy>,
    poll: PollOptions,
}

impl JobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        sessions: Arc<SessionManager>,
        results: Arc<dyn ResultSink>,
        disambiguator: Arc<dyn Disambiguator>,
        clock: Arc<dyn Clock>,
        strategies: Vec<ExtractionStrategy>,
        poll: PollOptions,
    ) -> Self {
        Self {
            registry,
            sessions,
            results,
            disambiguator,
            clock,
            strategies,
            poll,
        }
    }

    /// Run the job to a terminal status and return it.
    ///
    /// The pipeline runs in its own task, so a panic inside a session
    /// implementation fails the job instead of unwinding into the caller.
    pub async fn run(self: Arc<Self>, id: JobId) -> JobStatus {
        let runner = Arc::clone(&self);
        let outcome = tokio::spawn(async move { runner.execute(id).await }).await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(join) if join.is_panic() => {
                let payload = join.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Some(format!("Panicked: {message}"))
            }
            Err(join) => Some(format!("Cancelled: runner task aborted ({join})")),
        };

        if let Some(message) = failure {
            if let Err(e) = self.registry.update(id, |j| j.fail(message.as_str())).await {
                warn!(job_id = %id, error = %e, "Could not record job failure");
            }
        }

        match self.registry.get(id).await {
            Ok(job) => job.status,
            Err(_) => JobStatus::Failed,
        }
    }

    async fn execute(&self, id: JobId) -> Result<(), RunError> {
        let job = self.registry.get(id).await?;
        if job.cancel_requested {
            return Err(RunError::Cancelled("cancelled before start".to_string()));
        }
        let input = job.input;
        self.registry.update(id, |j| j.start()).await?;
        info!(job_id = %id, target = %input.describe(), "Job started");

        self.progress(id, STEP_ACQUIRE, 5, "Acquiring session").await?;
        let mut lease = match self.sessions.acquire().await {
            Ok(lease) => lease,
            Err(e) if e.is_session_level() => {
                warn!(job_id = %id, error = %e, "Session unavailable, retrying acquisition once");
                self.sessions.acquire().await?
            }
            Err(e) => return Err(e.into()),
        };

        self.checkpoint(id, "authenticate").await?;
        self.progress(id, STEP_AUTHENTICATE, 15, "Authenticating").await?;
        self.perform(id, &mut lease, Step::Authenticate).await?;

        self.checkpoint(id, "resolve").await?;
        self.progress(id, STEP_RESOLVE, 30, "Resolving target").await?;
        let candidates = match self.perform(id, &mut lease, Step::Search(&input)).await? {
            StepOutput::Candidates(candidates) => candidates,
            _ => {
                return Err(RunError::Internal(
                    "search step produced no candidate list".to_string(),
                ));
            }
        };
        let candidate = self
            .disambiguator
            .select(&input, &candidates)
            .and_then(|i| candidates.get(i).cloned())
            .ok_or_else(|| {
                RunError::NotFound(format!(
                    "no record matched '{}' ({} candidates)",
                    input.describe(),
                    candidates.len()
                ))
            })?;
        info!(job_id = %id, candidate = %candidate.label, "Target resolved");

        let extracted = self.extract(id, &mut lease, candidate).await?;
        lease.release();

        self.checkpoint(id, "persist").await?;
        self.progress(id, STEP_PERSIST, 90, "Saving result").await?;
        let result_id = self.results.save_result(id, &extracted).await?;

        self.registry
            .update(id, |j| j.complete(result_id.as_str()))
            .await?;
        Ok(())
    }

    /// Try each strategy in order; the first non-empty result wins.
    async fn extract(
        &self,
        id: JobId,
        lease: &mut SessionLease,
        candidate: Candidate,
    ) -> Result<Extracted, RunError> {
        let total = self.strategies.len().max(1);
        for (i, strategy) in self.strategies.iter().copied().enumerate() {
            self.checkpoint(id, strategy.as_str()).await?;
            let progress = EXTRACT_PROGRESS_START + (EXTRACT_PROGRESS_SPAN as usize * i / total) as u8;
            self.progress(id, STEP_EXTRACT, progress, format!("Extracting ({strategy})"))
                .await?;
            info!(job_id = %id, %strategy, attempt = i + 1, "Trying extraction strategy");

            match self.perform(id, lease, Step::Extract(strategy, &candidate)).await {
                Ok(StepOutput::Data(Some(data))) => {
                    info!(job_id = %id, %strategy, "Extraction strategy produced a result");
                    return Ok(Extracted {
                        strategy,
                        candidate,
                        data,
                    });
                }
                Ok(_) => info!(job_id = %id, %strategy, "Extraction strategy came up empty"),
                // A step-local failure only rules out this strategy.
                Err(RunError::Session(e)) if !e.is_session_level() => {
                    warn!(job_id = %id, %strategy, error = %e, "Extraction strategy failed");
                }
                Err(e) => return Err(e),
            }
        }

        let tried: Vec<&str> = self.strategies.iter().map(|s| s.as_str()).collect();
        Err(RunError::Extraction(format!(
            "no strategy produced a result for '{}' (tried: {})",
            candidate.label,
            tried.join(", ")
        )))
    }

    /// Run a session step, rebuilding the session and retrying once if it was lost.
    async fn perform(
        &self,
        id: JobId,
        lease: &mut SessionLease,
        step: Step<'_>,
    ) -> Result<StepOutput, RunError> {
        let first = match self.attempt(lease, &step).await {
            Err(e) if e.is_session_level() => e,
            other => return other.map_err(RunError::from),
        };

        warn!(
            job_id = %id,
            step = step.name(),
            error = %first,
            "Session lost, rebuilding and retrying step once"
        );
        lease.recycle().await?;
        if !matches!(step, Step::Authenticate) {
            if let Err(e) = lease.ensure_authenticated().await {
                lease.close().await;
                return Err(e.into());
            }
        }

        match self.attempt(lease, &step).await {
            Ok(output) => Ok(output),
            Err(e) => {
                if e.is_session_level() {
                    lease.close().await;
                }
                Err(e.into())
            }
        }
    }

    async fn attempt(
        &self,
        lease: &mut SessionLease,
        step: &Step<'_>,
    ) -> Result<StepOutput, SessionError> {
        match step {
            Step::Authenticate => {
                lease.ensure_authenticated().await?;
                Ok(StepOutput::Authenticated)
            }
            Step::Search(input) => {
                let candidates = lease.session()?.search(input).await?;
                Ok(StepOutput::Candidates(candidates))
            }
            Step::Extract(strategy, candidate) => {
                let outcome = lease.session()?.extract(*strategy, candidate).await?;
                let data = match outcome {
                    StrategyOutcome::Ready(data) => Some(data),
                    StrategyOutcome::Empty => None,
                    StrategyOutcome::Pending(task) => {
                        self.await_remote(lease, *strategy, &task).await?
                    }
                };
                Ok(StepOutput::Data(data.filter(has_content)))
            }
        }
    }

    /// Wait for a remote task started by a strategy. A timeout or remote
    /// failure yields `None` so the next strategy gets its turn.
    async fn await_remote(
        &self,
        lease: &mut SessionLease,
        strategy: ExtractionStrategy,
        task: &RemoteTaskId,
    ) -> Result<Option<serde_json::Value>, SessionError> {
        let session: &dyn AutomationSession = lease.session()?;
        info!(%strategy, task = %task, "Waiting for remote task");

        let waited = poll_until(
            self.clock.as_ref(),
            move || session.task_status(task),
            |status: &Result<RemoteTaskStatus, SessionError>| {
                status.as_ref().map_or(true, RemoteTaskStatus::is_terminal)
            },
            self.poll,
        )
        .await;

        match waited {
            Ok(Ok(RemoteTaskStatus::Done { data })) => Ok(Some(data)),
            Ok(Ok(RemoteTaskStatus::Failed { reason })) => {
                warn!(%strategy, task = %task, reason = %reason, "Remote task failed");
                Ok(None)
            }
            Ok(Ok(RemoteTaskStatus::Running { .. })) => Ok(None),
            Ok(Err(e)) => Err(e),
            Err(timeout) => {
                warn!(%strategy, task = %task, error = %timeout, "Remote task wait timed out");
                Ok(None)
            }
        }
    }

    async fn progress(
        &self,
        id: JobId,
        step_index: u32,
        progress: u8,
        message: impl Into<String>,
    ) -> Result<(), RunError> {
        let message = message.into();
        self.registry
            .update(id, |j| j.advance(step_index, progress, message))
            .await?;
        Ok(())
    }

    /// Stop here if cancellation was requested.
    async fn checkpoint(&self, id: JobId, next_step: &str) -> Result<(), RunError> {
        if self.registry.get(id).await?.cancel_requested {
            info!(job_id = %id, next_step, "Job cancelled");
            return Err(RunError::Cancelled(format!("stopped before {next_step}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::model::Job;
    use crate::jobs::strategy::BirthYearRule;
    use crate::session::SessionFactory;

    /// How `search` misbehaves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum SearchFault {
        None,
        LoseOnce,
        LoseAlways,
        Panic,
    }

    /// Scripted session: answers per strategy, optional faults in search.
    struct FakeSession {
        authenticated: bool,
        search_fault: Arc<Mutex<SearchFault>>,
        outcomes: Vec<(ExtractionStrategy, StrategyOutcome)>,
        remote: Option<RemoteTaskStatus>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AutomationSession for FakeSession {
        fn is_authenticated(&self) -> bool {
            self.authenticated
        }
        async fn authenticate(&mut self) -> Result<(), SessionError> {
            self.calls.lock().unwrap().push("login".into());
            self.authenticated = true;
            Ok(())
        }
        async fn search(&mut self, _input: &JobInput) -> Result<Vec<Candidate>, SessionError> {
            self.calls.lock().unwrap().push("search".into());
            let fault = *self.search_fault.lock().unwrap();
            match fault {
                SearchFault::None => {}
                SearchFault::LoseOnce => {
                    *self.search_fault.lock().unwrap() = SearchFault::None;
                    return Err(SessionError::Lost("logged out".into()));
                }
                SearchFault::LoseAlways => return Err(SessionError::Lost("logged out".into())),
                SearchFault::Panic => panic!("automation crashed"),
            }
            Ok(vec![
                Candidate::new("Jan Andersson", "/19370108-Jan_Andersson/a"),
                Candidate::new("Jan Andersson", "/19720301-Jan_Andersson/b"),
            ])
        }
        async fn extract(
            &mut self,
            strategy: ExtractionStrategy,
            candidate: &Candidate,
        ) -> Result<StrategyOutcome, SessionError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("extract:{strategy}:{}", candidate.locator));
            Ok(self
                .outcomes
                .iter()
                .find(|(s, _)| *s == strategy)
                .map(|(_, o)| o.clone())
                .unwrap_or(StrategyOutcome::Empty))
        }
        async fn task_status(&self, _task: &RemoteTaskId) -> Result<RemoteTaskStatus, SessionError> {
            Ok(self
                .remote
                .clone()
                .unwrap_or(RemoteTaskStatus::Running { progress: Some(10) }))
        }
        async fn shutdown(&mut self) {}
    }

    struct FakeFactory {
        search_fault: Arc<Mutex<SearchFault>>,
        /// Constructions that fail before one succeeds.
        failing_creates: Arc<Mutex<u32>>,
        creates: Arc<Mutex<u32>>,
        outcomes: Vec<(ExtractionStrategy, StrategyOutcome)>,
        remote: Option<RemoteTaskStatus>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn create(&self) -> Result<Box<dyn AutomationSession>, SessionError> {
            *self.creates.lock().unwrap() += 1;
            {
                let mut failing = self.failing_creates.lock().unwrap();
                if *failing > 0 {
                    *failing -= 1;
                    return Err(SessionError::Construction("browser did not start".into()));
                }
            }
            Ok(Box::new(FakeSession {
                authenticated: false,
                search_fault: Arc::clone(&self.search_fault),
                outcomes: self.outcomes.clone(),
                remote: self.remote.clone(),
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    struct MemorySink;

    #[async_trait]
    impl ResultSink for MemorySink {
        async fn save_result(
            &self,
            job_id: JobId,
            extracted: &Extracted,
        ) -> Result<String, DatabaseError> {
            Ok(format!("{job_id}:{}", extracted.strategy))
        }
    }

    struct Harness {
        runner: Arc<JobRunner>,
        registry: Arc<JobRegistry>,
        sessions: Arc<SessionManager>,
        calls: Arc<Mutex<Vec<String>>>,
        failing_creates: Arc<Mutex<u32>>,
        creates: Arc<Mutex<u32>>,
    }

    fn harness(
        outcomes: Vec<(ExtractionStrategy, StrategyOutcome)>,
        remote: Option<RemoteTaskStatus>,
        search_fault: SearchFault,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let failing_creates = Arc::new(Mutex::new(0));
        let creates = Arc::new(Mutex::new(0));
        let factory = FakeFactory {
            search_fault: Arc::new(Mutex::new(search_fault)),
            failing_creates: Arc::clone(&failing_creates),
            creates: Arc::clone(&creates),
            outcomes,
            remote,
            calls: Arc::clone(&calls),
        };
        let registry = JobRegistry::new(None);
        let sessions = Arc::new(SessionManager::new(
            Arc::new(factory),
            clock.clone(),
            Duration::from_secs(600),
        ));
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::new(MemorySink),
            Arc::new(BirthYearRule),
            clock,
            vec![
                ExtractionStrategy::DocumentDownload,
                ExtractionStrategy::ProfileRead,
            ],
            PollOptions::new(Duration::from_secs(2), Duration::from_secs(10)),
        ));
        Harness {
            runner,
            registry,
            sessions,
            calls,
            failing_creates,
            creates,
        }
    }

    async fn submit(registry: &JobRegistry, input: serde_json::Value) -> JobId {
        registry.create(Job::new(JobInput::new(input))).await
    }

    #[tokio::test]
    async fn first_strategy_wins() {
        let h = harness(
            vec![(
                ExtractionStrategy::DocumentDownload,
                StrategyOutcome::Ready(serde_json::json!({"income": 412000})),
            )],
            None,
            SearchFault::None,
        );
        let id = submit(&h.registry, serde_json::json!({"name": "Jan Andersson"})).await;

        assert_eq!(Arc::clone(&h.runner).run(id).await, JobStatus::Completed);
        let job = h.registry.get(id).await.unwrap();
        assert_eq!(job.progress, 100);
        assert_eq!(job.result, Some(format!("{id}:document_download")));
        assert!(job.outcome_is_consistent());
        assert!(
            !h.calls
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.starts_with("extract:profile_read"))
        );
    }

    #[tokio::test]
    async fn falls_back_to_next_strategy_in_order() {
        let h = harness(
            vec![
                (
                    ExtractionStrategy::DocumentDownload,
                    StrategyOutcome::Ready(serde_json::json!({})),
                ),
                (
                    ExtractionStrategy::ProfileRead,
                    StrategyOutcome::Ready(serde_json::json!({"income": 1})),
                ),
            ],
            None,
            SearchFault::None,
        );
        let id = submit(&h.registry, serde_json::json!({"name": "Jan"})).await;

        assert_eq!(Arc::clone(&h.runner).run(id).await, JobStatus::Completed);
        let calls = h.calls.lock().unwrap().clone();
        let extracts: Vec<&String> = calls.iter().filter(|c| c.starts_with("extract")).collect();
        assert_eq!(extracts.len(), 2);
        assert!(extracts[0].starts_with("extract:document_download"));
        assert!(extracts[1].starts_with("extract:profile_read"));
    }

    #[tokio::test]
    async fn birth_year_picks_candidate() {
        let h = harness(
            vec![(
                ExtractionStrategy::ProfileRead,
                StrategyOutcome::Ready(serde_json::json!({"income": 1})),
            )],
            None,
            SearchFault::None,
        );
        let id = submit(
            &h.registry,
            serde_json::json!({"name": "Jan Andersson", "birth_year": 1971}),
        )
        .await;

        Arc::clone(&h.runner).run(id).await;
        let calls = h.calls.lock().unwrap().clone();
        assert!(calls.iter().any(|c| c.ends_with("/19720301-Jan_Andersson/b")));
    }

    #[tokio::test]
    async fn exhausted_strategies_fail_with_extraction_error() {
        let h = harness(Vec::new(), None, SearchFault::None);
        let id = submit(&h.registry, serde_json::json!({"name": "Jan"})).await;

        assert_eq!(Arc::clone(&h.runner).run(id).await, JobStatus::Failed);
        let job = h.registry.get(id).await.unwrap();
        assert!(job.error.unwrap().starts_with("Extraction:"));
        assert!(job.progress >= EXTRACT_PROGRESS_START);
    }

    #[tokio::test]
    async fn pending_task_is_awaited() {
        let h = harness(
            vec![(
                ExtractionStrategy::DocumentDownload,
                StrategyOutcome::Pending(RemoteTaskId("t-1".into())),
            )],
            Some(RemoteTaskStatus::Done {
                data: serde_json::json!({"pdf": "report.pdf"}),
            }),
            SearchFault::None,
        );
        let id = submit(&h.registry, serde_json::json!({"name": "Jan"})).await;

        assert_eq!(Arc::clone(&h.runner).run(id).await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn remote_timeout_moves_to_next_strategy() {
        let h = harness(
            vec![
                (
                    ExtractionStrategy::DocumentDownload,
                    StrategyOutcome::Pending(RemoteTaskId("t-1".into())),
                ),
                (
                    ExtractionStrategy::ProfileRead,
                    StrategyOutcome::Ready(serde_json::json!({"income": 2})),
                ),
            ],
            None,
            SearchFault::None,
        );
        let id = submit(&h.registry, serde_json::json!({"name": "Jan"})).await;

        assert_eq!(Arc::clone(&h.runner).run(id).await, JobStatus::Completed);
        let job = h.registry.get(id).await.unwrap();
        assert_eq!(job.result, Some(format!("{id}:profile_read")));
    }

    #[tokio::test]
    async fn lost_session_is_rebuilt_and_step_retried() {
        let h = harness(
            vec![(
                ExtractionStrategy::DocumentDownload,
                StrategyOutcome::Ready(serde_json::json!({"income": 3})),
            )],
            None,
            SearchFault::LoseOnce,
        );
        let id = submit(&h.registry, serde_json::json!({"name": "Jan"})).await;

        assert_eq!(Arc::clone(&h.runner).run(id).await, JobStatus::Completed);
        assert_eq!(h.sessions.constructions(), 2);
        let calls = h.calls.lock().unwrap().clone();
        assert_eq!(calls[..4], ["login", "search", "login", "search"]);
    }

    #[tokio::test]
    async fn session_lost_again_on_retry_fails_job_and_closes_session() {
        let h = harness(Vec::new(), None, SearchFault::LoseAlways);
        let id = submit(&h.registry, serde_json::json!({"name": "Jan"})).await;

        assert_eq!(Arc::clone(&h.runner).run(id).await, JobStatus::Failed);
        let job = h.registry.get(id).await.unwrap();
        assert!(job.error.as_deref().unwrap().starts_with("Session:"));
        assert!(job.outcome_is_consistent());

        assert_eq!(h.sessions.constructions(), 2);
        assert!(!h.sessions.snapshot().has_session);
        let calls = h.calls.lock().unwrap().clone();
        assert_eq!(calls, ["login", "search", "login", "search"]);
    }

    #[tokio::test]
    async fn panicking_session_fails_job() {
        let h = harness(Vec::new(), None, SearchFault::Panic);
        let id = submit(&h.registry, serde_json::json!({"name": "Jan"})).await;

        assert_eq!(Arc::clone(&h.runner).run(id).await, JobStatus::Failed);
        let job = h.registry.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Panicked: automation crashed"));

        // The lease went away with the panicking task.
        assert!(!h.sessions.snapshot().busy);
        assert!(h.sessions.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn failed_construction_is_retried_once() {
        let h = harness(
            vec![(
                ExtractionStrategy::ProfileRead,
                StrategyOutcome::Ready(serde_json::json!({"income": 4})),
            )],
            None,
            SearchFault::None,
        );
        *h.failing_creates.lock().unwrap() = 1;
        let id = submit(&h.registry, serde_json::json!({"name": "Jan"})).await;

        assert_eq!(Arc::clone(&h.runner).run(id).await, JobStatus::Completed);
        assert_eq!(*h.creates.lock().unwrap(), 2);
        assert_eq!(h.sessions.constructions(), 1);
    }

    #[tokio::test]
    async fn repeated_construction_failure_fails_job() {
        let h = harness(Vec::new(), None, SearchFault::None);
        *h.failing_creates.lock().unwrap() = 2;
        let id = submit(&h.registry, serde_json::json!({"name": "Jan"})).await;

        assert_eq!(Arc::clone(&h.runner).run(id).await, JobStatus::Failed);
        let job = h.registry.get(id).await.unwrap();
        assert!(job.error.unwrap().starts_with("Session:"));
        assert_eq!(*h.creates.lock().unwrap(), 2);
        assert_eq!(h.sessions.constructions(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let h = harness(Vec::new(), None, SearchFault::None);
        let id = submit(&h.registry, serde_json::json!({"name": "Jan"})).await;
        h.registry.update(id, |j| j.request_cancel()).await.unwrap();

        assert_eq!(Arc::clone(&h.runner).run(id).await, JobStatus::Failed);
        let job = h.registry.get(id).await.unwrap();
        assert!(job.error.unwrap().starts_with("Cancelled:"));
        assert_eq!(h.sessions.constructions(), 0);
    }

    #[tokio::test]
    async fn unmatched_target_is_not_found() {
        let h = harness(Vec::new(), None, SearchFault::None);
        let id = submit(&h.registry, serde_json::json!({"name": "Nobody"})).await;

        struct NoMatch;
        impl Disambiguator for NoMatch {
            fn select(&self, _input: &JobInput, _candidates: &[Candidate]) -> Option<usize> {
                None
            }
        }
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&h.registry),
            Arc::clone(&h.sessions),
            Arc::new(MemorySink),
            Arc::new(NoMatch),
            Arc::new(ManualClock::new()),
            vec![ExtractionStrategy::ProfileRead],
            PollOptions::new(Duration::from_secs(1), Duration::from_secs(2)),
        ));

        assert_eq!(runner.run(id).await, JobStatus::Failed);
        let job = h.registry.get(id).await.unwrap();
        assert!(job.error.unwrap().starts_with("NotFound:"));
        assert_eq!(job.progress, 30);
    }
}
